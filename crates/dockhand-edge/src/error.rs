use thiserror::Error;

/// Opening or closing the reverse tunnel failed. The tunnel is left
/// closed and the next poll cycle retries.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("handshake with tunnel server {server} failed: {reason}")]
    Handshake { server: String, reason: String },

    #[error("tunnel server rejected registration: {0}")]
    Rejected(String),

    #[error("tunnel protocol error: {0}")]
    Protocol(String),

    #[error("tunnel teardown failed: {0}")]
    Teardown(String),

    #[error("tunnel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A poll cycle produced no usable directive.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("status request failed: {0}")]
    Transport(String),

    #[error("controller answered with status {0}")]
    Status(u16),

    #[error("invalid status response: {0}")]
    Decode(String),
}

/// Some schedules could not be applied. Valid ones are applied anyway.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule {id} has an invalid cron expression {expression:?}")]
    InvalidCron { id: i64, expression: String },

    #[error("{} schedules were rejected", .0.len())]
    Rejected(Vec<ScheduleError>),
}
