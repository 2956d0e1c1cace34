//! Edge mode for agents that sit behind NAT or a firewall.
//!
//! The agent never accepts connections from the controller directly.
//! Instead [`EdgeOperator`] polls the controller's status endpoint and,
//! when asked to, opens an outbound reverse tunnel through which the
//! controller reaches the local agent API.
//!
//! ```text
//!   controller ──status──▶ EdgeOperator ──▶ TunnelController ──▶ ReverseTunnelTransport
//!                               │                   ▲
//!                               ▼                   │ idle watchdog
//!                        ScheduleManager        ActivityTimer
//! ```

pub mod error;
pub mod poll;
pub mod reverse;
pub mod schedule;
pub mod tunnel;

pub use error::{PollError, ScheduleError, TunnelError};
pub use poll::{DEFAULT_POLL_TIMEOUT, EdgeOperator, HttpStatusClient, StatusSource};
pub use reverse::ReverseTunnelTransport;
pub use schedule::{ScheduleManager, ScheduleRegistry};
pub use tunnel::{ActivityTimer, TunnelController, TunnelSession, TunnelTransport};
