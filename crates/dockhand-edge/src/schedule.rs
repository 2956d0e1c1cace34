//! Scheduled jobs handed out by the controller.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use dockhand_core::Schedule;

use crate::error::ScheduleError;

/// Receives the schedule list of every successful poll.
#[async_trait]
pub trait ScheduleManager: Send + Sync {
    /// Replace the current set with `schedules`. Invalid entries are
    /// reported but must not prevent the valid ones from being applied.
    async fn apply(&self, schedules: &[Schedule]) -> Result<(), ScheduleError>;

    /// The set last applied, ordered by id.
    fn schedules(&self) -> Vec<Schedule>;
}

/// Keeps the applied schedule set in memory, keyed by id.
#[derive(Debug, Default)]
pub struct ScheduleRegistry {
    schedules: Mutex<BTreeMap<i64, Schedule>>,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A cron expression must have five whitespace separated fields.
fn validate(schedule: &Schedule) -> Result<(), ScheduleError> {
    if schedule.cron_expression.split_whitespace().count() == 5 {
        Ok(())
    } else {
        Err(ScheduleError::InvalidCron {
            id: schedule.id,
            expression: schedule.cron_expression.clone(),
        })
    }
}

#[async_trait]
impl ScheduleManager for ScheduleRegistry {
    async fn apply(&self, schedules: &[Schedule]) -> Result<(), ScheduleError> {
        let mut next = BTreeMap::new();
        let mut rejected = Vec::new();

        for schedule in schedules {
            match validate(schedule) {
                Ok(()) => {
                    next.insert(schedule.id, schedule.clone());
                }
                Err(e) => {
                    warn!(schedule_id = schedule.id, error = %e, "rejecting schedule");
                    rejected.push(e);
                }
            }
        }

        {
            let mut current = self.schedules.lock().unwrap_or_else(PoisonError::into_inner);
            for (id, schedule) in &next {
                match current.get(id) {
                    None => info!(schedule_id = id, cron = %schedule.cron_expression, "schedule added"),
                    Some(old) if old != schedule => {
                        info!(schedule_id = id, version = schedule.version, "schedule updated")
                    }
                    Some(_) => {}
                }
            }
            for id in current.keys().filter(|id| !next.contains_key(id)) {
                info!(schedule_id = id, "schedule removed");
            }
            *current = next;
            debug!(count = current.len(), "schedules applied");
        }

        match rejected.len() {
            0 => Ok(()),
            1 => Err(rejected.remove(0)),
            _ => Err(ScheduleError::Rejected(rejected)),
        }
    }

    fn schedules(&self) -> Vec<Schedule> {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
