//! Dead-man's switch for the backup schedule.
//!
//! Runs on its own fixed interval. If the backup timer registration has gone
//! missing it rebuilds all registrations; if backup ticks have been silent
//! for longer than one interval plus a grace period it forces an enqueue.

use crate::error::Result;
use crate::scheduler::timer::{JobFn, JobOptions};
use crate::scheduler::triggers::Triggers;
use crate::state;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Timer id of the watchdog itself.
pub const WATCHDOG_JOB_ID: &str = "WatchdogJob";

/// What one watchdog tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Backup scheduling is disabled.
    Disabled,
    /// The backup timer was missing and registrations were rebuilt.
    Rebuilt,
    /// Ticks were overdue and a backup was force-enqueued.
    Forced,
    Healthy,
}

#[derive(Clone)]
pub struct Watchdog {
    triggers: Triggers,
    grace: TimeDelta,
}

impl Watchdog {
    pub fn new(triggers: Triggers, grace: Duration) -> Self {
        Self {
            triggers,
            grace: TimeDelta::from_std(grace).unwrap_or(TimeDelta::minutes(1)),
        }
    }

    /// Register the watchdog's own timer.
    ///
    /// # Errors
    ///
    /// Propagates a registry failure.
    pub fn register(&self, interval: Duration, misfire_grace: Duration) -> Result<()> {
        let watchdog = self.clone();
        let job: JobFn = Arc::new(move || {
            watchdog.tick();
        });
        let options = JobOptions {
            max_instances: 1,
            misfire_grace,
            coalesce: true,
        };
        self.triggers
            .timers()
            .register(WATCHDOG_JOB_ID, interval, options, job)
    }

    pub fn tick(&self) -> WatchdogAction {
        self.tick_at(Utc::now())
    }

    /// Run one check as of `now`.
    pub fn tick_at(&self, now: DateTime<Utc>) -> WatchdogAction {
        let schedule = state::lock(self.triggers.state()).schedule.clone();
        if !schedule.backup_enabled {
            debug!("watchdog: backup scheduling disabled");
            return WatchdogAction::Disabled;
        }

        if !self.triggers.is_backup_registered() {
            warn!("watchdog: backup timer missing, rebuilding schedule");
            if let Err(e) = self.triggers.register_all() {
                error!("watchdog: cannot rebuild schedule: {e}");
            }
            return WatchdogAction::Rebuilt;
        }

        let Some(last) = self.triggers.last_enqueue_time() else {
            return WatchdogAction::Healthy;
        };
        let interval =
            TimeDelta::from_std(schedule.backup_interval()).unwrap_or(TimeDelta::MAX);
        let overdue = now - last;
        if overdue > interval.checked_add(&self.grace).unwrap_or(TimeDelta::MAX) {
            warn!(
                overdue_secs = overdue.num_seconds(),
                "watchdog: backup ticks overdue, forcing a run"
            );
            self.triggers.force_enqueue_backup_at("Watchdog", now);
            return WatchdogAction::Forced;
        }

        WatchdogAction::Healthy
    }
}
