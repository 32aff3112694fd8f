//! Schedule triggers: the timer callbacks that produce scheduled work.

use crate::config::{ClampWarning, DuplicatePolicy};
use crate::error::Result;
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::tasks::{MANUAL_BACKUP_PREFIX, SCHEDULED_BACKUP_PREFIX, TaskRecord};
use crate::scheduler::timer::{JobFn, JobOptions, TimerRegistry};
use crate::state::{self, SharedState};
use crate::status::StatusTracker;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timer id of the backup schedule.
pub const BACKUP_JOB_ID: &str = "BackupJob";

/// Timer id of the connectivity-check schedule.
pub const CONNECTIVITY_JOB_ID: &str = "ConnectivityCheckJob";

/// Result of a backup tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Enqueued,
    /// A backup was already running or queued and the policy skips duplicates.
    SkippedPending,
}

/// State shared by the timer callbacks.
struct Producers {
    queue: Arc<TaskQueue>,
    state: SharedState,
    status: StatusTracker,
    policy: DuplicatePolicy,
    max_queue_size: usize,
    last_enqueue: Mutex<Option<DateTime<Utc>>>,
}

impl Producers {
    fn backup_pending(&self) -> bool {
        [SCHEDULED_BACKUP_PREFIX, MANUAL_BACKUP_PREFIX]
            .iter()
            .any(|prefix| self.status.has_prefix(prefix) || self.queue.has_prefix(prefix))
    }

    fn backup_tick(&self) -> TickOutcome {
        *self.last_enqueue.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        if self.policy == DuplicatePolicy::SkipIfPending && self.backup_pending() {
            info!("scheduled backup skipped: a backup is already running or queued");
            return TickOutcome::SkippedPending;
        }

        let eligible = state::lock(&self.state).eligible_count();
        self.queue.enqueue_unbounded(TaskRecord::backup_all(eligible));
        info!(eligible, "scheduled backup enqueued");
        TickOutcome::Enqueued
    }

    fn connectivity_tick(&self) -> bool {
        let queued = self
            .queue
            .enqueue_bounded(TaskRecord::connectivity_check(), self.max_queue_size);
        if queued {
            debug!("connectivity check enqueued");
        } else {
            warn!(max = self.max_queue_size, "queue full, connectivity check skipped");
        }
        queued
    }

    fn force_enqueue_at(&self, reason: &str, now: DateTime<Utc>) -> bool {
        let already_pending = self.status.has_prefix(SCHEDULED_BACKUP_PREFIX)
            || self.queue.has_prefix(SCHEDULED_BACKUP_PREFIX);
        *self.last_enqueue.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);

        let eligible = {
            let mut guard = state::lock(&self.state);
            guard.log_activity(format!("{reason} => scheduled backup enqueued"));
            guard.eligible_count()
        };
        self.queue.enqueue_unbounded(TaskRecord::backup_all(eligible));
        already_pending
    }
}

/// Registers the schedule timers and owns the drift timestamp.
#[derive(Clone)]
pub struct Triggers {
    producers: Arc<Producers>,
    timers: Arc<dyn TimerRegistry>,
    misfire_grace: Duration,
}

impl Triggers {
    pub fn new(
        queue: Arc<TaskQueue>,
        state: SharedState,
        status: StatusTracker,
        timers: Arc<dyn TimerRegistry>,
        policy: DuplicatePolicy,
        max_queue_size: usize,
        misfire_grace: Duration,
    ) -> Self {
        Self {
            producers: Arc::new(Producers {
                queue,
                state,
                status,
                policy,
                max_queue_size,
                last_enqueue: Mutex::new(None),
            }),
            timers,
            misfire_grace,
        }
    }

    /// (Re)register both schedule timers from the current schedule.
    ///
    /// Existing registrations are removed first; a disabled schedule stays
    /// unregistered. Returns the clamp warnings applied to the intervals.
    ///
    /// # Errors
    ///
    /// Propagates a registry failure.
    pub fn register_all(&self) -> Result<Vec<ClampWarning>> {
        let (schedule, warnings) = state::lock(&self.producers.state).schedule.normalized();
        for warning in &warnings {
            warn!("{warning}");
        }

        self.unregister_all();
        let options = JobOptions {
            max_instances: 1,
            misfire_grace: self.misfire_grace,
            coalesce: true,
        };

        if schedule.check_enabled {
            let producers = self.producers.clone();
            let job: JobFn = Arc::new(move || {
                producers.connectivity_tick();
            });
            self.timers
                .register(CONNECTIVITY_JOB_ID, schedule.check_interval(), options, job)?;
            info!(
                every = schedule.check_value,
                unit = %schedule.check_unit,
                "connectivity check scheduled"
            );
        }

        if schedule.backup_enabled {
            let producers = self.producers.clone();
            let job: JobFn = Arc::new(move || {
                producers.backup_tick();
            });
            self.timers
                .register(BACKUP_JOB_ID, schedule.backup_interval(), options, job)?;
            info!(
                every = schedule.backup_value,
                unit = %schedule.backup_unit,
                "backup scheduled"
            );
        }

        Ok(warnings)
    }

    pub fn unregister_all(&self) {
        self.timers.unregister(BACKUP_JOB_ID);
        self.timers.unregister(CONNECTIVITY_JOB_ID);
    }

    /// What the backup timer does on each tick.
    pub fn backup_tick(&self) -> TickOutcome {
        self.producers.backup_tick()
    }

    /// What the connectivity timer does on each tick. `false` when the
    /// queue was full.
    pub fn connectivity_tick(&self) -> bool {
        self.producers.connectivity_tick()
    }

    /// Enqueue a scheduled backup regardless of policy and refresh the drift
    /// timestamp. Returns `true` when one was already running or queued.
    pub fn force_enqueue_backup(&self, reason: &str) -> bool {
        self.producers.force_enqueue_at(reason, Utc::now())
    }

    pub(crate) fn force_enqueue_backup_at(&self, reason: &str, now: DateTime<Utc>) -> bool {
        self.producers.force_enqueue_at(reason, now)
    }

    /// When a backup tick last fired (or was forced).
    pub fn last_enqueue_time(&self) -> Option<DateTime<Utc>> {
        *self
            .producers
            .last_enqueue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_last_enqueue_time(&self, at: Option<DateTime<Utc>>) {
        *self
            .producers
            .last_enqueue
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn is_backup_registered(&self) -> bool {
        self.timers.is_registered(BACKUP_JOB_ID)
    }

    pub fn next_backup_time(&self) -> Option<DateTime<Utc>> {
        self.timers.next_run_time(BACKUP_JOB_ID)
    }

    pub fn next_check_time(&self) -> Option<DateTime<Utc>> {
        self.timers.next_run_time(CONNECTIVITY_JOB_ID)
    }

    pub(crate) fn state(&self) -> &SharedState {
        &self.producers.state
    }

    pub(crate) fn timers(&self) -> &Arc<dyn TimerRegistry> {
        &self.timers
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::{ScheduleConfig, ScheduleTarget, ScheduleUnit};
    use crate::scheduler::tasks::{PRIORITY_HIGH, TaskKind};
    use crate::scheduler::timer::test_support::ManualTimerRegistry;
    use crate::state::AppState;

    struct Fixture {
        queue: Arc<TaskQueue>,
        status: StatusTracker,
        timers: Arc<ManualTimerRegistry>,
        triggers: Triggers,
    }

    fn fixture(schedule: ScheduleConfig, policy: DuplicatePolicy) -> Fixture {
        let mut state = AppState {
            schedule,
            ..AppState::default()
        };
        for name in ["rack-1", "rack-2", "rack-3"] {
            state.add_console(name, &format!("https://{name}")).unwrap();
        }
        state.toggle_exclude(3).unwrap();

        let queue = Arc::new(TaskQueue::new());
        let status = StatusTracker::new();
        let timers = Arc::new(ManualTimerRegistry::default());
        let triggers = Triggers::new(
            queue.clone(),
            state::shared(state),
            status.clone(),
            timers.clone(),
            policy,
            2,
            Duration::from_secs(60),
        );
        Fixture {
            queue,
            status,
            timers,
            triggers,
        }
    }

    #[test]
    fn minute_interval_is_clamped_at_registration() {
        let schedule = ScheduleConfig {
            backup_value: 5,
            backup_unit: ScheduleUnit::Minutes,
            ..ScheduleConfig::default()
        };
        let f = fixture(schedule, DuplicatePolicy::Stack);

        let warnings = f.triggers.register_all().unwrap();

        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].target, ScheduleTarget::Backup);
        assert_eq!(warnings[0].applied, 15);
        assert_eq!(
            f.timers.interval(BACKUP_JOB_ID),
            Some(Duration::from_secs(15 * 60))
        );
        assert_eq!(
            f.timers.interval(CONNECTIVITY_JOB_ID),
            Some(Duration::from_secs(4 * 3600))
        );
    }

    #[test]
    fn registration_is_idempotent_and_honours_disabled() {
        let schedule = ScheduleConfig {
            check_enabled: false,
            ..ScheduleConfig::default()
        };
        let f = fixture(schedule, DuplicatePolicy::Stack);

        f.triggers.register_all().unwrap();
        f.triggers.register_all().unwrap();

        assert!(f.triggers.is_backup_registered());
        assert!(!f.timers.is_registered(CONNECTIVITY_JOB_ID));
        let options = f.timers.options(BACKUP_JOB_ID).unwrap();
        assert_eq!(options.max_instances, 1);
        assert_eq!(options.misfire_grace, Duration::from_secs(60));
    }

    #[test]
    fn backup_timer_enqueues_high_priority_run() {
        let f = fixture(ScheduleConfig::default(), DuplicatePolicy::Stack);
        f.triggers.register_all().unwrap();

        assert!(f.timers.fire(BACKUP_JOB_ID));

        let pending = f.queue.snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TaskKind::BackupAll);
        assert_eq!(pending[0].priority, PRIORITY_HIGH);
        assert_eq!(pending[0].total_items, 2);
        assert!(f.triggers.last_enqueue_time().is_some());
    }

    #[test]
    fn stack_policy_always_enqueues() {
        let f = fixture(ScheduleConfig::default(), DuplicatePolicy::Stack);
        f.status.start(&TaskRecord::backup_all(2));

        assert_eq!(f.triggers.backup_tick(), TickOutcome::Enqueued);
        assert_eq!(f.triggers.backup_tick(), TickOutcome::Enqueued);
        assert_eq!(f.queue.len(), 2);
    }

    #[test]
    fn skip_policy_skips_but_refreshes_timestamp() {
        let f = fixture(ScheduleConfig::default(), DuplicatePolicy::SkipIfPending);

        assert_eq!(f.triggers.backup_tick(), TickOutcome::Enqueued);
        let stale = Utc::now() - chrono::Duration::hours(3);
        f.triggers.set_last_enqueue_time(Some(stale));

        assert_eq!(f.triggers.backup_tick(), TickOutcome::SkippedPending);
        assert_eq!(f.queue.len(), 1);
        assert!(f.triggers.last_enqueue_time().unwrap() > stale);
    }

    #[test]
    fn skip_policy_also_defers_to_manual_backups() {
        let f = fixture(ScheduleConfig::default(), DuplicatePolicy::SkipIfPending);
        f.status.start(&TaskRecord::manual_backup(1, "rack-1"));

        assert_eq!(f.triggers.backup_tick(), TickOutcome::SkippedPending);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn connectivity_tick_respects_bound() {
        let f = fixture(ScheduleConfig::default(), DuplicatePolicy::Stack);

        assert!(f.triggers.connectivity_tick());
        assert!(f.triggers.connectivity_tick());
        assert!(!f.triggers.connectivity_tick());
        assert_eq!(f.queue.len(), 2);
    }

    #[test]
    fn force_enqueue_reports_pending_run() {
        let f = fixture(ScheduleConfig::default(), DuplicatePolicy::SkipIfPending);

        assert!(!f.triggers.force_enqueue_backup("Manual override"));
        assert!(f.triggers.force_enqueue_backup("Manual override"));
        assert_eq!(f.queue.len(), 2);
        let guard = state::lock(f.triggers.state());
        assert!(
            guard
                .activity
                .last()
                .unwrap()
                .message
                .starts_with("Manual override")
        );
    }

    #[test]
    fn unregister_all_clears_both_timers() {
        let f = fixture(ScheduleConfig::default(), DuplicatePolicy::Stack);
        f.triggers.register_all().unwrap();
        f.triggers.unregister_all();
        assert!(!f.triggers.is_backup_registered());
        assert!(f.triggers.next_check_time().is_none());
    }
}
