//! The orchestrator context object.
//!
//! Constructed once at startup and shared by reference with every producer
//! (request handlers, timers, the watchdog). Owns the queue, the status
//! tracker, the worker thread and the schedule registrations.

use crate::config::{
    ClampWarning, CommandConfig, NotifyConfig, OrchestratorConfig, ScheduleConfig,
};
use crate::error::{OrchestratorError, Result};
use crate::executor::{
    BackupExecutor, CommandExecutor, CommandProbe, CommandReaper, NoopReaper, ProgramSpec,
    ResourceReaper, SessionProbe, UnconfiguredExecutor, UnconfiguredProbe,
};
use crate::notify::{FilteredNotifier, LogNotifier, Notifier};
use crate::retry::{Sleeper, ThreadSleeper};
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::runner::{RunHistory, TaskContext, TaskRunRecord, Worker};
use crate::scheduler::tasks::{SCHEDULED_BACKUP_PREFIX, TaskRecord};
use crate::scheduler::timer::TimerRegistry;
use crate::scheduler::triggers::Triggers;
use crate::scheduler::watchdog::Watchdog;
use crate::state::{self, AppState, SharedState};
use crate::status::{CurrentTaskStatus, StatusTracker};
use crate::store::{JsonFileStore, PersistenceStore};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Result of a bounded, user-triggered enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Rejected: the queue already holds `max` records.
    QueueFull { max: usize },
    /// Rejected: the orchestrator has shut down.
    Closed,
    /// Rejected: a console backup needs an authenticated session.
    NotLoggedIn,
}

impl EnqueueOutcome {
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// Collects collaborators before [`OrchestratorBuilder::start`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    state: AppState,
    store: Option<Arc<dyn PersistenceStore>>,
    executor: Arc<dyn BackupExecutor>,
    probe: Arc<dyn SessionProbe>,
    reaper: Arc<dyn ResourceReaper>,
    notifier: Arc<dyn Notifier>,
    sleeper: Arc<dyn Sleeper>,
    history: RunHistory,
    result_tx: Option<mpsc::UnboundedSender<TaskRunRecord>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            state: AppState::default(),
            store: None,
            executor: Arc::new(UnconfiguredExecutor),
            probe: Arc::new(UnconfiguredProbe),
            reaper: Arc::new(NoopReaper),
            notifier: Arc::new(LogNotifier),
            sleeper: Arc::new(ThreadSleeper),
            history: RunHistory::default(),
            result_tx: None,
        }
    }

    /// Initial application state, usually loaded from the store.
    pub fn with_state(mut self, state: AppState) -> Self {
        self.state = state;
        self
    }

    /// Defaults to a [`JsonFileStore`] at the configured state path.
    pub fn with_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn BackupExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn SessionProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_reaper(mut self, reaper: Arc<dyn ResourceReaper>) -> Self {
        self.reaper = reaper;
        self
    }

    /// Raw sink; it is wrapped in a [`FilteredNotifier`] on start.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_history_limit(mut self, max_entries: usize) -> Self {
        self.history = RunHistory::with_limit(max_entries);
        self
    }

    /// Publish every finished run on `tx`.
    pub fn with_result_channel(mut self, tx: mpsc::UnboundedSender<TaskRunRecord>) -> Self {
        self.result_tx = Some(tx);
        self
    }

    /// Use the external programs named in `commands`; unset entries keep
    /// the current collaborator.
    pub fn with_commands(mut self, commands: &CommandConfig) -> Self {
        let timeout = commands.timeout();
        let bounded = |argv: &[String]| {
            ProgramSpec::from_argv(argv).map(|spec| spec.with_timeout(timeout))
        };
        if let Some(program) = bounded(&commands.backup) {
            self.executor = Arc::new(CommandExecutor::new(program));
        }
        if let Some(program) = bounded(&commands.probe) {
            self.probe = Arc::new(CommandProbe::new(program));
        }
        if let Some(program) = bounded(&commands.cleanup) {
            self.reaper = Arc::new(CommandReaper::new(program));
        }
        self
    }

    /// Spawn the worker and register the schedule and watchdog timers.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned or a timer
    /// cannot be registered.
    pub fn start(self, timers: Arc<dyn TimerRegistry>) -> Result<Orchestrator> {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(JsonFileStore::new(config.state_path())));
        let state = state::shared(self.state);
        let status = StatusTracker::new();
        let queue = Arc::new(TaskQueue::new());

        let ctx = Arc::new(TaskContext {
            state: state.clone(),
            status: status.clone(),
            store: store.clone(),
            executor: self.executor,
            probe: self.probe,
            reaper: self.reaper,
            notifier: Arc::new(FilteredNotifier::new(self.notifier, state.clone())),
            sleeper: self.sleeper,
            retry_cooldown: config.retry.cooldown(),
        });
        let worker = Worker::spawn(queue.clone(), ctx, self.history.clone(), self.result_tx)?;

        let triggers = Triggers::new(
            queue.clone(),
            state.clone(),
            status.clone(),
            timers,
            config.duplicate_policy,
            config.max_queue_size,
            Duration::from_secs(config.timers.misfire_grace_secs),
        );
        let watchdog = Watchdog::new(
            triggers.clone(),
            Duration::from_secs(config.watchdog.grace_secs),
        );

        let orchestrator = Orchestrator {
            config,
            queue,
            status,
            state,
            store,
            history: self.history,
            triggers,
            watchdog,
            worker: Mutex::new(Some(worker)),
        };

        if let Err(e) = orchestrator.register_timers() {
            orchestrator.shutdown();
            return Err(e);
        }
        info!(
            policy = ?orchestrator.config.duplicate_policy,
            max_queue_size = orchestrator.config.max_queue_size,
            "orchestrator started"
        );
        Ok(orchestrator)
    }
}

/// Process-wide task orchestration context.
pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: Arc<TaskQueue>,
    status: StatusTracker,
    state: SharedState,
    store: Arc<dyn PersistenceStore>,
    history: RunHistory,
    triggers: Triggers,
    watchdog: Watchdog,
    worker: Mutex<Option<Worker>>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    fn register_timers(&self) -> Result<()> {
        self.triggers.register_all()?;
        let interval = Duration::from_secs(self.config.watchdog.interval_secs.max(1));
        self.watchdog.register(
            interval,
            Duration::from_secs(self.config.timers.misfire_grace_secs),
        )
    }

    fn persist(&self) -> Result<()> {
        let snapshot = state::lock(&self.state).clone();
        self.store.save(&snapshot)
    }

    fn enqueue_bounded(&self, record: TaskRecord) -> EnqueueOutcome {
        let max = self.config.max_queue_size;
        let name = record.name.clone();
        if self.queue.enqueue_bounded(record, max) {
            info!(task = %name, "task queued");
            EnqueueOutcome::Queued
        } else if self.queue.is_closed() {
            warn!(task = %name, "orchestrator stopped, task rejected");
            EnqueueOutcome::Closed
        } else {
            warn!(task = %name, max, "queue full, task rejected");
            EnqueueOutcome::QueueFull { max }
        }
    }

    // Producers.

    /// Queue a single-console backup. Refused with
    /// [`EnqueueOutcome::NotLoggedIn`] while the session is not authenticated.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ConsoleNotFound`] for an unknown id.
    pub fn enqueue_manual_backup(&self, console_id: u32) -> Result<EnqueueOutcome> {
        let name = {
            let mut guard = state::lock(&self.state);
            let name = guard
                .console(console_id)
                .map(|c| c.name.clone())
                .ok_or(OrchestratorError::ConsoleNotFound(console_id))?;
            if !guard.session_authenticated {
                guard.log_activity(format!(
                    "Manual backup => '{name}' => not queued => not logged in."
                ));
                warn!(console = %name, "manual backup rejected, session not authenticated");
                return Ok(EnqueueOutcome::NotLoggedIn);
            }
            name
        };
        Ok(self.enqueue_bounded(TaskRecord::manual_backup(console_id, &name)))
    }

    pub fn enqueue_cookie_test(&self) -> EnqueueOutcome {
        self.enqueue_bounded(TaskRecord::cookie_test())
    }

    pub fn enqueue_reset_processes(&self) -> EnqueueOutcome {
        self.enqueue_bounded(TaskRecord::reset_processes())
    }

    /// Run the scheduled backup now, ahead of default-priority work.
    /// Returns `true` when a scheduled run was already running or queued.
    pub fn start_schedule_now(&self) -> bool {
        self.triggers.force_enqueue_backup("Manual override")
    }

    /// Replace the schedule, persist it and re-register the timers.
    ///
    /// # Errors
    ///
    /// Propagates store and registry failures.
    pub fn update_schedule(&self, schedule: ScheduleConfig) -> Result<Vec<ClampWarning>> {
        let (normalized, warnings) = schedule.normalized();
        {
            let mut guard = state::lock(&self.state);
            guard.schedule = normalized;
            guard.log_activity("Schedule updated.");
        }
        self.persist()?;
        self.triggers.register_all()?;
        Ok(warnings)
    }

    /// Replace the notification preferences and persist them.
    ///
    /// # Errors
    ///
    /// Propagates a store failure.
    pub fn update_notify(&self, notify: NotifyConfig) -> Result<()> {
        state::lock(&self.state).notify = notify;
        self.persist()
    }

    /// Add a console and persist. Returns the new id.
    ///
    /// # Errors
    ///
    /// Rejects blank or duplicate entries; propagates a store failure.
    pub fn add_console(&self, name: &str, backup_url: &str) -> Result<u32> {
        let id = state::lock(&self.state).add_console(name, backup_url)?;
        self.persist()?;
        Ok(id)
    }

    /// Remove a console and persist. Returns `false` for an unknown id.
    ///
    /// # Errors
    ///
    /// Propagates a store failure.
    pub fn remove_console(&self, console_id: u32) -> Result<bool> {
        let removed = state::lock(&self.state).remove_console(console_id);
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Flip a console's schedule exclusion and persist. Returns the new value.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ConsoleNotFound`] for an unknown id.
    pub fn toggle_exclude(&self, console_id: u32) -> Result<bool> {
        let excluded = state::lock(&self.state)
            .toggle_exclude(console_id)
            .ok_or(OrchestratorError::ConsoleNotFound(console_id))?;
        self.persist()?;
        Ok(excluded)
    }

    // Observability.

    pub fn current_status(&self) -> CurrentTaskStatus {
        self.status.snapshot()
    }

    /// Pending records in dequeue order.
    pub fn queue_snapshot(&self) -> Vec<TaskRecord> {
        self.queue.snapshot()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queue.snapshot().into_iter().map(|r| r.name).collect()
    }

    pub fn queue_total_items(&self) -> u64 {
        self.queue.total_items()
    }

    /// Drop pending records whose name starts with `prefix`.
    pub fn purge_by_prefix(&self, prefix: &str) -> usize {
        let removed = self.queue.purge_by_prefix(prefix);
        if removed > 0 {
            state::lock(&self.state)
                .log_activity(format!("Purged {removed} queued task(s) matching '{prefix}'"));
        }
        removed
    }

    /// 1-based position of the first pending scheduled backup, if any.
    pub fn scheduled_queue_position(&self) -> Option<usize> {
        self.queue
            .snapshot()
            .iter()
            .position(TaskRecord::is_scheduled_backup)
            .map(|index| index + 1)
    }

    /// True when a scheduled backup is running or queued.
    pub fn scheduled_backup_pending(&self) -> bool {
        self.status.has_prefix(SCHEDULED_BACKUP_PREFIX)
            || self.queue.has_prefix(SCHEDULED_BACKUP_PREFIX)
    }

    pub fn next_backup_time(&self) -> Option<DateTime<Utc>> {
        self.triggers.next_backup_time()
    }

    pub fn next_check_time(&self) -> Option<DateTime<Utc>> {
        self.triggers.next_check_time()
    }

    pub fn run_history(&self) -> Vec<TaskRunRecord> {
        self.history.entries()
    }

    /// Consistent copy of the application state.
    pub fn state_snapshot(&self) -> AppState {
        state::lock(&self.state).clone()
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }

    pub fn triggers(&self) -> &Triggers {
        &self.triggers
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Stop producing, let the worker finish its current task and wait for
    /// it. Pending records are dropped. Idempotent.
    pub fn shutdown(&self) {
        self.triggers.timers().shutdown();
        self.queue.close();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            info!("waiting for task worker to finish");
            worker.join();
            if let Err(e) = self.persist() {
                warn!("cannot persist state on shutdown: {e}");
            }
            info!("orchestrator stopped");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
