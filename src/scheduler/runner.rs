//! The single worker thread and the task bodies it dispatches to.
//!
//! The worker blocks on the queue, marks each record as the current task,
//! runs its body behind a panic boundary, resets the status and, when the
//! queue has drained, runs the idle cleanup hook. Completed runs are kept in
//! a bounded history and published on an optional result channel.

use crate::error::{OrchestratorError, Result};
use crate::executor::{BackupExecutor, ResourceReaper, SessionProbe};
use crate::notify::{Notifier, NotifyEvent, NotifyKind};
use crate::retry::{self, RetryOrchestrator, Sleeper};
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::tasks::{TaskKind, TaskRecord};
use crate::state::{self, SharedState};
use crate::status::StatusTracker;
use crate::store::PersistenceStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Number of run-history entries to keep.
const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Everything a task body may touch.
pub struct TaskContext {
    pub state: SharedState,
    pub status: StatusTracker,
    pub store: Arc<dyn PersistenceStore>,
    pub executor: Arc<dyn BackupExecutor>,
    pub probe: Arc<dyn SessionProbe>,
    pub reaper: Arc<dyn ResourceReaper>,
    pub notifier: Arc<dyn Notifier>,
    pub sleeper: Arc<dyn Sleeper>,
    /// Pause between retry passes.
    pub retry_cooldown: Duration,
}

impl TaskContext {
    /// Save a snapshot of the shared state. Failures are logged; the next
    /// successful save overwrites the file anyway.
    pub fn persist(&self) {
        let snapshot = state::lock(&self.state).clone();
        if let Err(e) = self.store.save(&snapshot) {
            error!("cannot persist state: {e}");
        }
    }

    /// Hand `event` to the notifier. Never called with the state lock held.
    pub fn notify(&self, event: &NotifyEvent) {
        self.notifier.notify(event);
    }

    fn log_activity(&self, message: impl Into<String>) {
        state::lock(&self.state).log_activity(message);
    }
}

/// How a task run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TaskRunOutcome {
    Success,
    Error(String),
    Panicked(String),
}

/// One entry of the worker's run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRunRecord {
    pub name: String,
    pub kind: TaskKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: TaskRunOutcome,
}

/// Bounded, shareable run history.
#[derive(Debug, Clone)]
pub struct RunHistory {
    entries: Arc<Mutex<Vec<TaskRunRecord>>>,
    limit: usize,
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl RunHistory {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            limit: limit.max(1),
        }
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<TaskRunRecord> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, run: TaskRunRecord) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(run);
        if entries.len() > self.limit {
            let drop_count = entries.len().saturating_sub(self.limit);
            entries.drain(0..drop_count);
        }
    }
}

/// Handle to the running worker thread.
pub struct Worker {
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker. It runs until the queue is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn the thread.
    pub fn spawn(
        queue: Arc<TaskQueue>,
        ctx: Arc<TaskContext>,
        history: RunHistory,
        result_tx: Option<mpsc::UnboundedSender<TaskRunRecord>>,
    ) -> Result<Self> {
        let handle = std::thread::Builder::new()
            .name("task-worker".to_owned())
            .spawn(move || {
                info!("task worker started");
                while let Some(record) = queue.dequeue() {
                    let run = run_one(&queue, &ctx, record);
                    history.push(run.clone());
                    if let Some(tx) = &result_tx
                        && tx.send(run).is_err()
                    {
                        debug!("task result channel closed");
                    }
                }
                info!("task worker stopped");
            })
            .map_err(|e| OrchestratorError::Task(format!("cannot spawn worker: {e}")))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the worker to exit. Close the queue first.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("task worker thread panicked");
        }
    }
}

/// Run one record end to end, including the idle cleanup check.
pub(crate) fn run_one(queue: &TaskQueue, ctx: &TaskContext, record: TaskRecord) -> TaskRunRecord {
    let started_at = Utc::now();
    ctx.status.start_at(&record, started_at);
    info!(task = %record.name, "task started");

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| execute(ctx, &record))) {
        Ok(Ok(())) => {
            info!(task = %record.name, "task finished");
            TaskRunOutcome::Success
        }
        Ok(Err(e)) => {
            error!(task = %record.name, "task failed: {e}");
            ctx.log_activity(format!("Task '{}' => ERROR: {e}", record.name));
            TaskRunOutcome::Error(e.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(task = %record.name, "task panicked: {message}");
            ctx.log_activity(format!("Task '{}' => ERROR: {message}", record.name));
            TaskRunOutcome::Panicked(message)
        }
    };

    ctx.status.finish();

    if queue.is_empty() && !ctx.status.is_running() {
        debug!("queue drained, running idle cleanup");
        ctx.reaper.reap_idle();
    }

    TaskRunRecord {
        name: record.name,
        kind: record.kind,
        started_at,
        finished_at: Utc::now(),
        outcome,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}

fn execute(ctx: &TaskContext, record: &TaskRecord) -> Result<()> {
    match &record.kind {
        TaskKind::BackupAll => {
            let report = RetryOrchestrator::new(ctx.retry_cooldown).run(ctx)?;
            debug!(?report, "backup cascade finished");
            Ok(())
        }
        TaskKind::ManualBackup { console_id } => run_manual_backup(ctx, *console_id),
        TaskKind::ConnectivityCheck => run_session_check(ctx, "Connectivity check", true),
        TaskKind::CookieTest => run_session_check(ctx, "Cookie test", false),
        TaskKind::ResetProcesses => {
            ctx.reaper.reap_all();
            ctx.log_activity("Reset processes => all browser processes killed.");
            Ok(())
        }
    }
}

fn run_manual_backup(ctx: &TaskContext, console_id: u32) -> Result<()> {
    let name = state::lock(&ctx.state)
        .console(console_id)
        .map(|c| c.name.clone())
        .ok_or(OrchestratorError::ConsoleNotFound(console_id))?;

    ctx.status.set_step(format!("ManualBackup => {name}"));
    match retry::attempt_console(ctx, console_id)? {
        Some(outcome) => debug!(console = %name, ?outcome, "manual backup attempted"),
        None => warn!(console_id, "console removed before manual backup ran"),
    }
    ctx.status.set_progress(1, None);
    Ok(())
}

fn run_session_check(ctx: &TaskContext, label: &str, notify_on_failure: bool) -> Result<()> {
    ctx.status.set_step(format!("{label} => probing session"));
    let valid = ctx.probe.probe()?;

    {
        let mut guard = state::lock(&ctx.state);
        guard.session_authenticated = valid;
        guard.last_cookie_check = Some(Utc::now());
        let verdict = if valid { "session valid" } else { "session invalid" };
        guard.log_activity(format!("{label} => {verdict}"));
    }
    ctx.persist();

    if !valid && notify_on_failure {
        ctx.notify(&NotifyEvent::new(
            NotifyKind::ConnectivityFailed,
            label,
            "",
            "stored session is no longer authenticated",
        ));
    }
    ctx.status.set_progress(1, None);
    Ok(())
}
