//! Interval timers that fire producer callbacks.
//!
//! A timer callback only ever enqueues work; it never runs a task body. Each
//! registered job is a tokio task ticking on its own interval, cancelled via
//! a [`CancellationToken`] on unregister or shutdown.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Callback fired on each tick.
pub type JobFn = Arc<dyn Fn() + Send + Sync>;

/// Per-job firing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Concurrent invocations allowed; extra ticks are dropped.
    pub max_instances: usize,
    /// A tick later than this is skipped instead of fired.
    pub misfire_grace: Duration,
    /// Collapse a backlog of missed ticks into one.
    pub coalesce: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_instances: 1,
            misfire_grace: Duration::from_secs(60),
            coalesce: true,
        }
    }
}

/// Something that can run named interval jobs.
pub trait TimerRegistry: Send + Sync {
    /// Register `job` under `id`, replacing any existing job with that id.
    /// The first tick fires one `interval` from now.
    fn register(&self, id: &str, interval: Duration, options: JobOptions, job: JobFn)
    -> Result<()>;

    /// Remove a job. Returns `true` when it existed.
    fn unregister(&self, id: &str) -> bool;

    fn is_registered(&self, id: &str) -> bool;

    /// Wall-clock time of the job's next tick.
    fn next_run_time(&self, id: &str) -> Option<DateTime<Utc>>;

    /// Cancel every job.
    fn shutdown(&self);
}

struct JobEntry {
    cancel: CancellationToken,
    next_run: Arc<Mutex<Option<DateTime<Utc>>>>,
}

/// [`TimerRegistry`] backed by a tokio runtime.
pub struct TokioTimerRegistry {
    handle: Handle,
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl TokioTimerRegistry {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Use the runtime of the calling context.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| OrchestratorError::Timer(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(handle))
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

fn wall_clock_after(interval: Duration) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::from_std(interval).ok()?;
    Utc::now().checked_add_signed(delta)
}

/// Decrements the running count even if the job panics.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TimerRegistry for TokioTimerRegistry {
    fn register(
        &self,
        id: &str,
        interval: Duration,
        options: JobOptions,
        job: JobFn,
    ) -> Result<()> {
        if interval.is_zero() {
            return Err(OrchestratorError::Timer(format!(
                "job {id}: interval must be positive"
            )));
        }

        let cancel = CancellationToken::new();
        let next_run = Arc::new(Mutex::new(wall_clock_after(interval)));
        let entry = JobEntry {
            cancel: cancel.clone(),
            next_run: next_run.clone(),
        };

        let job_id = id.to_owned();
        let running = Arc::new(AtomicUsize::new(0));
        self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(if options.coalesce {
                MissedTickBehavior::Skip
            } else {
                MissedTickBehavior::Burst
            });

            loop {
                let scheduled = tokio::select! {
                    () = cancel.cancelled() => break,
                    scheduled = ticker.tick() => scheduled,
                };
                *next_run.lock().unwrap_or_else(|e| e.into_inner()) = wall_clock_after(interval);

                let late = Instant::now().saturating_duration_since(scheduled);
                if late > options.misfire_grace {
                    warn!(
                        job = %job_id,
                        late_secs = late.as_secs(),
                        "tick missed its grace window, skipping"
                    );
                    continue;
                }
                if running.load(Ordering::SeqCst) >= options.max_instances {
                    warn!(job = %job_id, "previous run still active, skipping tick");
                    continue;
                }

                running.fetch_add(1, Ordering::SeqCst);
                let guard = RunningGuard(running.clone());
                let job = job.clone();
                let job_id = job_id.clone();
                tokio::task::spawn_blocking(move || {
                    let _guard = guard;
                    debug!(job = %job_id, "timer fired");
                    job();
                });
            }
            debug!(job = %job_id, "timer stopped");
        });

        let previous = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_owned(), entry);
        if let Some(previous) = previous {
            debug!(job = id, "replacing existing timer");
            previous.cancel.cancel();
        }
        Ok(())
    }

    fn unregister(&self, id: &str) -> bool {
        let removed = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn is_registered(&self, id: &str) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    fn next_run_time(&self, id: &str) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let entry = jobs.get(id)?;
        *entry.next_run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in jobs.drain() {
            entry.cancel.cancel();
        }
    }
}

impl Drop for TokioTimerRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
