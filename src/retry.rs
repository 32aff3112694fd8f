//! Multi-pass retry cascade for "back up every eligible console" runs.
//!
//! Pass 1 tries every eligible console in list order. Each later pass waits
//! a cooldown and retries only the previous pass's failures. A console still
//! failing after pass 3 is left in the terminal
//! [`BackupStatus::FailedAfterRetries`] state until the next scheduled run.

use crate::error::Result;
use crate::executor::AttemptOutcome;
use crate::notify::{NotifyEvent, NotifyKind};
use crate::scheduler::runner::TaskContext;
use crate::scheduler::tasks::SCHEDULED_BACKUP_PREFIX;
use crate::state::{self, BackupStatus};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One original attempt plus two retries.
pub const MAX_PASSES: u8 = 3;

/// Blocking pause between passes; counts toward the task's elapsed time.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// What a cascade did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Set when the run was refused because the session is not authenticated.
    pub canceled: bool,
    /// Number of passes entered.
    pub passes_run: u8,
    /// Console ids that failed in each pass, in attempt order.
    pub failures: Vec<Vec<u32>>,
    /// Cooldowns slept.
    pub cooldowns: u8,
    /// Consoles left in the terminal failed state.
    pub exhausted: Vec<u32>,
    /// Set when the session expired mid-run and later passes were dropped.
    pub session_lost: bool,
    /// Consoles left `Failed` because the session expired before they could be retried.
    pub abandoned: Vec<u32>,
}

/// Runs the cascade as the body of a `BackupAll` task.
#[derive(Debug, Clone)]
pub struct RetryOrchestrator {
    label: String,
    cooldown: Duration,
}

impl RetryOrchestrator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            label: SCHEDULED_BACKUP_PREFIX.to_owned(),
            cooldown,
        }
    }

    /// Run every applicable pass.
    ///
    /// # Errors
    ///
    /// Only unexpected executor errors abort the cascade; failed attempts
    /// are ordinary results.
    pub fn run(&self, ctx: &TaskContext) -> Result<CascadeReport> {
        let mut report = CascadeReport::default();

        let eligible: Vec<u32> = {
            let mut guard = state::lock(&ctx.state);
            if !guard.session_authenticated {
                guard.log_activity("Scheduled backup => canceled => not logged in.");
                report.canceled = true;
                return Ok(report);
            }
            let ids: Vec<u32> = guard.eligible_consoles().map(|c| c.id).collect();
            if ids.is_empty() {
                guard.log_activity("Scheduled backup => no consoles eligible (all excluded).");
                return Ok(report);
            }
            guard.log_activity("Scheduled backup => pass#1 for all consoles.");
            ids
        };

        let mut pending = eligible;
        for pass in 1..=MAX_PASSES {
            if pass > 1 {
                if pending.is_empty() {
                    debug!(pass, "no failures remain, skipping further passes");
                    break;
                }
                ctx.status.set_step(format!(
                    "{} => Wait{}s => pass{pass}",
                    self.label,
                    self.cooldown.as_secs()
                ));
                ctx.sleeper.sleep(self.cooldown);
                report.cooldowns += 1;
            }

            report.passes_run = pass;
            let failed = self.run_pass(ctx, pass, &pending)?;
            info!(pass, attempted = pending.len(), failed = failed.len(), "backup pass finished");
            report.failures.push(failed.clone());
            pending = failed;

            let session_lost = {
                let mut guard = state::lock(&ctx.state);
                if !guard.session_authenticated {
                    guard.log_activity("Scheduled backup => stopped => session expired.");
                }
                !guard.session_authenticated
            };
            if session_lost {
                warn!(pass, "session expired mid-run, dropping remaining passes");
                report.session_lost = true;
                report.abandoned = std::mem::take(&mut pending);
                break;
            }
        }

        if !pending.is_empty() {
            let mut guard = state::lock(&ctx.state);
            for &id in &pending {
                let Some(console) = guard.console_mut(id) else {
                    continue;
                };
                console.last_backup_status = BackupStatus::FailedAfterRetries;
                let name = console.name.clone();
                guard.log_activity(format!("{name} => failed after {MAX_PASSES} tries."));
            }
            report.exhausted = pending;
        }

        {
            let mut guard = state::lock(&ctx.state);
            guard.log_activity("Scheduled backup => complete => all passes done.");
        }
        ctx.status.set_step(format!("{} => Done", self.label));
        ctx.persist();
        Ok(report)
    }

    fn run_pass(&self, ctx: &TaskContext, pass: u8, ids: &[u32]) -> Result<Vec<u32>> {
        let mut failed = Vec::new();
        for (index, &id) in ids.iter().enumerate() {
            let Some(name) = console_name(ctx, id) else {
                warn!(console_id = id, pass, "console removed during run, skipping");
                continue;
            };
            ctx.status
                .set_step(format!("{} => Pass{pass} => {name}", self.label));

            match attempt_console(ctx, id)? {
                None => continue,
                Some(outcome) if outcome.is_success() => {
                    if pass > 1 {
                        let mut guard = state::lock(&ctx.state);
                        if let Some(console) = guard.console_mut(id) {
                            console.last_backup_status = BackupStatus::SucceededAfterRetry;
                        }
                        guard.log_activity(format!(
                            "{name} => pass{pass} => succeeded after retry"
                        ));
                    }
                }
                Some(_) => failed.push(id),
            }

            if pass == 1 {
                ctx.status
                    .set_progress(u32::try_from(index + 1).unwrap_or(u32::MAX), None);
            }
        }
        Ok(failed)
    }
}

fn console_name(ctx: &TaskContext, id: u32) -> Option<String> {
    state::lock(&ctx.state).console(id).map(|c| c.name.clone())
}

/// One backup attempt of console `id`, with status write-back, notification
/// and persistence. `Ok(None)` when the console no longer exists.
///
/// Without an authenticated session the console is marked failed without
/// calling the executor or notifying. The state lock is never held while
/// the executor runs.
pub(crate) fn attempt_console(ctx: &TaskContext, id: u32) -> Result<Option<AttemptOutcome>> {
    let (mut console, authenticated) = {
        let guard = state::lock(&ctx.state);
        let Some(console) = guard.console(id).cloned() else {
            return Ok(None);
        };
        (console, guard.session_authenticated)
    };

    let outcome = if authenticated {
        ctx.executor.attempt(&mut console)?
    } else {
        console.mark_failed();
        AttemptOutcome::failed("not logged in")
    };

    let event = {
        let mut guard = state::lock(&ctx.state);
        if let Some(stored) = guard.console_mut(id) {
            stored.last_backup_status = console.last_backup_status;
            stored.last_backup_time = console.last_backup_time;
        }
        match &outcome {
            AttemptOutcome::Succeeded => {
                guard.log_activity(format!("Backup => '{}' => success", console.name));
                Some(NotifyEvent::new(
                    NotifyKind::BackupSucceeded,
                    &console.name,
                    &console.backup_url,
                    "backup downloaded",
                ))
            }
            AttemptOutcome::Failed { reason } => {
                guard.log_activity(format!("Backup => '{}' => fail => {reason}", console.name));
                authenticated.then(|| {
                    NotifyEvent::new(
                        NotifyKind::BackupFailed,
                        &console.name,
                        &console.backup_url,
                        reason,
                    )
                })
            }
            AttemptOutcome::SessionExpired => {
                guard.session_authenticated = false;
                guard.log_activity(format!(
                    "Backup => '{}' => forced login => session no longer authenticated",
                    console.name
                ));
                Some(NotifyEvent::new(
                    NotifyKind::CookiesExpired,
                    &console.name,
                    &console.backup_url,
                    "redirected to login",
                ))
            }
        }
    };

    if outcome == AttemptOutcome::SessionExpired {
        ctx.reaper.reap_all();
    }
    if let Some(event) = &event {
        ctx.notify(event);
    }
    ctx.persist();
    Ok(Some(outcome))
}
