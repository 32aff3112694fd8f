//! Collaborators that perform the actual work of a task.
//!
//! The browser automation that logs in, downloads a backup or validates the
//! stored session lives outside this crate. The traits here are the seams,
//! and the `Command*` types drive an external program for each operation:
//!
//! | Program | Arguments | Exit code |
//! |---------|-----------|-----------|
//! | backup  | `<name> <id> <url>` | 0 success, 3 session expired, other failure |
//! | probe   | none | 0 session valid, other invalid |
//! | cleanup | `idle` or `all` | ignored beyond logging |
//!
//! Every program run is bounded by [`ProgramSpec::timeout`]; a program still
//! running at the deadline is killed.

use crate::error::{OrchestratorError, Result};
use crate::state::Console;
use chrono::Utc;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit code a backup program uses to report a login redirect.
pub const EXIT_SESSION_EXPIRED: i32 = 3;

/// Default upper bound on one program run.
pub const DEFAULT_PROGRAM_TIMEOUT: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for stderr once the program has exited. A background
/// grandchild can keep the pipe open indefinitely.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Domain result of one backup attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed { reason: String },
    /// The vendor site forced a fresh login; the stored session is no longer valid.
    SessionExpired,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Performs one backup of one console.
pub trait BackupExecutor: Send + Sync {
    /// Attempt a backup. Expected failures are `Ok` with a non-success outcome;
    /// `Err` is reserved for conditions the worker should treat as a task error.
    ///
    /// Implementations may update `last_backup_status` and `last_backup_time`.
    fn attempt(&self, console: &mut Console) -> Result<AttemptOutcome>;
}

/// Checks whether the stored browser session is still authenticated.
pub trait SessionProbe: Send + Sync {
    fn probe(&self) -> Result<bool>;
}

/// Reclaims stray external resources such as leftover browser processes.
pub trait ResourceReaper: Send + Sync {
    /// Called by the worker when it goes idle.
    fn reap_idle(&self);
    /// Called by an explicit reset task.
    fn reap_all(&self);
}

/// Reaper that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReaper;

impl ResourceReaper for NoopReaper {
    fn reap_idle(&self) {}
    fn reap_all(&self) {}
}

/// A program plus the leading arguments it is always invoked with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProgramSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_PROGRAM_TIMEOUT,
        }
    }

    /// Build from an argv list; `None` when the list is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
            timeout: DEFAULT_PROGRAM_TIMEOUT,
        })
    }

    /// Kill the program if it runs longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn display(&self) -> std::path::Display<'_> {
        self.program.display()
    }
}

/// How a bounded program run ended.
enum ProgramRun {
    Exited { status: ExitStatus, stderr: String },
    TimedOut,
}

fn run(spec: &ProgramSpec, args: &[&str], envs: &[(&str, String)]) -> Result<ProgramRun> {
    let program = &spec.program;
    let mut command = Command::new(program);
    command
        .args(&spec.args)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        command.env(key, value);
    }
    let mut child = command.spawn().map_err(|e| {
        OrchestratorError::Executor(format!("cannot run {}: {e}", program.display()))
    })?;

    // Drained off-thread so a chatty program cannot block on a full pipe.
    let (stderr_tx, stderr_rx) = mpsc::channel();
    if let Some(mut pipe) = child.stderr.take() {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf) {
                debug!("cannot read program stderr: {e}");
            }
            // The receiver is gone when the run timed out.
            let _ = stderr_tx.send(String::from_utf8_lossy(&buf).into_owned());
        });
    }

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stderr = stderr_rx
                    .recv_timeout(STDERR_DRAIN_GRACE)
                    .unwrap_or_default();
                return Ok(ProgramRun::Exited { status, stderr });
            }
            Ok(None) if started.elapsed() >= spec.timeout => {
                warn!(
                    program = %program.display(),
                    timeout_secs = spec.timeout.as_secs_f64(),
                    "program timed out, killing it"
                );
                if let Err(e) = child.kill() {
                    warn!(program = %program.display(), "cannot kill program: {e}");
                }
                if let Err(e) = child.wait() {
                    warn!(program = %program.display(), "cannot reap program: {e}");
                }
                return Ok(ProgramRun::TimedOut);
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(OrchestratorError::Executor(format!(
                    "cannot wait for {}: {e}",
                    program.display()
                )));
            }
        }
    }
}

fn stderr_tail(status: ExitStatus, stderr: &str) -> String {
    let trimmed = stderr.trim();
    let tail: String = trimmed
        .chars()
        .rev()
        .take(200)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if tail.is_empty() {
        format!("exit status {status}")
    } else {
        tail
    }
}

/// Backs up a console by running an external program.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: ProgramSpec,
}

impl CommandExecutor {
    pub fn new(program: ProgramSpec) -> Self {
        Self { program }
    }
}

impl BackupExecutor for CommandExecutor {
    fn attempt(&self, console: &mut Console) -> Result<AttemptOutcome> {
        debug!(
            console = %console.name,
            program = %self.program.display(),
            "running backup program"
        );
        let id = console.id.to_string();
        let run = run(
            &self.program,
            &[console.name.as_str(), id.as_str(), console.backup_url.as_str()],
            &[
                ("BACKUP_CONSOLE_NAME", console.name.clone()),
                ("BACKUP_CONSOLE_ID", id.clone()),
                ("BACKUP_CONSOLE_URL", console.backup_url.clone()),
            ],
        )?;

        let (status, stderr) = match run {
            ProgramRun::Exited { status, stderr } => (status, stderr),
            ProgramRun::TimedOut => {
                console.mark_failed();
                return Ok(AttemptOutcome::failed(format!(
                    "timed out after {:?}",
                    self.program.timeout
                )));
            }
        };
        match status.code() {
            Some(0) => {
                console.mark_success(Utc::now());
                Ok(AttemptOutcome::Succeeded)
            }
            Some(EXIT_SESSION_EXPIRED) => {
                console.mark_failed();
                Ok(AttemptOutcome::SessionExpired)
            }
            _ => {
                console.mark_failed();
                Ok(AttemptOutcome::failed(stderr_tail(status, &stderr)))
            }
        }
    }
}

/// Validates the session by running an external program.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: ProgramSpec,
}

impl CommandProbe {
    pub fn new(program: ProgramSpec) -> Self {
        Self { program }
    }
}

impl SessionProbe for CommandProbe {
    fn probe(&self) -> Result<bool> {
        match run(&self.program, &[], &[])? {
            ProgramRun::Exited { status, .. } => Ok(status.success()),
            ProgramRun::TimedOut => Err(OrchestratorError::Executor(format!(
                "session probe timed out after {:?}",
                self.program.timeout
            ))),
        }
    }
}

/// Runs a cleanup program, logging rather than propagating failures.
#[derive(Debug, Clone)]
pub struct CommandReaper {
    program: ProgramSpec,
}

impl CommandReaper {
    pub fn new(program: ProgramSpec) -> Self {
        Self { program }
    }

    fn reap(&self, mode: &str) {
        match run(&self.program, &[mode], &[]) {
            Ok(ProgramRun::Exited { status, .. }) if status.success() => {
                debug!(mode, "cleanup program finished");
            }
            Ok(ProgramRun::Exited { status, stderr }) => {
                warn!(mode, "cleanup program failed: {}", stderr_tail(status, &stderr));
            }
            Ok(ProgramRun::TimedOut) => warn!(mode, "cleanup program timed out"),
            Err(e) => warn!(mode, "cleanup program not runnable: {e}"),
        }
    }
}

impl ResourceReaper for CommandReaper {
    fn reap_idle(&self) {
        self.reap("idle");
    }

    fn reap_all(&self) {
        self.reap("all");
    }
}

/// Stand-in used when no backup program is configured: every attempt fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredExecutor;

impl BackupExecutor for UnconfiguredExecutor {
    fn attempt(&self, console: &mut Console) -> Result<AttemptOutcome> {
        console.mark_failed();
        Ok(AttemptOutcome::failed("no backup program configured"))
    }
}

/// Stand-in used when no probe program is configured: the session is never valid.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredProbe;

impl SessionProbe for UnconfiguredProbe {
    fn probe(&self) -> Result<bool> {
        Ok(false)
    }
}
