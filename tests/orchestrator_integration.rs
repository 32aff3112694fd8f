//! End-to-end tests of the orchestrator on a real tokio runtime.
//!
//! Exercises the producer API, the worker thread, the retry cascade,
//! the JSON store and the notification filter together.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use console_backup::config::{NotifyConfig, OrchestratorConfig, RetryConfig};
use console_backup::executor::{AttemptOutcome, BackupExecutor, SessionProbe};
use console_backup::notify::{NotifyKind, RecordingNotifier};
use console_backup::scheduler::{TaskRunOutcome, TaskRunRecord, TokioTimerRegistry, WatchdogAction};
use console_backup::store::{JsonFileStore, PersistenceStore};
use console_backup::{AppState, BackupStatus, Console, Orchestrator, OrchestratorError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Fails each console on the listed 1-based attempt numbers.
#[derive(Default)]
struct ScriptedExecutor {
    fail_on: HashMap<String, Vec<usize>>,
    attempts: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn failing(script: &[(&str, &[usize])]) -> Self {
        Self {
            fail_on: script
                .iter()
                .map(|(name, attempts)| ((*name).to_owned(), attempts.to_vec()))
                .collect(),
            attempts: Mutex::new(Vec::new()),
        }
    }
}

impl BackupExecutor for ScriptedExecutor {
    fn attempt(&self, console: &mut Console) -> console_backup::Result<AttemptOutcome> {
        let nth = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(console.name.clone());
            attempts.iter().filter(|n| **n == console.name).count()
        };
        if console.name == "boom" {
            panic!("driver crashed");
        }
        if self
            .fail_on
            .get(&console.name)
            .is_some_and(|attempts| attempts.contains(&nth))
        {
            console.mark_failed();
            Ok(AttemptOutcome::failed("no file after 60s"))
        } else {
            console.mark_success(Utc::now());
            Ok(AttemptOutcome::Succeeded)
        }
    }
}

struct StaticProbe(bool);

impl SessionProbe for StaticProbe {
    fn probe(&self) -> console_backup::Result<bool> {
        Ok(self.0)
    }
}

struct Harness {
    orchestrator: Orchestrator,
    runs: mpsc::UnboundedReceiver<TaskRunRecord>,
    notifier: Arc<RecordingNotifier>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn start(consoles: &[&str], executor: ScriptedExecutor, session_valid: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            data_dir: dir.path().to_path_buf(),
            retry: RetryConfig { cooldown_secs: 0 },
            ..OrchestratorConfig::default()
        };

        let mut state = AppState {
            session_authenticated: true,
            notify: NotifyConfig {
                enabled: true,
                backup_success: true,
                ..NotifyConfig::default()
            },
            ..AppState::default()
        };
        for name in consoles {
            state
                .add_console(name, &format!("https://{name}.example"))
                .unwrap();
        }

        let notifier = Arc::new(RecordingNotifier::new());
        let (tx, runs) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::builder(config)
            .with_state(state)
            .with_executor(Arc::new(executor))
            .with_probe(Arc::new(StaticProbe(session_valid)))
            .with_notifier(notifier.clone())
            .with_result_channel(tx)
            .start(Arc::new(TokioTimerRegistry::current().unwrap()))
            .unwrap();

        Self {
            orchestrator,
            runs,
            notifier,
            _dir: dir,
        }
    }

    async fn next_run(&mut self) -> TaskRunRecord {
        tokio::time::timeout(Duration::from_secs(10), self.runs.recv())
            .await
            .expect("task finished in time")
            .expect("worker alive")
    }

    fn status_of(&self, name: &str) -> BackupStatus {
        self.orchestrator
            .state_snapshot()
            .consoles
            .iter()
            .find(|c| c.name == name)
            .unwrap()
            .last_backup_status
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduled_run_retries_and_persists_final_statuses() {
    let executor = ScriptedExecutor::failing(&[("A", &[1, 2, 3]), ("B", &[1])]);
    let mut h = Harness::start(&["A", "B", "C", "D", "E"], executor, true);

    assert!(!h.orchestrator.start_schedule_now());
    let run = h.next_run().await;

    assert_eq!(run.name, "ScheduledBackup => Pass1 => allConsoles");
    assert_eq!(run.outcome, TaskRunOutcome::Success);
    assert_eq!(h.status_of("A"), BackupStatus::FailedAfterRetries);
    assert_eq!(h.status_of("B"), BackupStatus::SucceededAfterRetry);
    for name in ["C", "D", "E"] {
        assert_eq!(h.status_of(name), BackupStatus::Success);
    }

    assert_eq!(h.notifier.count(NotifyKind::BackupFailed), 4);
    assert_eq!(h.notifier.count(NotifyKind::BackupSucceeded), 4);

    let path = h.orchestrator.config().state_path();
    let saved = JsonFileStore::new(path).load().unwrap();
    let a = saved.consoles.iter().find(|c| c.name == "A").unwrap();
    assert_eq!(a.last_backup_status, BackupStatus::FailedAfterRetries);

    let status = h.orchestrator.current_status();
    assert!(!status.running);
    assert!(status.task_name.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn task_errors_and_panics_do_not_stop_the_worker() {
    let mut h = Harness::start(&["boom", "ok"], ScriptedExecutor::default(), true);

    h.orchestrator.enqueue_manual_backup(1).unwrap();
    h.orchestrator.enqueue_manual_backup(2).unwrap();

    let first = h.next_run().await;
    assert!(matches!(first.outcome, TaskRunOutcome::Panicked(ref msg) if msg == "driver crashed"));

    let second = h.next_run().await;
    assert_eq!(second.name, "ManualBackup-ok");
    assert_eq!(second.outcome, TaskRunOutcome::Success);
    assert_eq!(h.status_of("ok"), BackupStatus::Success);

    let activity = h.orchestrator.state_snapshot().activity;
    assert!(
        activity
            .newest_first()
            .any(|entry| {
                entry.message.contains("ManualBackup-boom") && entry.message.contains("ERROR")
            })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_session_cancels_scheduled_backups() {
    let mut h = Harness::start(&["A", "B"], ScriptedExecutor::default(), false);

    h.orchestrator.enqueue_cookie_test();
    let check = h.next_run().await;
    assert_eq!(check.name, "CookieTest");
    assert!(!h.orchestrator.state_snapshot().session_authenticated);

    h.orchestrator.start_schedule_now();
    h.next_run().await;
    assert_eq!(h.status_of("A"), BackupStatus::Unknown);
    assert_eq!(h.notifier.count(NotifyKind::BackupFailed), 0);
    assert_eq!(
        h.orchestrator.enqueue_manual_backup(1).unwrap(),
        console_backup::EnqueueOutcome::NotLoggedIn
    );
    let last = h.orchestrator.state_snapshot().activity.last().cloned().unwrap();
    assert!(last.message.contains("canceled => not logged in"));
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_backup_of_missing_console_is_rejected() {
    let h = Harness::start(&["A"], ScriptedExecutor::default(), true);
    assert!(matches!(
        h.orchestrator.enqueue_manual_backup(7),
        Err(OrchestratorError::ConsoleNotFound(7))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn watchdog_forces_backup_when_ticks_go_silent() {
    let mut h = Harness::start(&["A"], ScriptedExecutor::default(), true);
    let watchdog = h.orchestrator.watchdog().clone();

    assert!(h.orchestrator.next_backup_time().is_some());
    assert_eq!(watchdog.tick(), WatchdogAction::Healthy);

    h.orchestrator.triggers().backup_tick();
    h.next_run().await;
    let far_future = Utc::now() + chrono::Duration::days(2);
    assert_eq!(watchdog.tick_at(far_future), WatchdogAction::Forced);
    let forced = h.next_run().await;
    assert_eq!(forced.outcome, TaskRunOutcome::Success);
    assert_eq!(
        watchdog.tick_at(far_future + chrono::Duration::seconds(10)),
        WatchdogAction::Healthy
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_timers_and_worker() {
    let h = Harness::start(&["A"], ScriptedExecutor::default(), true);
    h.orchestrator.shutdown();

    assert!(h.orchestrator.next_backup_time().is_none());
    assert_eq!(
        h.orchestrator.enqueue_cookie_test(),
        console_backup::EnqueueOutcome::Closed
    );
}
