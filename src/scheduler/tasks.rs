//! Task definitions carried through the queue.
//!
//! Defines the closed [`TaskKind`] set the worker dispatches on and the
//! [`TaskRecord`] envelope that orders it.

use serde::Serialize;

/// Priority of scheduled and override backup runs.
pub const PRIORITY_HIGH: u8 = 0;

/// Priority of everything else.
pub const PRIORITY_DEFAULT: u8 = 10;

/// Name prefix shared by scheduled and override backup runs.
pub const SCHEDULED_BACKUP_PREFIX: &str = "ScheduledBackup";

/// Name prefix of single-console manual backups.
pub const MANUAL_BACKUP_PREFIX: &str = "ManualBackup-";

/// Task name of a scheduled backup run.
pub const SCHEDULED_BACKUP_TASK: &str = "ScheduledBackup => Pass1 => allConsoles";

/// Task name of a connectivity check.
pub const CONNECTIVITY_CHECK_TASK: &str = "ConnectivityCheck";

/// Task name of a user-triggered cookie test.
pub const COOKIE_TEST_TASK: &str = "CookieTest";

/// Task name of a process reset.
pub const RESET_PROCESSES_TASK: &str = "ResetProcesses";

/// What a queued task does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Run the retry cascade over every eligible console.
    BackupAll,
    /// Timer-driven session check.
    ConnectivityCheck,
    /// Back up one console once.
    ManualBackup { console_id: u32 },
    /// User-triggered session check.
    CookieTest,
    /// Kill every stray browser process.
    ResetProcesses,
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub name: String,
    /// Lower runs first.
    pub priority: u8,
    /// Assigned by the queue at enqueue time; breaks priority ties FIFO.
    pub sequence: u64,
    pub kind: TaskKind,
    /// Progress denominator, at least 1.
    pub total_items: u32,
}

impl TaskRecord {
    /// Create a record. `sequence` is filled in when it is enqueued.
    pub fn new(kind: TaskKind, name: impl Into<String>, priority: u8, total_items: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            sequence: 0,
            kind,
            total_items: total_items.max(1),
        }
    }

    /// Scheduled (or override) backup of `eligible` consoles.
    pub fn backup_all(eligible: usize) -> Self {
        let total = u32::try_from(eligible).unwrap_or(u32::MAX);
        Self::new(TaskKind::BackupAll, SCHEDULED_BACKUP_TASK, PRIORITY_HIGH, total)
    }

    pub fn connectivity_check() -> Self {
        Self::new(
            TaskKind::ConnectivityCheck,
            CONNECTIVITY_CHECK_TASK,
            PRIORITY_DEFAULT,
            1,
        )
    }

    pub fn manual_backup(console_id: u32, console_name: &str) -> Self {
        Self::new(
            TaskKind::ManualBackup { console_id },
            format!("{MANUAL_BACKUP_PREFIX}{console_name}"),
            PRIORITY_DEFAULT,
            1,
        )
    }

    pub fn cookie_test() -> Self {
        Self::new(TaskKind::CookieTest, COOKIE_TEST_TASK, PRIORITY_DEFAULT, 1)
    }

    pub fn reset_processes() -> Self {
        Self::new(
            TaskKind::ResetProcesses,
            RESET_PROCESSES_TASK,
            PRIORITY_DEFAULT,
            1,
        )
    }

    /// Sort key: priority first, then arrival order.
    pub fn order_key(&self) -> (u8, u64) {
        (self.priority, self.sequence)
    }

    pub fn is_scheduled_backup(&self) -> bool {
        self.name.starts_with(SCHEDULED_BACKUP_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn total_items_is_at_least_one() {
        let record = TaskRecord::backup_all(0);
        assert_eq!(record.total_items, 1);
        assert_eq!(TaskRecord::backup_all(5).total_items, 5);
    }

    #[test]
    fn scheduled_backup_runs_at_high_priority() {
        let record = TaskRecord::backup_all(3);
        assert_eq!(record.priority, PRIORITY_HIGH);
        assert!(record.is_scheduled_backup());
        assert_eq!(record.kind, TaskKind::BackupAll);
    }

    #[test]
    fn manual_backup_name_carries_console() {
        let record = TaskRecord::manual_backup(7, "rack-7");
        assert_eq!(record.name, "ManualBackup-rack-7");
        assert_eq!(record.kind, TaskKind::ManualBackup { console_id: 7 });
        assert_eq!(record.priority, PRIORITY_DEFAULT);
        assert!(!record.is_scheduled_backup());
    }

    #[test]
    fn kind_serializes_tagged() {
        let json = serde_json::to_string(&TaskKind::ManualBackup { console_id: 2 }).unwrap();
        assert_eq!(json, r#"{"type":"manual_backup","console_id":2}"#);
    }
}
