//! Record of the task currently in flight.
//!
//! The worker is the only writer of the running/idle transitions; the
//! running task body may update `step` and progress. Any number of
//! observers read consistent clones.

use crate::scheduler::tasks::TaskRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Point-in-time view of the in-flight task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurrentTaskStatus {
    pub running: bool,
    pub task_name: String,
    pub step: String,
    pub start_time: Option<DateTime<Utc>>,
    pub total_items: u32,
    pub completed_items: u32,
}

impl CurrentTaskStatus {
    /// Whole seconds since the task started, `None` when idle.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        let start = self.start_time?;
        Some(u64::try_from((now - start).num_seconds()).unwrap_or(0))
    }

    /// True when the running task's name or step starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.running && (self.task_name.starts_with(prefix) || self.step.starts_with(prefix))
    }

    fn is_idle_consistent(&self) -> bool {
        self.task_name.is_empty() && self.step.is_empty() && self.start_time.is_none()
    }
}

/// Shared handle to the current task status.
#[derive(Debug, Clone, Default)]
pub struct StatusTracker {
    inner: Arc<RwLock<CurrentTaskStatus>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy for observers.
    pub fn snapshot(&self) -> CurrentTaskStatus {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).running
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .has_prefix(prefix)
    }

    /// Mark `record` as running.
    pub(crate) fn start(&self, record: &TaskRecord) {
        self.start_at(record, Utc::now());
    }

    pub(crate) fn start_at(&self, record: &TaskRecord, now: DateTime<Utc>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = CurrentTaskStatus {
            running: true,
            task_name: record.name.clone(),
            step: record.name.clone(),
            start_time: Some(now),
            total_items: record.total_items,
            completed_items: 0,
        };
    }

    /// Reset to idle.
    pub(crate) fn finish(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = CurrentTaskStatus::default();
        debug_assert!(guard.is_idle_consistent());
    }

    /// Update the human-readable step. Ignored when idle.
    pub fn set_step(&self, step: impl Into<String>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if guard.running {
            guard.step = step.into();
        }
    }

    /// Update progress, clamped to `[0, total_items]`; optionally the step too.
    pub fn set_progress(&self, completed_items: u32, step: Option<String>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !guard.running {
            return;
        }
        guard.completed_items = completed_items.min(guard.total_items);
        if let Some(step) = step {
            guard.step = step;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::scheduler::tasks::{PRIORITY_DEFAULT, TaskKind};

    fn record(total_items: u32) -> TaskRecord {
        TaskRecord::new(TaskKind::CookieTest, "CookieTest", PRIORITY_DEFAULT, total_items)
    }

    #[test]
    fn starts_idle() {
        let tracker = StatusTracker::new();
        let status = tracker.snapshot();
        assert!(!status.running);
        assert!(status.is_idle_consistent());
    }

    #[test]
    fn start_sets_name_step_and_time() {
        let tracker = StatusTracker::new();
        tracker.start(&record(3));
        let status = tracker.snapshot();
        assert!(status.running);
        assert_eq!(status.task_name, "CookieTest");
        assert_eq!(status.step, "CookieTest");
        assert!(status.start_time.is_some());
        assert_eq!(status.total_items, 3);
        assert_eq!(status.completed_items, 0);
    }

    #[test]
    fn finish_restores_idle_invariant() {
        let tracker = StatusTracker::new();
        tracker.start(&record(2));
        tracker.set_progress(1, Some("halfway".to_owned()));
        tracker.finish();
        let status = tracker.snapshot();
        assert_eq!(status, CurrentTaskStatus::default());
    }

    #[test]
    fn progress_is_clamped_to_total() {
        let tracker = StatusTracker::new();
        tracker.start(&record(2));
        tracker.set_progress(9, None);
        assert_eq!(tracker.snapshot().completed_items, 2);
    }

    #[test]
    fn updates_while_idle_are_ignored() {
        let tracker = StatusTracker::new();
        tracker.set_step("stray");
        tracker.set_progress(1, Some("stray".to_owned()));
        assert_eq!(tracker.snapshot(), CurrentTaskStatus::default());
    }

    #[test]
    fn elapsed_seconds_counts_from_start() {
        let tracker = StatusTracker::new();
        let start = Utc::now() - chrono::Duration::seconds(42);
        tracker.start_at(&record(1), start);
        let elapsed = tracker.snapshot().elapsed_seconds(Utc::now()).unwrap();
        assert!(elapsed >= 42);
    }

    #[test]
    fn prefix_matches_name_or_step() {
        let tracker = StatusTracker::new();
        assert!(!tracker.has_prefix("Cookie"));
        tracker.start(&record(1));
        assert!(tracker.has_prefix("Cookie"));
        tracker.set_step("ScheduledBackup => Pass2 => rack-1");
        assert!(tracker.has_prefix("ScheduledBackup"));
    }
}
