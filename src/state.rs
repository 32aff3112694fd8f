//! Persisted application state touched by task bodies.
//!
//! Holds the console list, the authenticated-session flag, the user-facing
//! activity log and the user-editable schedule/notification settings.

use crate::config::{NotifyConfig, ScheduleConfig};
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Number of activity entries kept in memory and on disk.
pub const ACTIVITY_LOG_LIMIT: usize = 300;

/// Outcome of the most recent backup of a console.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    #[default]
    Unknown,
    Success,
    #[serde(rename = "Succeeded after retry")]
    SucceededAfterRetry,
    Failed,
    /// Terminal: the retry cascade gave up on this console.
    #[serde(rename = "Failed after 3 retries")]
    FailedAfterRetries,
}

impl BackupStatus {
    /// Coarse bucket shown on the dashboard.
    pub fn display_bucket(self) -> &'static str {
        match self {
            Self::Success | Self::SucceededAfterRetry => "Success",
            Self::FailedAfterRetries => "Failed after 3 retries",
            Self::Unknown | Self::Failed => "Failed",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SucceededAfterRetry)
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Unknown => "Unknown",
            Self::Success => "Success",
            Self::SucceededAfterRetry => "Succeeded after retry",
            Self::Failed => "Failed",
            Self::FailedAfterRetries => "Failed after 3 retries",
        };
        f.write_str(text)
    }
}

/// A managed console whose configuration gets backed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Console {
    pub id: u32,
    pub name: String,
    pub backup_url: String,
    #[serde(default)]
    pub last_backup_status: BackupStatus,
    #[serde(default)]
    pub last_backup_time: Option<DateTime<Utc>>,
    /// Excluded consoles are skipped by scheduled runs but can still be backed up manually.
    #[serde(default)]
    pub exclude_from_schedule: bool,
}

impl Console {
    pub fn new(id: u32, name: impl Into<String>, backup_url: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            backup_url: backup_url.into(),
            last_backup_status: BackupStatus::Unknown,
            last_backup_time: None,
            exclude_from_schedule: false,
        }
    }

    /// Record a successful attempt at `at`.
    pub fn mark_success(&mut self, at: DateTime<Utc>) {
        self.last_backup_status = BackupStatus::Success;
        self.last_backup_time = Some(at);
    }

    pub fn mark_failed(&mut self) {
        self.last_backup_status = BackupStatus::Failed;
    }
}

/// One line of the user-facing activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Bounded, oldest-first activity log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
}

impl ActivityLog {
    pub fn push(&mut self, message: impl Into<String>) {
        self.push_at(Utc::now(), message);
    }

    pub fn push_at(&mut self, timestamp: DateTime<Utc>, message: impl Into<String>) {
        self.entries.push_back(ActivityEntry {
            timestamp,
            message: message.into(),
        });
        while self.entries.len() > ACTIVITY_LOG_LIMIT {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries newest first, as the dashboard shows them.
    pub fn newest_first(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter().rev()
    }

    pub fn last(&self) -> Option<&ActivityEntry> {
        self.entries.back()
    }
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppState {
    /// Whether the stored browser session was valid at the last check.
    pub session_authenticated: bool,
    pub last_cookie_check: Option<DateTime<Utc>>,
    pub consoles: Vec<Console>,
    pub activity: ActivityLog,
    pub schedule: ScheduleConfig,
    pub notify: NotifyConfig,
}

impl AppState {
    /// Add a console and return its id.
    ///
    /// # Errors
    ///
    /// Rejects empty names or URLs and names already in use.
    pub fn add_console(&mut self, name: &str, backup_url: &str) -> Result<u32> {
        let name = name.trim();
        let backup_url = backup_url.trim();
        if name.is_empty() || backup_url.is_empty() {
            return Err(OrchestratorError::Console(
                "name and backup URL are required".to_owned(),
            ));
        }
        if self.consoles.iter().any(|c| c.name == name) {
            return Err(OrchestratorError::Console(format!(
                "a console named '{name}' already exists"
            )));
        }
        let id = self.consoles.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        self.consoles.push(Console::new(id, name, backup_url));
        self.activity.push(format!("Console '{name}' added."));
        Ok(id)
    }

    /// Remove a console. Returns `true` when found.
    pub fn remove_console(&mut self, id: u32) -> bool {
        let before = self.consoles.len();
        self.consoles.retain(|c| c.id != id);
        self.consoles.len() != before
    }

    /// Flip `exclude_from_schedule`; returns the new value when found.
    pub fn toggle_exclude(&mut self, id: u32) -> Option<bool> {
        let console = self.console_mut(id)?;
        console.exclude_from_schedule = !console.exclude_from_schedule;
        Some(console.exclude_from_schedule)
    }

    pub fn console(&self, id: u32) -> Option<&Console> {
        self.consoles.iter().find(|c| c.id == id)
    }

    pub fn console_mut(&mut self, id: u32) -> Option<&mut Console> {
        self.consoles.iter_mut().find(|c| c.id == id)
    }

    /// Consoles included in scheduled runs, in list order.
    pub fn eligible_consoles(&self) -> impl Iterator<Item = &Console> {
        self.consoles.iter().filter(|c| !c.exclude_from_schedule)
    }

    pub fn eligible_count(&self) -> usize {
        self.eligible_consoles().count()
    }

    /// Append to the activity log and mirror it to `tracing`.
    pub fn log_activity(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "activity", "{message}");
        self.activity.push(message);
    }
}

/// Application state shared between producers and the worker.
pub type SharedState = Arc<Mutex<AppState>>;

/// Wrap a state for sharing.
pub fn shared(state: AppState) -> SharedState {
    Arc::new(Mutex::new(state))
}

/// Lock the shared state, recovering from a poisoned mutex.
///
/// A task body that panicked mid-update leaves the state as it was at the
/// panic; the worker keeps going, so readers must keep going too.
pub fn lock(state: &SharedState) -> MutexGuard<'_, AppState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}
