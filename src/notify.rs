//! Notification seam.
//!
//! Delivery (SMTP, chat, ...) lives outside this crate. Task bodies build a
//! [`NotifyEvent`] and hand it to a [`Notifier`], which must never fail.
//! [`FilteredNotifier`] applies the user's live [`NotifyConfig`] first.

use crate::config::NotifyConfig;
use crate::state::{self, SharedState};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    CookiesExpired,
    ConnectivityFailed,
    BackupFailed,
    BackupSucceeded,
}

impl std::fmt::Display for NotifyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CookiesExpired => write!(f, "cookies expired"),
            Self::ConnectivityFailed => write!(f, "connectivity check failed"),
            Self::BackupFailed => write!(f, "backup failed"),
            Self::BackupSucceeded => write!(f, "backup succeeded"),
        }
    }
}

/// A single notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    pub kind: NotifyKind,
    /// Console name, or a task name for events not tied to one console.
    pub subject: String,
    pub url: String,
    pub detail: String,
}

impl NotifyEvent {
    pub fn new(
        kind: NotifyKind,
        subject: impl Into<String>,
        url: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            subject: subject.into(),
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Subject line in the form the mail templates use.
    pub fn title(&self) -> String {
        match self.kind {
            NotifyKind::CookiesExpired => format!("Cookies expired for {}", self.subject),
            NotifyKind::ConnectivityFailed => {
                format!("Connectivity check failed for {}", self.subject)
            }
            NotifyKind::BackupFailed => format!("Backup failed for {}", self.subject),
            NotifyKind::BackupSucceeded => format!("Backup succeeded for {}", self.subject),
        }
    }
}

impl NotifyConfig {
    /// Whether `kind` should be delivered under these settings.
    pub fn allows(&self, kind: NotifyKind) -> bool {
        if !self.enabled {
            return false;
        }
        match kind {
            NotifyKind::CookiesExpired => self.cookies_expired,
            NotifyKind::ConnectivityFailed => self.connectivity_failed,
            NotifyKind::BackupFailed => self.backup_failed,
            NotifyKind::BackupSucceeded => self.backup_success,
        }
    }
}

/// Fire-and-forget notification sink.
pub trait Notifier: Send + Sync {
    /// Deliver `event`. Implementations swallow and log their own failures.
    fn notify(&self, event: &NotifyEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: &NotifyEvent) {}
}

/// Emits each event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &NotifyEvent) {
        info!(
            target: "notify",
            kind = %event.kind,
            subject = %event.subject,
            url = %event.url,
            detail = %event.detail,
            "{}",
            event.title()
        );
    }
}

/// Forwards only the events the current preferences allow.
///
/// Preferences are read from the shared state on every event, so edits take
/// effect without rebuilding the notifier.
pub struct FilteredNotifier {
    inner: Arc<dyn Notifier>,
    state: SharedState,
}

impl FilteredNotifier {
    pub fn new(inner: Arc<dyn Notifier>, state: SharedState) -> Self {
        Self { inner, state }
    }
}

impl Notifier for FilteredNotifier {
    fn notify(&self, event: &NotifyEvent) {
        let allowed = state::lock(&self.state).notify.allows(event.kind);
        if allowed {
            self.inner.notify(event);
        } else {
            debug!(kind = %event.kind, "notification suppressed by preferences");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, kind: NotifyKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &NotifyEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
