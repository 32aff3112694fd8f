//! Configuration types for the backup orchestrator.
//!
//! [`OrchestratorConfig`] is the deployment configuration loaded from
//! `config.toml`. [`ScheduleConfig`] and [`NotifyConfig`] are user-editable
//! and persisted alongside the application state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest interval, in minutes, that a minute-unit schedule may use.
pub const MIN_INTERVAL_MINUTES: u32 = 15;

/// Top-level deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory holding `appdata.json` and any backup artifacts.
    pub data_dir: PathBuf,
    /// Bound applied to user-triggered one-shot tasks.
    pub max_queue_size: usize,
    /// What a backup tick does when a scheduled run is already pending.
    pub duplicate_policy: DuplicatePolicy,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Retry cascade settings.
    pub retry: RetryConfig,
    /// Watchdog settings.
    pub watchdog: WatchdogConfig,
    /// Interval timer settings.
    pub timers: TimerConfig,
    /// External programs that perform the actual work.
    pub commands: CommandConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::app_dirs::data_dir(),
            max_queue_size: 10,
            duplicate_policy: DuplicatePolicy::default(),
            log_filter: "info".to_owned(),
            retry: RetryConfig::default(),
            watchdog: WatchdogConfig::default(),
            timers: TimerConfig::default(),
            commands: CommandConfig::default(),
        }
    }
}

/// Retry cascade configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Pause between passes, in seconds.
    pub cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { cooldown_secs: 10 }
    }
}

impl RetryConfig {
    /// Cooldown as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds between watchdog ticks.
    pub interval_secs: u64,
    /// Slack added to the backup interval before a missing enqueue counts as drift.
    pub grace_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            grace_secs: 60,
        }
    }
}

/// Interval timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// How late a tick may fire and still run, in seconds.
    pub misfire_grace_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            misfire_grace_secs: 60,
        }
    }
}

/// Behaviour of a backup tick when a scheduled backup is already running or queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Always enqueue; high priority plus FIFO keeps duplicates ordered.
    #[default]
    Stack,
    /// Skip the tick while a scheduled or manual backup is running or queued.
    SkipIfPending,
}

/// External programs invoked by the process-backed collaborators.
///
/// Each entry is an argv list; an empty list means "not configured".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Backs up one console. Name, id and URL are appended as arguments.
    pub backup: Vec<String>,
    /// Checks whether the stored session is still valid.
    pub probe: Vec<String>,
    /// Kills stray browser processes. `idle` or `all` is appended.
    pub cleanup: Vec<String>,
    /// Any program still running after this many seconds is killed.
    pub timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            backup: Vec::new(),
            probe: Vec::new(),
            cleanup: Vec::new(),
            timeout_secs: 300,
        }
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::OrchestratorError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::OrchestratorError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::app_dirs::config_file()
    }

    /// Load from `path` if it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only when an existing file is unreadable or malformed.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Path of the persisted application state.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("appdata.json")
    }
}

/// Unit of a schedule interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleUnit {
    Minutes,
    Hours,
    Days,
}

impl ScheduleUnit {
    fn seconds(self) -> u64 {
        match self {
            Self::Minutes => 60,
            Self::Hours => 3600,
            Self::Days => 86_400,
        }
    }
}

impl std::fmt::Display for ScheduleUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minutes => write!(f, "minutes"),
            Self::Hours => write!(f, "hours"),
            Self::Days => write!(f, "days"),
        }
    }
}

/// Which schedule a [`ClampWarning`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTarget {
    Backup,
    Check,
}

/// Raised when a minute-unit interval was raised to the minimum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClampWarning {
    pub target: ScheduleTarget,
    pub requested: u32,
    pub applied: u32,
}

impl std::fmt::Display for ClampWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.target {
            ScheduleTarget::Backup => "Backup",
            ScheduleTarget::Check => "Check",
        };
        write!(
            f,
            "{what} interval set to minimum of {} minutes (requested {}).",
            self.applied, self.requested
        )
    }
}

/// User-editable schedule for the backup and connectivity-check timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub backup_enabled: bool,
    pub backup_value: u32,
    pub backup_unit: ScheduleUnit,
    pub check_enabled: bool,
    pub check_value: u32,
    pub check_unit: ScheduleUnit,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            backup_enabled: true,
            backup_value: 1,
            backup_unit: ScheduleUnit::Days,
            check_enabled: true,
            check_value: 4,
            check_unit: ScheduleUnit::Hours,
        }
    }
}

fn clamp_value(value: u32, unit: ScheduleUnit) -> u32 {
    let value = value.max(1);
    if unit == ScheduleUnit::Minutes {
        value.max(MIN_INTERVAL_MINUTES)
    } else {
        value
    }
}

impl ScheduleConfig {
    /// Returns a copy with every interval at least 1 and minute intervals at least 15.
    pub fn normalized(&self) -> (Self, Vec<ClampWarning>) {
        let mut out = self.clone();
        let mut warnings = Vec::new();

        out.backup_value = clamp_value(self.backup_value, self.backup_unit);
        if self.backup_unit == ScheduleUnit::Minutes && out.backup_value != self.backup_value {
            warnings.push(ClampWarning {
                target: ScheduleTarget::Backup,
                requested: self.backup_value,
                applied: out.backup_value,
            });
        }

        out.check_value = clamp_value(self.check_value, self.check_unit);
        if self.check_unit == ScheduleUnit::Minutes && out.check_value != self.check_value {
            warnings.push(ClampWarning {
                target: ScheduleTarget::Check,
                requested: self.check_value,
                applied: out.check_value,
            });
        }

        (out, warnings)
    }

    /// Effective backup interval, clamped.
    pub fn backup_interval(&self) -> Duration {
        let value = clamp_value(self.backup_value, self.backup_unit);
        Duration::from_secs(u64::from(value) * self.backup_unit.seconds())
    }

    /// Effective connectivity-check interval, clamped.
    pub fn check_interval(&self) -> Duration {
        let value = clamp_value(self.check_value, self.check_unit);
        Duration::from_secs(u64::from(value) * self.check_unit.seconds())
    }
}

/// Which notification events are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub cookies_expired: bool,
    pub connectivity_failed: bool,
    pub backup_failed: bool,
    pub backup_success: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookies_expired: true,
            connectivity_failed: true,
            backup_failed: true,
            backup_success: false,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn minute_schedule_is_clamped_to_fifteen() {
        let schedule = ScheduleConfig {
            backup_value: 5,
            backup_unit: ScheduleUnit::Minutes,
            ..ScheduleConfig::default()
        };
        let (normalized, warnings) = schedule.normalized();
        assert_eq!(normalized.backup_value, 15);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].target, ScheduleTarget::Backup);
        assert_eq!(warnings[0].requested, 5);
        assert_eq!(schedule.backup_interval(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn hour_schedule_is_not_clamped() {
        let schedule = ScheduleConfig {
            check_value: 2,
            check_unit: ScheduleUnit::Hours,
            ..ScheduleConfig::default()
        };
        let (normalized, warnings) = schedule.normalized();
        assert_eq!(normalized.check_value, 2);
        assert!(warnings.is_empty());
        assert_eq!(schedule.check_interval(), Duration::from_secs(7200));
    }

    #[test]
    fn zero_value_is_raised_to_one() {
        let schedule = ScheduleConfig {
            backup_value: 0,
            backup_unit: ScheduleUnit::Days,
            ..ScheduleConfig::default()
        };
        let (normalized, _) = schedule.normalized();
        assert_eq!(normalized.backup_value, 1);
        assert_eq!(schedule.backup_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn clamp_warning_message_mentions_minimum() {
        let warning = ClampWarning {
            target: ScheduleTarget::Check,
            requested: 3,
            applied: 15,
        };
        assert_eq!(
            warning.to_string(),
            "Check interval set to minimum of 15 minutes (requested 3)."
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = OrchestratorConfig::default();
        config.max_queue_size = 4;
        config.duplicate_policy = DuplicatePolicy::SkipIfPending;
        config.retry.cooldown_secs = 3;
        config.save_to_file(&path).unwrap();

        let loaded = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(loaded.max_queue_size, 4);
        assert_eq!(loaded.duplicate_policy, DuplicatePolicy::SkipIfPending);
        assert_eq!(loaded.retry.cooldown(), Duration::from_secs(3));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            max_queue_size = 25

            [watchdog]
            grace_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.max_queue_size, 25);
        assert_eq!(config.watchdog.grace_secs, 120);
        assert_eq!(config.watchdog.interval_secs, 60);
        assert_eq!(config.retry.cooldown_secs, 10);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Stack);
        assert_eq!(config.commands.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn command_timeout_is_configurable_and_never_zero() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            [commands]
            backup = ["/usr/local/bin/backup-console"]
            timeout_secs = 90
            "#,
        )
        .unwrap();
        assert_eq!(config.commands.timeout(), Duration::from_secs(90));
        assert!(config.commands.probe.is_empty());

        let zero = CommandConfig {
            timeout_secs: 0,
            ..CommandConfig::default()
        };
        assert_eq!(zero.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn duplicate_policy_parses_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: DuplicatePolicy,
        }
        let parsed: Wrapper = toml::from_str(r#"policy = "skip_if_pending""#).unwrap();
        assert_eq!(parsed.policy, DuplicatePolicy::SkipIfPending);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.max_queue_size, 10);
    }

    #[test]
    fn notify_defaults_match_expected_toggles() {
        let notify = NotifyConfig::default();
        assert!(!notify.enabled);
        assert!(notify.cookies_expired);
        assert!(notify.connectivity_failed);
        assert!(notify.backup_failed);
        assert!(!notify.backup_success);
    }
}
