//! Application directory paths.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data | `~/Library/Application Support/console-backup/` | `~/.local/share/console-backup/` |
//! | Config | `~/Library/Application Support/console-backup/` | `~/.config/console-backup/` |
//!
//! # Environment Overrides
//!
//! - `BACKUP_DATA_DIR` overrides [`data_dir`]
//! - `BACKUP_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

const APP_DIR_NAME: &str = "console-backup";

/// Application data root: persisted state, downloaded backups.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("BACKUP_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("/tmp/console-backup-data"))
}

/// Application config directory, home of `config.toml`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("BACKUP_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("/tmp/console-backup-config"))
}

/// Config file path.
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
