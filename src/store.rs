//! Persistence for [`AppState`].
//!
//! The orchestrator saves after every state-mutating step and assumes
//! nothing beyond "last write wins".

use crate::error::{OrchestratorError, Result};
use crate::state::AppState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Load/save seam for the application state.
pub trait PersistenceStore: Send + Sync {
    /// Persist `state`.
    fn save(&self, state: &AppState) -> Result<()>;
    /// Load the last saved state, or defaults when nothing was saved yet.
    fn load(&self) -> Result<AppState>;
}

/// On-disk wrapper carrying a schema version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default = "default_state_version")]
    version: u8,
    #[serde(flatten)]
    state: AppState,
}

fn default_state_version() -> u8 {
    1
}

/// Pretty-printed JSON file store.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl PersistenceStore for JsonFileStore {
    fn save(&self, state: &AppState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OrchestratorError::Store(format!("cannot create state dir: {e}"))
            })?;
        }

        let persisted = PersistedState {
            version: default_state_version(),
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&persisted)?;

        // Write-then-rename so a crash mid-write never truncates the previous state.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| OrchestratorError::Store(format!("cannot write state: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| OrchestratorError::Store(format!("cannot replace state: {e}")))?;
        Ok(())
    }

    fn load(&self) -> Result<AppState> {
        let bytes = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted state, using defaults");
                return Ok(AppState::default());
            }
            Err(e) => {
                return Err(OrchestratorError::Store(format!("cannot read state: {e}")));
            }
        };

        let persisted: PersistedState = serde_json::from_slice(&bytes)
            .map_err(|e| OrchestratorError::Store(format!("cannot parse state: {e}")))?;
        debug!(
            path = %self.path.display(),
            version = persisted.version,
            consoles = persisted.state.consoles.len(),
            "loaded persisted state"
        );
        Ok(persisted.state)
    }
}

/// In-memory store that counts saves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Option<AppState>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times [`PersistenceStore::save`] was called.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The last state saved, if any.
    pub fn last_saved(&self) -> Option<AppState> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PersistenceStore for MemoryStore {
    fn save(&self, state: &AppState) -> Result<()> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn load(&self) -> Result<AppState> {
        Ok(self.last_saved().unwrap_or_default())
    }
}
