//! Console backup task orchestration.
//!
//! Long, fallible operations (browser-driven console backups, session
//! checks, process resets) run one at a time on a single worker thread,
//! fed by a priority queue that any number of producers push into.
//!
//! # Architecture
//!
//! - **Queue**: priority + arrival-order [`scheduler::TaskQueue`]
//! - **Worker**: one dedicated thread dispatching on [`scheduler::TaskKind`]
//! - **Triggers**: interval timers for scheduled backups and connectivity checks
//! - **Retry**: a bounded three-pass cascade over failing consoles
//! - **Watchdog**: re-registers lost timers and forces overdue backups
//!
//! The [`Orchestrator`] context object ties these together and exposes the
//! producer API and the observability surface.

pub mod app_dirs;
pub mod config;
pub mod error;
pub mod executor;
pub mod notify;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod store;

pub use config::{DuplicatePolicy, OrchestratorConfig, ScheduleConfig};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{EnqueueOutcome, Orchestrator, OrchestratorBuilder};
pub use state::{AppState, BackupStatus, Console};
pub use status::CurrentTaskStatus;
