//! Headless backup host.
//!
//! Loads configuration and persisted state, starts the orchestrator with the
//! configured backup/probe/cleanup programs, and runs the schedule until
//! Ctrl+C. All diagnostic output goes to stderr.
//!
//! Usage: `backup-host [--config <path>]`

use console_backup::config::OrchestratorConfig;
use console_backup::notify::LogNotifier;
use console_backup::scheduler::TokioTimerRegistry;
use console_backup::store::{JsonFileStore, PersistenceStore};
use console_backup::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn config_path_from_args() -> anyhow::Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (None, _) => Ok(OrchestratorConfig::default_config_path()),
        (Some("--config" | "-c"), Some(path)) => Ok(PathBuf::from(path)),
        (Some(other), _) => {
            anyhow::bail!("unexpected argument '{other}'; usage: backup-host [--config <path>]")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path_from_args()?;
    let config = OrchestratorConfig::load_or_default(&config_path)?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str())),
        )
        .init();

    info!(config = %config_path.display(), "backup-host starting");

    let store = Arc::new(JsonFileStore::new(config.state_path()));
    let state = store.load()?;
    info!(
        consoles = state.consoles.len(),
        state = %store.path().display(),
        "loaded application state"
    );

    let commands = config.commands.clone();
    let orchestrator = Orchestrator::builder(config)
        .with_state(state)
        .with_store(store)
        .with_notifier(Arc::new(LogNotifier))
        .with_commands(&commands)
        .start(Arc::new(TokioTimerRegistry::current()?))?;

    if let Some(next) = orchestrator.next_backup_time() {
        info!(%next, "next scheduled backup");
    }

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down...");

    tokio::task::spawn_blocking(move || orchestrator.shutdown()).await?;

    info!("backup-host shut down cleanly");
    Ok(())
}
