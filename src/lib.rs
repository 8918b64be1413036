pub mod bridge;
pub mod cache;
pub mod coalescer;
pub mod config;
pub mod db;
pub mod errors;
pub mod guard;
pub mod models;
pub mod store;
pub mod sync_core;
pub mod text;
pub mod watcher;

pub use crate::bridge::{BridgeGateway, BridgeRequest, BridgeResponse};
pub use crate::cache::EntityCache;
pub use crate::coalescer::{PersistOutcome, WriteCoalescer};
pub use crate::config::SyncSettings;
pub use crate::sync_core::{Command, CommandOutput, SyncCore};
pub use crate::errors::{AppError, AppResult};
pub use crate::guard::{ConflictGuard, GuardVerdict};
pub use crate::store::{SqliteStore, StoreClient};
pub use crate::watcher::{CheckOutcome, CheckReason, SyncWatcher};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Runs the long-lived core until Ctrl-C: initial load, polling, change log.
pub async fn run_host(data_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    init_tracing(&config::logs_dir(data_dir)).map_err(anyhow::Error::msg)?;

    let core = SyncCore::open(data_dir)?;
    let mut changes = core.subscribe();
    let outcome = core.start().await?;
    let (folders, notes) = core.read_cache(|cache| (cache.folders().count(), cache.notes().count()))?;
    tracing::info!(data_dir = %data_dir.display(), outcome = ?outcome, folders, notes, "sync core started");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    tracing::warn!(error = %error, "failed to listen for shutdown signal");
                }
                break;
            }
            changed = changes.recv() => match changed {
                Ok(event) => tracing::info!(reason = ?event.reason, sync_token = ?event.sync_token, "data changed"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "change log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    core.shutdown().await;
    Ok(())
}

/// Sends one request through the gateway, as the external command-line writer would.
pub async fn invoke_bridge(data_dir: &Path, op: &str, payload: serde_json::Value) -> AppResult<serde_json::Value> {
    let settings = SyncSettings::load(data_dir)?;
    let gateway = BridgeGateway::new(settings.bridge.with_environment(), config::logs_dir(data_dir));
    gateway.invoke(op, payload).await
}

pub fn init_tracing(log_dir: &Path) -> Result<(), String> {
    let guard = install_tracing(log_dir, "notesync.log")?;
    let _ = LOG_GUARD.set(guard);
    Ok(())
}

/// Installs the JSON file subscriber and hands back its flush guard. Short-lived
/// processes hold the guard until they finish so buffered lines reach disk.
pub fn install_tracing(log_dir: &Path, file_name: &str) -> Result<WorkerGuard, String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::install_tracing;

    #[test]
    fn scoped_tracing_flushes_into_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let guard = install_tracing(dir.path(), "writer.log").expect("install");
        tracing::warn!(op = "get_note", "writer request failed");
        drop(guard);

        let logged: String = std::fs::read_dir(dir.path())
            .expect("log dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("writer.log"))
            .filter_map(|entry| std::fs::read_to_string(entry.path()).ok())
            .collect();
        assert!(logged.contains("writer request failed"), "{}", logged);
        assert!(logged.contains("get_note"));
    }
}
