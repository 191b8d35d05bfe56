//! CLI command implementations.

pub mod delete_stream;
pub mod start;
pub mod streams;

use std::path::Path;

use anyhow::{Context, Result};
use strand_config::{ConfigLoader, StrandConfig};
use strand_storage::{ExitSignal, SqliteStreamStore, StreamStorage};
use tracing::{info, warn};

/// Loads `file` alone when given, otherwise the layered configuration.
pub fn load_config(project: Option<&Path>, file: Option<&Path>) -> Result<StrandConfig> {
    if let Some(file) = file {
        return StrandConfig::from_file(file)
            .with_context(|| format!("Failed to load config file {}", file.display()));
    }
    let mut loader = ConfigLoader::new();
    if let Some(project) = project {
        loader = loader.with_project_dir(project);
    }
    loader.load()
}

/// Opens the node's SQLite store, creating the data directory first.
///
/// Opening claims ownership: a node already running on the same files is
/// superseded on its next write.
pub async fn open_store(
    config: &StrandConfig,
    exit_signal: Option<ExitSignal>,
) -> Result<SqliteStreamStore> {
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.storage.data_dir.display()
        )
    })?;
    let path = config.storage.database_file();
    info!(path = %path.display(), "opening stream store");
    SqliteStreamStore::open(&path, config.pool_config(), exit_signal)
        .await
        .with_context(|| format!("Failed to open stream store at {}", path.display()))
}

/// Gives up ownership taken by [`open_store`] and closes the store.
pub async fn release_store(store: &dyn StreamStorage) {
    if let Err(e) = store.cleanup_storage().await {
        warn!(error = %e, "failed to release stream store ownership");
    }
    store.close().await;
}
