//! SQLite connection pools for the stream store.
//!
//! Reads and writes use separate pools:
//! - Write pool: one connection, so writers inside this process never race
//! - Read pool: several read-only connections
//! - WAL mode: readers don't block the writer

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};

/// Configuration for the stream store pools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum read connections (default: 8)
    pub read_max_connections: u32,
    /// Cache size in KiB, negative per SQLite convention (default: 64MB)
    pub cache_size_kib: i32,
    /// Busy timeout in milliseconds (default: 5000)
    pub busy_timeout_ms: u64,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: u64,
    /// Interval between pool statistics reports; 0 disables them (default: 60)
    pub pool_stats_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            read_max_connections: 8,
            cache_size_kib: -64000,
            busy_timeout_ms: 5000,
            acquire_timeout_secs: 30,
            pool_stats_interval_secs: 60,
        }
    }
}

/// SQLite database with separate read and write pools.
#[derive(Clone, Debug)]
pub(crate) struct StoreDb {
    pub read_pool: SqlitePool,
    pub write_pool: SqlitePool,
}

impl StoreDb {
    /// Opens (creating if needed) the database file at `path`.
    ///
    /// The write pool is created first so that the file and its WAL exist
    /// before the read-only connections attach.
    pub async fn open(path: &Path, config: &PoolConfig) -> Result<Self, sqlx::Error> {
        let write_pool = Self::create_write_pool(path, config).await?;
        let read_pool = Self::create_read_pool(path, config).await?;

        tracing::info!(
            path = %path.display(),
            read_connections = config.read_max_connections,
            "stream store database opened"
        );

        Ok(Self {
            read_pool,
            write_pool,
        })
    }

    fn base_options(path: &Path, config: &PoolConfig) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .pragma("cache_size", config.cache_size_kib.to_string())
            .pragma("temp_store", "MEMORY")
    }

    async fn create_write_pool(
        path: &Path,
        config: &PoolConfig,
    ) -> Result<SqlitePool, sqlx::Error> {
        let options = Self::base_options(path, config).create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await?;

        tracing::debug!(max_connections = 1, "write pool created");
        Ok(pool)
    }

    async fn create_read_pool(
        path: &Path,
        config: &PoolConfig,
    ) -> Result<SqlitePool, sqlx::Error> {
        let options = Self::base_options(path, config).read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.read_max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await?;

        tracing::debug!(
            max_connections = config.read_max_connections,
            "read pool created"
        );
        Ok(pool)
    }

    /// Logs connection counts for both pools.
    pub fn report_stats(&self) {
        tracing::info!(
            write_size = self.write_pool.size(),
            write_idle = self.write_pool.num_idle(),
            read_size = self.read_pool.size(),
            read_idle = self.read_pool.num_idle(),
            "stream store pool stats"
        );
    }

    pub async fn close(&self) {
        self.read_pool.close().await;
        self.write_pool.close().await;
    }
}
