//! Node configuration.
//!
//! Sources, highest precedence first:
//! 1. Environment variables (`STRAND_` prefix, `__` between section and key)
//! 2. strand.local.toml (local overrides, not checked in)
//! 3. strand.toml (project config)
//! 4. ~/.config/strand/config.toml (user defaults)
//! 5. Built-in defaults

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use strand_events::{CacheConfig, EntitlementsBackend, StreamConfig};
use strand_storage::PoolConfig;
use strand_types::{Address, StreamId, StreamKind};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Everything a node reads at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrandConfig {
    pub project: ProjectConfig,
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub cache: CacheSection,
    pub stream: StreamSection,
    pub production: ProductionConfig,
    pub entitlements: EntitlementsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "strand-node".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex address this node appears under in stream records.
    pub address: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "0x0000000000000000000000000000000000000001".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub read_max_connections: u32,
    /// Negative values are KiB, per SQLite convention.
    pub cache_size_kib: i32,
    pub busy_timeout_ms: u64,
    pub acquire_timeout_secs: u64,
    /// 0 disables pool statistics logging.
    pub pool_stats_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            data_dir: PathBuf::from(".strand/data"),
            read_max_connections: pool.read_max_connections,
            cache_size_kib: pool.cache_size_kib,
            busy_timeout_ms: pool.busy_timeout_ms,
            acquire_timeout_secs: pool.acquire_timeout_secs,
            pool_stats_interval_secs: pool.pool_stats_interval_secs,
        }
    }
}

impl StorageConfig {
    /// SQLite database file inside `data_dir`.
    pub fn database_file(&self) -> PathBuf {
        self.data_dir.join("streams.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// 0 disables eviction.
    pub cleanup_interval_secs: u64,
    pub expiration_secs: u64,
    pub registry_wait_timeout_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let cache = CacheConfig::default();
        Self {
            cleanup_interval_secs: cache.cleanup_interval.as_secs(),
            expiration_secs: cache.expiration.as_secs(),
            registry_wait_timeout_ms: cache.registry_wait_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub recency_generations: u64,
    pub default_min_events_per_snapshot: u64,
    pub min_events_per_snapshot: HashMap<StreamKind, u64>,
}

impl Default for StreamSection {
    fn default() -> Self {
        let stream = StreamConfig::default();
        Self {
            recency_generations: stream.recency_generations,
            default_min_events_per_snapshot: stream.default_min_events_per_snapshot,
            min_events_per_snapshot: stream.min_events_per_snapshot,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductionConfig {
    /// Period of the development tick source; 0 turns it off.
    pub dev_tick_interval_ms: u64,
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            dev_tick_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementsConfig {
    pub backend: EntitlementsBackend,
    pub paused: bool,
    /// Stream id to the user addresses refused on it (static backend only).
    pub deny: BTreeMap<String, Vec<String>>,
}

impl StrandConfig {
    /// Reads exactly one TOML file, with defaults for missing keys.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        config.validate()?;
        Ok(config)
    }

    /// Anchors a relative `data_dir` at `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        if self.storage.data_dir.is_relative() {
            self.storage.data_dir = base_dir.as_ref().join(&self.storage.data_dir);
        }
    }

    /// Checks values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node_address()?;
        self.denied_writers()?;
        if self.storage.read_max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "storage.read_max_connections must be at least 1".to_string(),
            ));
        }
        if self.cache.cleanup_interval_secs > 0 && self.cache.expiration_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cache.expiration_secs must be positive while eviction is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn node_address(&self) -> Result<Address, ConfigError> {
        self.node.address.parse().map_err(|e| {
            ConfigError::ValidationError(format!("node.address {:?}: {e}", self.node.address))
        })
    }

    /// Flattens `entitlements.deny` into parsed pairs.
    pub fn denied_writers(&self) -> Result<Vec<(StreamId, Address)>, ConfigError> {
        let mut pairs = Vec::new();
        for (stream, users) in &self.entitlements.deny {
            let stream_id: StreamId = stream.parse().map_err(|e| {
                ConfigError::ValidationError(format!("entitlements.deny stream {stream:?}: {e}"))
            })?;
            for user in users {
                let user: Address = user.parse().map_err(|e| {
                    ConfigError::ValidationError(format!("entitlements.deny user {user:?}: {e}"))
                })?;
                pairs.push((stream_id, user));
            }
        }
        Ok(pairs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            read_max_connections: self.storage.read_max_connections,
            cache_size_kib: self.storage.cache_size_kib,
            busy_timeout_ms: self.storage.busy_timeout_ms,
            acquire_timeout_secs: self.storage.acquire_timeout_secs,
            pool_stats_interval_secs: self.storage.pool_stats_interval_secs,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            cleanup_interval: Duration::from_secs(self.cache.cleanup_interval_secs),
            expiration: Duration::from_secs(self.cache.expiration_secs),
            registry_wait_timeout: Duration::from_millis(self.cache.registry_wait_timeout_ms),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            recency_generations: self.stream.recency_generations,
            default_min_events_per_snapshot: self.stream.default_min_events_per_snapshot,
            min_events_per_snapshot: self.stream.min_events_per_snapshot.clone(),
        }
    }

    /// `None` when the development tick source is off.
    pub fn dev_tick_interval(&self) -> Option<Duration> {
        (self.production.dev_tick_interval_ms > 0)
            .then(|| Duration::from_millis(self.production.dev_tick_interval_ms))
    }
}
