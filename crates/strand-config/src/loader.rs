//! Merges defaults, files and environment into one [`StrandConfig`].

use crate::{Paths, StrandConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Builder for one configuration load.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    user_config: bool,
}

impl ConfigLoader {
    /// Loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "STRAND".to_string(),
            user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Prefix of overriding environment variables (default: "STRAND").
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip `~/.config/strand/config.toml`.
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    /// Merges every source, later sources winning over earlier ones.
    pub fn load(self) -> Result<StrandConfig> {
        let mut builder = config::Config::builder();

        // Defaults
        let defaults = StrandConfig::default();
        builder = builder.add_source(
            config::Config::try_from(&defaults).context("encoding default configuration")?,
        );

        // ~/.config/strand/config.toml
        if self.user_config
            && let Ok(user_config_file) = Paths::new().user_config_file()
            && user_config_file.exists()
        {
            builder = builder.add_source(toml_file(user_config_file));
        }

        // strand.toml
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(toml_file(project_config_file));
        }

        // strand.local.toml
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(toml_file(local_config_file));
        }

        // STRAND_CACHE__EXPIRATION_SECS=60
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("merging configuration sources")?;

        let mut strand_config: StrandConfig = config
            .try_deserialize()
            .context("decoding merged configuration")?;

        strand_config.resolve_paths(&self.project_dir);
        strand_config
            .validate()
            .context("checking configuration")?;

        Ok(strand_config)
    }

    /// Load configuration or fall back to defaults rooted at the project dir.
    pub fn load_or_default(self) -> StrandConfig {
        let project_dir = self.project_dir.clone();
        self.load().unwrap_or_else(|_| {
            let mut config = StrandConfig::default();
            config.resolve_paths(project_dir);
            config
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn toml_file(path: PathBuf) -> config::File<config::FileSourceFile, config::FileFormat> {
    config::File::from(path)
        .required(false)
        .format(config::FileFormat::Toml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use strand_types::StreamKind;
    use tempfile::tempdir;

    fn loader(project_dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .with_env_prefix("STRAND_LOADER_TEST")
    }

    #[test]
    fn test_empty_project_loads_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config.cache.expiration_secs, 300);
        assert_eq!(config.stream.recency_generations, 5);
        assert_eq!(config.storage.data_dir, temp_dir.path().join(".strand/data"));
    }

    #[test]
    fn test_project_file_sets_sections() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[project]
name = "relay-eu"

[node]
address = "0x00000000000000000000000000000000000000aa"

[cache]
cleanup_interval_secs = 0
expiration_secs = 30

[stream]
default_min_events_per_snapshot = 50

[stream.min_events_per_snapshot]
user-settings = 10
"#;
        fs::write(project_dir.join("strand.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.project.name, "relay-eu");
        assert_eq!(config.node_address().unwrap().as_bytes()[19], 0xaa);
        assert_eq!(config.cache_config().cleanup_interval, Duration::ZERO);
        assert_eq!(config.cache_config().expiration, Duration::from_secs(30));

        let stream = config.stream_config();
        assert_eq!(stream.min_events_for(StreamKind::UserSettings), 10);
        assert_eq!(stream.min_events_for(StreamKind::Channel), 50);
    }

    #[test]
    fn test_local_file_wins_over_project_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("strand.toml"),
            "[storage]\nread_max_connections = 4\nbusy_timeout_ms = 100\n",
        )
        .expect("Failed to write project config");
        fs::write(
            project_dir.join("strand.local.toml"),
            "[storage]\nread_max_connections = 16\n",
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.storage.read_max_connections, 16);
        assert_eq!(config.storage.busy_timeout_ms, 100);
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        fs::write(
            temp_dir.path().join("strand.toml"),
            "[node]\naddress = \"not-hex\"\n",
        )
        .expect("Failed to write config");

        assert!(loader(temp_dir.path()).load().is_err());

        let fallback = loader(temp_dir.path()).load_or_default();
        assert_eq!(fallback.node.address, crate::NodeConfig::default().address);
        assert!(fallback.storage.data_dir.is_absolute());
    }

    // Environment overrides use a double underscore between section and key,
    // since keys contain single underscores:
    //
    //   STRAND_CACHE__EXPIRATION_SECS=60
    //   STRAND_ENTITLEMENTS__PAUSED=true
    //
    // They are not exercised here because tests share one process environment.
}
