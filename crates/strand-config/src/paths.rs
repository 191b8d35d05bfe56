//! Where configuration files and node state live.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Well-known locations, user-level ones found through `directories`.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("net", "Strand", "strand"),
        }
    }

    /// User config directory (~/.config/strand/)
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::XdgError("home directory unavailable".to_string())
            })
    }

    /// User config file (~/.config/strand/config.toml)
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// Project config file (strand.toml)
    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("strand.toml")
    }

    /// Local override file (strand.local.toml, not checked in)
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("strand.local.toml")
    }

    /// Directory holding node state, including the default database.
    pub fn state_dir(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(".strand")
    }

    pub fn is_initialized(project_dir: impl AsRef<Path>) -> bool {
        Self::project_config_file(project_dir).exists()
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_user_config_file_is_named_for_strand() {
        // Not every CI sandbox has a home directory.
        if let Ok(file) = Paths::new().user_config_file() {
            assert!(file.to_string_lossy().contains("strand"));
            assert!(file.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_project_layout() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_file = Paths::project_config_file(project_dir);
        assert_eq!(config_file, project_dir.join("strand.toml"));
        assert_eq!(
            Paths::local_config_file(project_dir),
            project_dir.join("strand.local.toml")
        );
        assert_eq!(Paths::state_dir(project_dir), project_dir.join(".strand"));

        assert!(!Paths::is_initialized(project_dir));
        std::fs::write(&config_file, "[project]\nname = \"test\"\n").unwrap();
        assert!(Paths::is_initialized(project_dir));
    }
}
