//! Errors raised while reading or checking node configuration.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A configuration file is not valid TOML.
    #[error("{path} is not valid TOML: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A value is well-formed TOML but not a usable setting.
    #[error("invalid setting: {0}")]
    ValidationError(String),

    /// The platform offers no user configuration directory.
    #[error("no user directory: {0}")]
    XdgError(String),
}
