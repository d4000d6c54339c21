use std::path::PathBuf;

use thiserror::Error;

/// Errors loading or validating bus configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}
