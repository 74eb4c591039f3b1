//! # Config
//!
//! Knobs controlling how strictly patches are validated and how the work is spread out.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a [`PatcherConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// The file is not a valid config
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Validation and apply settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatcherConfig {
    /// Reject patches with an empty reason instead of warning about them
    pub strict_reasons: bool,
    /// Accept instruction patches that declare no original instructions
    pub allow_unchecked: bool,
    /// Accept instruction patches that change the size of the image
    pub allow_resizing: bool,
    /// Threads used for validation. `None` uses the available parallelism, `Some(1)` stays on
    /// the calling thread.
    pub workers: Option<usize>,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            strict_reasons: false,
            allow_unchecked: true,
            allow_resizing: true,
            workers: Some(1),
        }
    }
}

impl PatcherConfig {
    /// Parses a JSON config. Missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads and parses a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Serializes the config as pretty JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
