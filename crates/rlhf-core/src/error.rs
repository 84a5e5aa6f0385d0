//! Error types shared by the RLHF crates.
//!
//! Configuration problems are fatal and surface before any model is loaded.
//! Resource errors carry the offending path so the message points at the file.

use std::path::Path;

use thiserror::Error;

/// Main error type for configuration, loading and training operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RlhfError {
    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more validation failures collected at once.
    #[error("Invalid configuration:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),

    /// I/O failure with path context.
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// YAML / JSON parse failure with path context.
    #[error("Failed to parse '{path}': {message}")]
    Parse { message: String, path: String },

    /// Unknown model alias or malformed registry entry.
    #[error("Model registry error: {0}")]
    Registry(String),

    /// Errors from the candle tensor library.
    #[error("Candle error: {0}")]
    Candle(String),

    /// Tokenizer load / encode / decode failures.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Dataset loading or collation failures.
    #[error("Data error: {0}")]
    Data(String),

    /// Checkpoint save/load failures.
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// Collective communication failures between workers.
    #[error("Collective error: {0}")]
    Collective(String),
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, RlhfError>;

impl RlhfError {
    /// Configuration and validation errors abort before training starts.
    pub fn is_config(&self) -> bool {
        matches!(self, RlhfError::Config(_) | RlhfError::Validation(_))
    }

    /// Path associated with this error, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            RlhfError::Io { path, .. }
            | RlhfError::Parse { path, .. }
            | RlhfError::Checkpoint { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for RlhfError {
    fn from(err: candle_core::Error) -> Self {
        RlhfError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for RlhfError {
    fn from(err: std::io::Error) -> Self {
        RlhfError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<serde_json::Error> for RlhfError {
    fn from(err: serde_json::Error) -> Self {
        RlhfError::Parse {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<serde_yaml::Error> for RlhfError {
    fn from(err: serde_yaml::Error) -> Self {
        RlhfError::Parse {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

/// Attach a path to I/O results.
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T> {
        self.map_err(|e| RlhfError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Build a parse error for `path`.
pub fn parse_error<P: AsRef<Path>>(message: impl ToString, path: P) -> RlhfError {
    RlhfError::Parse {
        message: message.to_string(),
        path: path.as_ref().display().to_string(),
    }
}

/// Build a checkpoint error for `path`.
pub fn checkpoint_error<P: AsRef<Path>>(message: impl ToString, path: P) -> RlhfError {
    RlhfError::Checkpoint {
        message: message.to_string(),
        path: path.as_ref().display().to_string(),
    }
}

/// Build a configuration error.
pub fn config_error(message: impl Into<String>) -> RlhfError {
    RlhfError::Config(message.into())
}
