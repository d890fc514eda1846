//! Error types shared across testbed crates.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangeIdError {
    #[error("change identifier `{0}` is empty after normalization")]
    Empty(String),

    #[error("derived name `{name}` exceeds 63 characters")]
    TooLong { name: String },
}

/// Errors from running an external command. A non-zero exit is not an
/// error here; callers inspect [`crate::CommandOutput`] instead.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("i/o error talking to `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
