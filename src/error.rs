//! Error taxonomy for probing sessions.
//!
//! Only connection-level and identity-level failures end a session. Per-probe
//! problems (timeouts, instrument errors, garbage payloads) are recorded as
//! [`crate::classifier::Outcome`]s instead of errors.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DoomError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Device identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("Catalog for identity '{active}' cannot accept entries for '{requested}'")]
    IdentityMismatch { active: String, requested: String },

    #[error("Failed to read command file {path}: {source}")]
    CatalogRead { path: PathBuf, source: io::Error },

    #[error("Command file not found at {0}")]
    CatalogNotFound(PathBuf),

    #[error("Failed to persist learned commands to {path}: {source}")]
    Persistence { path: PathBuf, source: io::Error },

    #[error("Failed to write session log {path}: {source}")]
    SessionLog { path: PathBuf, source: io::Error },

    #[error("Data directory not found")]
    NoDataDir,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode report: {0}")]
    Report(#[from] serde_json::Error),
}

/// Failures surfaced by a [`crate::transport::Transport`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Transport closed")]
    Closed,

    #[error("Reply exceeded {0} bytes")]
    Oversized(usize),

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransportError> for DoomError {
    fn from(err: TransportError) -> Self {
        DoomError::Connection(err.to_string())
    }
}
