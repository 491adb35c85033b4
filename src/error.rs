//! Custom error types for the pipeline.
//!
//! `PipelineError` is the single error enum shared by the acquisition side
//! (watcher, converter, transport) and the analysis side (receiver, results
//! store, results server). It is built with `thiserror`, and `#[from]`
//! conversions let the `?` operator lift the underlying I/O, JSON,
//! configuration and regex errors.
//!
//! ## Error Classes
//!
//! - **`Io`**: file-system and socket failures. On the acquisition side a
//!   socket failure ends the transport session.
//! - **`Conversion`**: a raw file could not be turned into a volume. The
//!   converter logs these and drops the file.
//! - **`Protocol`**: the peer sent bytes that do not follow the volume or
//!   results wire format.
//! - **`HandshakeTimeout`**, **`SessionStopped`**, **`SessionFailed`**:
//!   transport session state errors.
//! - **`Config`** / **`Configuration`**: figment extraction failures and
//!   semantic validation failures respectively.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, PipelineError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Failed to convert {path}: {reason}")]
    Conversion { path: PathBuf, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported dtype '{0}'")]
    UnsupportedDtype(String),

    #[error("Voxel buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Transport session was stopped by the remote endpoint")]
    SessionStopped,

    #[error("Transport session failed earlier and cannot be reused")]
    SessionFailed,

    #[error("Volume index {0} does not fit the 4-digit query format")]
    IndexOutOfRange(u32),
}

impl From<figment::Error> for PipelineError {
    fn from(value: figment::Error) -> Self {
        PipelineError::Config(Box::new(value))
    }
}

impl PipelineError {
    /// Builds a conversion error for `path`.
    pub fn conversion(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::Conversion {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error ends a transport session.
    ///
    /// Conversion problems only cost one file; everything touching the socket
    /// or the session state is fatal.
    pub fn is_fatal_to_session(&self) -> bool {
        !matches!(
            self,
            PipelineError::Conversion { .. }
                | PipelineError::UnsupportedDtype(_)
                | PipelineError::BufferSize { .. }
        )
    }
}
