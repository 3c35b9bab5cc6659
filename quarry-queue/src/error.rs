//! Error types for queue backends

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur when talking to a queue backend
///
/// Connectivity failures are fatal to the current call and may be retried by
/// calling again. Discovery failures are reported distinctly so callers can
/// decide whether to stop serving a subscription.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backend client could not be constructed
    #[error("failed to connect to project {project}: {message}")]
    Connect { project: String, message: String },

    /// A request to the backend failed on the network
    #[error("{operation} failed for {target}: {source}")]
    Transport {
        operation: &'static str,
        target: String,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with an error status
    #[error("{operation} failed for {target} (status {status}): {message}")]
    Api {
        operation: &'static str,
        target: String,
        status: u16,
        message: String,
    },

    /// An existence check or enumeration failed
    #[error("{operation} failed for {target}: {message}")]
    Discovery {
        operation: &'static str,
        target: String,
        message: String,
    },

    /// Local file system failure
    #[error("{operation} failed on {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A backend response or stored message could not be decoded
    #[error("failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    /// A bounded discovery call ran out of time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The caller cancelled a discovery call
    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },
}

impl QueueError {
    pub fn discovery(
        operation: &'static str,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Discovery {
            operation,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Client construction or network failures
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Transport { .. } | Self::Timeout { .. }
        ) || matches!(self, Self::Api { status, .. } if *status >= 500 || *status == 401 || *status == 403)
    }

    /// Existence check or enumeration failures
    pub fn is_discovery(&self) -> bool {
        matches!(self, Self::Discovery { .. })
            || matches!(self, Self::Api { status: 404, .. })
    }
}
