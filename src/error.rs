//! Error types for enclosure-dl
//!
//! Errors fall into four groups:
//! - Admission errors (bad URL, unusable temp directory), returned synchronously from `queue`
//! - Transfer errors (network, HTTP status, truncation, stalls), captured by the task runner
//!   and surfaced through [`Event::Stopped`](crate::types::Event::Stopped)
//! - State errors (an operation that the task's current state does not allow)
//! - Invariant violations (double shutdown, shutdown from the consumer thread), which are
//!   returned immediately instead of deadlocking or continuing

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::TaskId;

/// Result type alias for enclosure-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for enclosure-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent_downloads")
        key: Option<String>,
    },

    /// The temporary download directory could not be created or written
    #[error("temp directory '{}' is unusable: {source}", path.display())]
    TempDir {
        /// The configured temp directory
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// The URL is not an absolute, parseable URI
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// URL that was requested
        url: String,
    },

    /// Stream carried more bytes than the announced size
    #[error("server sent more than the announced {expected} bytes")]
    Oversized {
        /// Total size announced by the server
        expected: u64,
    },

    /// Stream closed before the announced size was received
    #[error("transfer truncated: expected {expected} bytes, received {received}")]
    Truncated {
        /// Total size announced by the server
        expected: u64,
        /// Bytes actually on disk
        received: u64,
    },

    /// Server announced a zero-length body
    #[error("server returned an empty body")]
    EmptyResponse,

    /// No data arrived within the configured stall timeout
    #[error("transfer stalled: no data for {}s", idle.as_secs())]
    Stalled {
        /// How long the transfer sat idle
        idle: Duration,
    },

    /// A transfer panicked; the task is failed and its slot released
    #[error("transfer panicked: {0}")]
    Panicked(String),

    /// Cannot perform operation in current state
    #[error("cannot {operation} task {task} in state {current_state}")]
    InvalidState {
        /// The task the operation targeted
        task: TaskId,
        /// The operation that was attempted (e.g., "pause", "resume")
        operation: String,
        /// The state that prevents the operation
        current_state: String,
    },

    /// Task already belongs to a group
    #[error("task {task} is already associated with a group")]
    AlreadyAssociated {
        /// The task that was added twice
        task: TaskId,
    },

    /// Task is not a member of this group
    #[error("task {task} is not a member of this group")]
    NotInGroup {
        /// The unknown task
        task: TaskId,
    },

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// Shutdown was requested a second time
    #[error("already shut down")]
    AlreadyShutDown,

    /// Shutdown was requested from a command running on the queue's own consumer
    #[error("cannot shut down a command queue from its own consumer")]
    ShutdownFromConsumer,

    /// No tokio runtime is available to borrow workers from
    #[error("no tokio runtime available")]
    NoRuntime,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error indicates a broken concurrency contract rather than a runtime failure
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::AlreadyShutDown | Error::ShutdownFromConsumer | Error::AlreadyAssociated { .. }
        )
    }
}
