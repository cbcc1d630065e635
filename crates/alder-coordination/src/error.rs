//! Error types for coordination primitives.

use alder_store::StoreError;
use snafu::Snafu;

/// Errors from coordination primitives.
///
/// Race losses (failed lock acquire, stale fencing token) are not errors;
/// they are normal control-flow branches and never surface here.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// TTL below the minimum of one second, rejected before any store call.
    #[snafu(display("ttl must not be smaller than 1, got {ttl}"))]
    InvalidTtl {
        /// The rejected TTL.
        ttl: u64,
    },

    /// Count below the minimum of one, rejected before any store call.
    #[snafu(display("count must not be smaller than 1, got {count}"))]
    InvalidCount {
        /// The rejected count.
        count: usize,
    },

    /// Underlying storage error.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying error.
        source: StoreError,
    },

    /// JSON serialization/deserialization error.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },

    /// A task submitted to Queue or Throttle failed.
    ///
    /// For throttle followers this carries the leader's error verbatim, as
    /// broadcast across processes.
    #[snafu(display("task failed: {message}"))]
    Task {
        /// The task's error message.
        message: String,
    },

    /// The coordination runtime shut down while a caller was waiting.
    #[snafu(display("coordination runtime shut down"))]
    ShutDown,
}

impl From<StoreError> for CoordinationError {
    fn from(source: StoreError) -> Self {
        CoordinationError::Storage { source }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(source: serde_json::Error) -> Self {
        CoordinationError::Serialization { source }
    }
}
