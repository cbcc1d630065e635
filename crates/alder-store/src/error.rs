//! Error types for store operations.

use snafu::Snafu;

/// Errors from the backing key-value store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The connection was closed by `quit` and rejects further commands.
    #[snafu(display("store connection is closed"))]
    Closed,

    /// A key holds a value of a different kind than the command expects.
    #[snafu(display("key '{key}' holds a value of the wrong kind"))]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// The store replied with something the client cannot interpret.
    #[snafu(display("protocol error: {message}"))]
    Protocol {
        /// Description of what went wrong.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },
}

impl From<serde_json::Error> for StoreError {
    fn from(source: serde_json::Error) -> Self {
        StoreError::Serialization { source }
    }
}
