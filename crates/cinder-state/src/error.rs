//! Error types for cinder-state

use thiserror::Error;

/// Errors raised by run ledger implementations
#[derive(Error, Debug)]
pub enum StorageError {
    /// No run with the given ID exists
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run is not in the state the operation requires
    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// A digest string was not 64 lowercase hex characters
    #[error("Invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// Filesystem error from a persistent backend
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
