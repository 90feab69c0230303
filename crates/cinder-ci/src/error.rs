//! Error types for pipeline operations

use cinder_state::StorageError;
use thiserror::Error;

use crate::upload::UploadError;

#[derive(Error, Debug)]
pub enum CiError {
    #[error("Invalid stage plan: {0}")]
    InvalidPlan(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stage {stage} could not start `{program}`: {source}")]
    Spawn {
        stage: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage {stage} timed out after {timeout_secs} seconds")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("Stage {stage} produced no artifact at {path}")]
    MissingArtifact { stage: String, path: String },

    #[error("Environment provisioning failed: {0}")]
    Provision(#[source] std::io::Error),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Ledger error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, CiError>;
