// ABOUTME: Error taxonomy shared by the local, remote, and hybrid run stores.
// ABOUTME: Separates not-found and invalid-id conditions from transient I/O and timeouts.

use std::time::Duration;

use tfledger_core::InvalidRunId;
use thiserror::Error;

/// Errors that can occur during run store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("output not found: {0}")]
    OutputNotFound(String),

    #[error(transparent)]
    InvalidRunId(#[from] InvalidRunId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{0} is not supported by this store")]
    Unsupported(&'static str),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// True for the two "absent from this backend" conditions.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::RunNotFound(_) | StoreError::OutputNotFound(_))
    }

    /// True for failures worth retrying: filesystem or network trouble and timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Io(_) | StoreError::Timeout { .. } | StoreError::Task(_) => true,
            StoreError::ObjectStore(e) => !matches!(e, object_store::Error::NotFound { .. }),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
