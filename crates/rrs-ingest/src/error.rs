//! Top-level error type for ingestion runs

use crate::db::DbError;
use crate::storage::StorageError;
use rrs_common::RrsError;
use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("{0}")]
    NotFound(String),

    /// Some blob uploads of a batch failed; nothing of the batch may be committed.
    #[error("Staging failed: {succeeded} uploads succeeded, {failed} failed")]
    Staging { succeeded: usize, failed: usize },

    #[error("Commit failed while {stage}: {source}")]
    Commit {
        stage: &'static str,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Batch {batch} failed after {committed} records were committed ({failed} records not loaded): {source}")]
    BatchFailed {
        batch: usize,
        committed: usize,
        failed: usize,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Transaction is {0}, expected {1}")]
    InvalidState(&'static str, &'static str),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Common(#[from] RrsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub(crate) fn commit(stage: &'static str, source: IngestError) -> Self {
        Self::Commit {
            stage,
            source: Box::new(source),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }
}
