//! Object store backends.
//!
//! [`ObjectStore`] is the narrow surface the blob client needs. The S3
//! implementation lives in [`super::s3`]; tests plug in an in-memory store.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Request reached the backend and failed, or never got there
    #[error("Object store request failed: {message}")]
    Backend {
        status: Option<u16>,
        message: String,
    },

    #[error("Object '{0}' already exists")]
    AlreadyExists(String),

    #[error("Object '{0}' not found")]
    NotFound(String),

    /// Backend has no native support for the operation
    #[error("Operation not supported by object store: {0}")]
    Unsupported(&'static str),

    #[error("{operation} of '{path}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        path: String,
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn backend(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Backend {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::Backend { status, .. } => *status,
            StorageError::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// True for "duplicate" style responses, which count as success on upload.
    pub fn is_already_exists(&self) -> bool {
        match self {
            StorageError::AlreadyExists(_) => true,
            StorageError::Backend { status, message } => {
                let message = message.to_lowercase();
                *status == Some(409)
                    || message.contains("already exists")
                    || message.contains("duplicate")
            },
            _ => false,
        }
    }

    /// True when the backend is asking us to slow down.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            StorageError::Backend { status, message } => {
                if matches!(status, Some(429) | Some(503)) {
                    return true;
                }
                let message = message.to_lowercase();
                RATE_LIMIT_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
            },
            StorageError::RetriesExhausted { source, .. } => source.is_rate_limited(),
            _ => false,
        }
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "too many requests",
    "slow down",
    "slowdown",
    "throttl",
];

pub type StorageResult<T> = Result<T, StorageError>;

/// Minimal object store operations, all scoped to one bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `data` at `key`, replacing any existing object.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()>;

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// All keys under `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Server-side move. Backends without one return [`StorageError::Unsupported`].
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// Delete several keys in one request.
    async fn remove_many(&self, keys: &[String]) -> StorageResult<()>;

    /// Fails when the bucket cannot be reached.
    async fn health_check(&self) -> StorageResult<()> {
        self.exists(".health").await.map(|_| ())
    }

    fn bucket(&self) -> &str;
}
