//! Blob storage client for recognition images.
//!
//! [`BlobStore`] wraps an [`ObjectStore`] backend with request pacing,
//! retries, temp-prefix staging, and the batch helpers the transaction
//! coordinator needs.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub mod backend;
pub mod config;
pub mod rate_limit;
pub mod retry;
pub mod s3;

pub use backend::{ObjectStore, StorageError, StorageResult};
pub use config::StorageConfig;
pub use rate_limit::{LimiterSnapshot, RateLimitConfig, RateLimitStrategy, RateLimiter};
pub use retry::RetryPolicy;
pub use s3::S3ObjectStore;

#[derive(Debug, Clone)]
pub struct UploadResult {
    /// Key actually written, including the temp prefix when staged
    pub key: String,
    pub checksum: String,
    pub size: usize,
    pub attempts: u32,
    /// Backend reported the object as already present
    pub already_existed: bool,
}

/// Outcome of [`BlobStore::batch_upload`]. Successful keys are reported even
/// when other uploads of the batch failed.
#[derive(Debug, Default)]
pub struct BatchUploadReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchUploadReport {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn ObjectStore>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    temp_prefix: String,
}

impl BlobStore {
    pub fn new(
        backend: Arc<dyn ObjectStore>,
        temp_prefix: impl Into<String>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        let temp_prefix = temp_prefix.into().trim_matches('/').to_string();
        Self {
            backend,
            limiter,
            retry,
            temp_prefix,
        }
    }

    /// S3-backed client for `config`.
    pub async fn connect(
        config: &StorageConfig,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> StorageResult<Self> {
        let backend = S3ObjectStore::new(config).await?;
        Ok(Self::new(
            Arc::new(backend),
            config.temp_prefix.clone(),
            limiter,
            retry,
        ))
    }

    pub fn bucket(&self) -> &str {
        self.backend.bucket()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn temp_path(&self, path: &str) -> String {
        format!("{}/{}", self.temp_prefix, path.trim_start_matches('/'))
    }

    /// Inverse of [`temp_path`](Self::temp_path). Keys outside the temp prefix are returned as-is.
    pub fn permanent_path<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.temp_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(key)
    }

    /// Run `op` under the limiter, retrying failures with backoff.
    ///
    /// "Already exists" responses are returned straight away so callers can
    /// decide whether they count as success.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        path: &str,
        mut op: F,
    ) -> StorageResult<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 1;
        loop {
            self.limiter.wait().await;

            match op().await {
                Ok(value) => {
                    self.limiter.record_success();
                    return Ok((value, attempt));
                },
                Err(e) if e.is_already_exists() => return Err(e),
                Err(e) => {
                    let rate_limited = e.is_rate_limited();
                    self.limiter.record_error(rate_limited);

                    if attempt >= self.retry.max_attempts {
                        return Err(StorageError::RetriesExhausted {
                            operation,
                            path: path.to_string(),
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }

                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        path,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        rate_limited,
                        error = %e,
                        "Object store request failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }

    #[instrument(skip(self, data), fields(bucket = %self.bucket(), size = data.len()))]
    pub async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
        use_temp: bool,
    ) -> StorageResult<UploadResult> {
        let key = if use_temp {
            self.temp_path(path)
        } else {
            path.to_string()
        };
        let checksum = calculate_sha256(&data);
        let size = data.len();

        let outcome = self
            .with_retry("upload", &key, || {
                self.backend.put(&key, data.clone(), content_type)
            })
            .await;

        match outcome {
            Ok(((), attempts)) => {
                debug!(key = %key, attempts, "Uploaded object");
                Ok(UploadResult {
                    key,
                    checksum,
                    size,
                    attempts,
                    already_existed: false,
                })
            },
            Err(e) if e.is_already_exists() => {
                debug!(key = %key, "Object already present, treating as uploaded");
                self.limiter.record_success();
                Ok(UploadResult {
                    key,
                    checksum,
                    size,
                    attempts: 1,
                    already_existed: true,
                })
            },
            Err(e) => Err(e),
        }
    }

    /// Upload every `(path, bytes)` pair. `workers == 1` uploads strictly in order.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub async fn batch_upload(
        &self,
        items: Vec<(String, Bytes)>,
        use_temp: bool,
        workers: usize,
    ) -> BatchUploadReport {
        let outcomes: Vec<(String, StorageResult<UploadResult>)> = if workers <= 1 {
            let mut outcomes = Vec::with_capacity(items.len());
            for (path, data) in items {
                let result = self.upload(&path, data, content_type_for(&path), use_temp).await;
                outcomes.push((path, result));
            }
            outcomes
        } else {
            stream::iter(items)
                .map(|(path, data)| async move {
                    let result = self.upload(&path, data, content_type_for(&path), use_temp).await;
                    (path, result)
                })
                .buffer_unordered(workers)
                .collect()
                .await
        };

        let mut report = BatchUploadReport::default();
        for (path, result) in outcomes {
            match result {
                Ok(uploaded) => report.succeeded.push(uploaded.key),
                Err(e) => {
                    warn!(path = %path, error = %e, "Upload failed");
                    report.failed.push((path, e.to_string()));
                },
            }
        }

        info!(
            succeeded = report.success_count(),
            failed = report.failure_count(),
            "Batch upload finished"
        );
        report
    }

    pub async fn download(&self, key: &str) -> StorageResult<Bytes> {
        let (data, _) = self
            .with_retry("download", key, || self.backend.get(key))
            .await?;
        Ok(data)
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.backend.exists(key).await
    }

    pub async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.backend.list(prefix).await
    }

    /// Move an object, copying through this process when the backend cannot rename.
    #[instrument(skip(self))]
    pub async fn move_object(&self, from: &str, to: &str) -> StorageResult<()> {
        match self.backend.rename(from, to).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "Native move failed, falling back to copy");
                let data = self.download(from).await?;
                self.upload(to, data, content_type_for(to), false).await?;
                self.backend.remove(from).await?;
                Ok(())
            },
        }
    }

    /// Delete `keys`, one bulk request first and per-key deletes if that fails.
    #[instrument(skip(self, keys), fields(count = keys.len()))]
    pub async fn delete_batch(&self, keys: &[String]) -> DeleteReport {
        if keys.is_empty() {
            return DeleteReport::default();
        }

        match self.backend.remove_many(keys).await {
            Ok(()) => DeleteReport {
                deleted: keys.len(),
                failed: 0,
            },
            Err(e) => {
                warn!(error = %e, "Bulk delete failed, deleting objects one by one");
                let mut report = DeleteReport::default();
                for key in keys {
                    match self.backend.remove(key).await {
                        Ok(()) => report.deleted += 1,
                        Err(e) => {
                            warn!(key = %key, error = %e, "Delete failed");
                            report.failed += 1;
                        },
                    }
                }
                report
            },
        }
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        self.backend.health_check().await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> StorageResult<DeleteReport> {
        let keys = self.list(prefix).await?;
        Ok(self.delete_batch(&keys).await)
    }
}

/// Storage key for one camera image of a recognition.
pub fn recognition_image_path(recognition_id: i64, camera: u8) -> String {
    format!("recognitions/{}/camera{}.jpg", recognition_id, camera)
}

pub fn recognition_prefix(recognition_id: i64) -> String {
    format!("recognitions/{}/", recognition_id)
}

pub fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

fn calculate_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
