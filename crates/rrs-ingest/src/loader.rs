//! End-to-end load runs.
//!
//! [`RecognitionLoader`] owns the database, the blob store and the run
//! configuration. A load looks up what is already ingested, processes the
//! remaining record directories in parallel, then commits the results in
//! batches of `batch_size`, one [`TransactionContext`] per batch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::IngestConfig;
use crate::db::queries::{self, BatchDeleteCounts};
use crate::db::{with_connection, Database, DbConfig, PgDatabase, UnitOfWork};
use crate::error::{IngestError, IngestResult};
use crate::ingest::{parse_annotations, DatasetScanner, ParallelDataProcessor, ProcessRequest, Skip};
use crate::metrics::MetricsCollector;
use crate::progress;
use crate::storage::{recognition_prefix, BlobStore, DeleteReport, RateLimiter, StorageConfig};
use crate::transaction::{AnnotationLoadSummary, AnnotationTransaction, TransactionContext};

/// Tables reported by [`RecognitionLoader::status`].
pub const STATUS_TABLES: &[&str] = &[
    queries::RECOGNITION_FILES_TABLE,
    queries::RECIPES_TABLE,
    queries::ANNOTATIONS_TABLE,
    "recognitions",
    "images",
    "recipes",
];

#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    /// Dataset root; searched in the configured paths when unset
    pub source: Option<PathBuf>,
    pub limit: Option<usize>,
    /// Defaults to [`generate_batch_id`]
    pub batch_id: Option<String>,
    /// Reprocess records that are already loaded
    pub force: bool,
    /// Overrides the configured temp-storage mode
    pub use_temp_storage: Option<bool>,
    pub show_progress: bool,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub batch_id: String,
    pub dataset: PathBuf,
    pub processed: usize,
    pub skips: Vec<Skip>,
    pub already_loaded: usize,
    pub committed: usize,
    pub batches: usize,
}

#[derive(Debug, Default)]
pub struct ResetReport {
    pub batch_id: String,
    pub recognition_ids: Vec<i64>,
    pub rows: BatchDeleteCounts,
    pub blobs: DeleteReport,
    /// Prefixes that could not be listed
    pub prefixes_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCount {
    pub table: &'static str,
    /// `None` when the table does not exist
    pub rows: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub bucket: String,
    pub database_error: Option<String>,
    pub storage_error: Option<String>,
    pub tables: Vec<TableCount>,
}

impl StatusReport {
    pub fn is_healthy(&self) -> bool {
        self.database_error.is_none() && self.storage_error.is_none()
    }
}

pub struct RecognitionLoader<D: Database> {
    db: D,
    storage: BlobStore,
    config: IngestConfig,
    metrics: Arc<MetricsCollector>,
}

impl RecognitionLoader<PgDatabase> {
    /// Connect to PostgreSQL and S3 with settings from the environment.
    pub async fn connect(config: IngestConfig) -> IngestResult<Self> {
        let db_config = DbConfig::from_env()?;
        let db = PgDatabase::connect(&db_config).await?;

        let storage_config = StorageConfig::from_env()?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let storage = BlobStore::connect(&storage_config, limiter, config.retry.clone()).await?;

        info!(
            environment = config.environment.as_str(),
            bucket = storage.bucket(),
            threads = config.threads,
            batch_size = config.batch_size,
            "Loader connected"
        );
        Ok(Self::new(db, storage, config))
    }
}

impl<D: Database> RecognitionLoader<D> {
    pub fn new(db: D, storage: BlobStore, config: IngestConfig) -> Self {
        Self {
            db,
            storage,
            config,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn storage(&self) -> &BlobStore {
        &self.storage
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Ids already present in the `recognitions` table.
    pub async fn existing_ids(&self) -> IngestResult<HashSet<i64>> {
        Ok(with_connection(&self.db, |unit| unit.existing_ids()).await?)
    }

    /// Run one full load.
    ///
    /// Stops at the first batch that fails; earlier batches stay committed
    /// and are reported in [`IngestError::BatchFailed`]. Cancellation is
    /// checked between batches.
    #[instrument(skip(self, request, cancel), fields(source = ?request.source, limit = ?request.limit))]
    pub async fn load(
        &self,
        request: &LoadRequest,
        cancel: &CancellationToken,
    ) -> IngestResult<LoadReport> {
        let dataset = match &request.source {
            Some(source) => source.clone(),
            None => DatasetScanner::find_dataset(&self.config.dataset_paths)?,
        };
        let batch_id = request.batch_id.clone().unwrap_or_else(generate_batch_id);
        let use_temp_storage = request
            .use_temp_storage
            .unwrap_or(self.config.use_temp_storage);
        info!(
            dataset = %dataset.display(),
            batch_id = %batch_id,
            use_temp_storage,
            force = request.force,
            "Starting load"
        );

        let existing_ids = if request.force {
            HashSet::new()
        } else {
            let ids = self.existing_ids().await?;
            info!(count = ids.len(), "Found already loaded recognitions");
            ids
        };

        let processor = ParallelDataProcessor::new(self.config.threads, Arc::clone(&self.metrics))
            .with_progress(request.show_progress);
        let outcome = processor
            .process_dataset(
                &ProcessRequest {
                    dataset: dataset.clone(),
                    batch_id: batch_id.clone(),
                    limit: request.limit,
                    existing_ids,
                    force: request.force,
                },
                cancel,
            )
            .await?;

        let mut report = LoadReport {
            batch_id,
            dataset,
            processed: outcome.records.len(),
            skips: outcome.skips,
            already_loaded: outcome.already_loaded,
            ..LoadReport::default()
        };
        if outcome.records.is_empty() {
            info!(already_loaded = report.already_loaded, "Nothing new to load");
            return Ok(report);
        }

        let chunks: Vec<_> = outcome.records.chunks(self.config.batch_size).collect();
        let bar = if request.show_progress {
            progress::create_progress_bar(chunks.len() as u64, "Committing batches")
        } else {
            indicatif::ProgressBar::hidden()
        };

        for (index, chunk) in chunks.into_iter().enumerate() {
            if cancel.is_cancelled() {
                bar.abandon();
                warn!(
                    committed = report.committed,
                    remaining = report.processed - report.committed,
                    "Load cancelled between batches"
                );
                return Err(IngestError::Cancelled);
            }

            let result = TransactionContext::new(&self.db, &self.storage)
                .with_upload_workers(self.config.upload_workers())
                .with_metrics(Arc::clone(&self.metrics))
                .run(chunk, use_temp_storage)
                .await;

            match result {
                Ok(summary) => {
                    report.committed += summary.records;
                    report.batches += 1;
                    bar.inc(1);
                },
                Err(e) => {
                    bar.abandon();
                    error!(batch = index + 1, error = %e, "Batch failed, stopping load");
                    return Err(IngestError::BatchFailed {
                        batch: index + 1,
                        committed: report.committed,
                        failed: report.processed - report.committed,
                        source: Box::new(e),
                    });
                },
            }
        }
        bar.finish_and_clear();

        info!(
            batch_id = %report.batch_id,
            committed = report.committed,
            batches = report.batches,
            skipped = report.skips.len(),
            "Load complete"
        );
        Ok(report)
    }

    /// Load the detection feed at `path`, or the configured file when `None`.
    #[instrument(skip(self))]
    pub async fn load_annotations(&self, path: Option<&Path>) -> IngestResult<AnnotationLoadSummary> {
        let path = path.unwrap_or(&self.config.annotations_file);
        let contents = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IngestError::not_found(format!("Annotation file not found: {}", path.display()))
            } else {
                IngestError::Io(e)
            }
        })?;

        let feed = tokio::task::spawn_blocking(move || parse_annotations(&contents)).await??;
        info!(
            images = feed.images,
            detections = feed.rows.len(),
            unmatched_images = feed.unmatched_images,
            malformed_boxes = feed.malformed_boxes,
            "Parsed annotation feed"
        );

        let summary = AnnotationTransaction::new(&self.db)
            .with_metrics(Arc::clone(&self.metrics))
            .run(&feed.rows)
            .await?;
        info!(
            loaded = summary.loaded,
            filtered = summary.filtered,
            items = summary.transform.items,
            annotations = summary.transform.annotations,
            "Annotations loaded"
        );
        Ok(summary)
    }

    pub async fn batch_recognition_ids(&self, batch_id: &str) -> IngestResult<Vec<i64>> {
        let batch_id = batch_id.to_string();
        Ok(with_connection(&self.db, move |unit| {
            Box::pin(async move { queries::recognition_ids_for_batch(unit, &batch_id).await })
        })
        .await?)
    }

    /// Delete the raw rows of `batch_id`, then the blobs of each of its recognitions.
    #[instrument(skip(self))]
    pub async fn reset_batch(&self, batch_id: &str) -> IngestResult<ResetReport> {
        let owned = batch_id.to_string();
        let (recognition_ids, rows) = with_connection(&self.db, move |unit| {
            Box::pin(async move {
                let ids = queries::recognition_ids_for_batch(unit, &owned).await?;
                let rows = queries::delete_batch_rows(unit, &owned).await?;
                Ok((ids, rows))
            })
        })
        .await?;

        if recognition_ids.is_empty() {
            return Err(IngestError::not_found(format!("No rows found for batch '{}'", batch_id)));
        }
        info!(
            recognitions = recognition_ids.len(),
            recognition_files = rows.recognition_files,
            recipes = rows.recipes,
            annotations = rows.annotations,
            "Deleted batch rows"
        );

        let mut report = ResetReport {
            batch_id: batch_id.to_string(),
            rows,
            ..ResetReport::default()
        };
        for id in &recognition_ids {
            match self.storage.delete_prefix(&recognition_prefix(*id)).await {
                Ok(deleted) => {
                    report.blobs.deleted += deleted.deleted;
                    report.blobs.failed += deleted.failed;
                },
                Err(e) => {
                    warn!(recognition_id = id, error = %e, "Could not list blobs for deletion");
                    report.prefixes_failed += 1;
                },
            }
        }
        report.recognition_ids = recognition_ids;

        info!(
            deleted = report.blobs.deleted,
            failed = report.blobs.failed + report.prefixes_failed,
            "Batch reset complete"
        );
        Ok(report)
    }

    /// Database and bucket health plus row counts of the ingested tables.
    pub async fn status(&self) -> StatusReport {
        let mut report = StatusReport {
            bucket: self.storage.bucket().to_string(),
            ..StatusReport::default()
        };

        let counts = with_connection(&self.db, |unit| {
            Box::pin(async move {
                let mut counts = Vec::with_capacity(STATUS_TABLES.len());
                for &table in STATUS_TABLES {
                    counts.push(TableCount {
                        table,
                        rows: queries::row_count(unit, table).await?,
                    });
                }
                Ok(counts)
            })
        })
        .await;
        match counts {
            Ok(tables) => report.tables = tables,
            Err(e) => {
                error!(error = %e, "Database health check failed");
                report.database_error = Some(e.to_string());
            },
        }

        if let Err(e) = self.storage.health_check().await {
            error!(bucket = %report.bucket, error = %e, "Storage health check failed");
            report.storage_error = Some(e.to_string());
        }
        report
    }
}

/// `batch_YYYYMMDD_HHMMSS` in local time.
pub fn generate_batch_id() -> String {
    chrono::Local::now().format("batch_%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_batch_id_format() {
        let id = generate_batch_id();
        assert!(id.starts_with("batch_"));
        assert_eq!(id.len(), "batch_20240101_120000".len());
        assert!(id[6..].chars().all(|c| c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_status_report_health() {
        let mut report = StatusReport::default();
        assert!(report.is_healthy());
        report.storage_error = Some("bucket missing".to_string());
        assert!(!report.is_healthy());
    }
}
