//! Two-phase load of one batch across the object store and the database.
//!
//! A [`TransactionContext`] holds one database connection for its whole
//! life. [`stage`](TransactionContext::stage) uploads the images and
//! bulk-loads the raw rows without committing;
//! [`commit`](TransactionContext::commit) commits the rows, promotes blobs
//! staged under the temp prefix and runs the transform functions;
//! [`rollback`](TransactionContext::rollback) undoes whatever staging left
//! behind.
//!
//! ```text
//! Pending --open--> Processing --commit--> Complete
//!                        |
//!                        +----rollback---> RolledBack
//! ```
//!
//! With temp storage a failure only ever leaves objects under the temp
//! prefix. Without it, uploads land on their final keys and rollback deletes
//! them again, which leaves a short window in which a reader can see an
//! image whose row never commits.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::db::queries::{
    self, RecipeTransformCounts, RecognitionTransformCounts, RECIPES_COLUMNS, RECIPES_TABLE,
    RECOGNITION_FILES_COLUMNS, RECOGNITION_FILES_TABLE,
};
use crate::db::{Database, SqlRow, UnitOfWork};
use crate::error::{IngestError, IngestResult};
use crate::ingest::RecognitionData;
use crate::metrics::{self, MetricsCollector};
use crate::storage::BlobStore;

pub mod annotations;

pub use annotations::{AnnotationLoadSummary, AnnotationTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Processing,
    Complete,
    RolledBack,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "pending",
            TransactionState::Processing => "processing",
            TransactionState::Complete => "complete",
            TransactionState::RolledBack => "rolled_back",
        }
    }

    pub(crate) fn require(self, expected: TransactionState) -> IngestResult<()> {
        if self == expected {
            Ok(())
        } else {
            Err(IngestError::InvalidState(self.as_str(), expected.as_str()))
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What staging has written so far. Cleared by commit and rollback.
#[derive(Debug, Default)]
pub struct StagingRecord {
    /// Uploaded keys still under the temp prefix
    pub temp_keys: Vec<String>,
    /// Uploaded or promoted keys at their final location
    pub permanent_keys: Vec<String>,
    pub recognition_ids: Vec<i64>,
    /// Rows were sent to the database on the held connection
    pub rows_staged: bool,
    /// The row transaction has been committed
    pub db_committed: bool,
}

impl StagingRecord {
    pub fn is_empty(&self) -> bool {
        self.temp_keys.is_empty() && self.permanent_keys.is_empty() && !self.rows_staged
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub records: usize,
    pub uploads: usize,
    pub recognition_rows: u64,
    pub recipe_rows: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub records: usize,
    /// Objects moved from the temp prefix to their final keys
    pub promoted: usize,
    pub recognitions: RecognitionTransformCounts,
    pub recipes: RecipeTransformCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    pub blobs_deleted: usize,
    pub blobs_failed: usize,
    /// Promoted blobs left in place because their rows were already committed
    pub blobs_kept: usize,
}

pub struct TransactionContext<'a, D: Database> {
    db: &'a D,
    storage: &'a BlobStore,
    upload_workers: usize,
    metrics: Option<Arc<MetricsCollector>>,
    state: TransactionState,
    unit: Option<D::Unit>,
    staging: StagingRecord,
}

impl<'a, D: Database> TransactionContext<'a, D> {
    pub fn new(db: &'a D, storage: &'a BlobStore) -> Self {
        Self {
            db,
            storage,
            upload_workers: 1,
            metrics: None,
            state: TransactionState::Pending,
            unit: None,
            staging: StagingRecord::default(),
        }
    }

    pub fn with_upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = workers.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn staging(&self) -> &StagingRecord {
        &self.staging
    }

    fn count(&self, name: &str, by: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.increment(name, by);
        }
    }

    fn time(&self, name: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_duration(name, started.elapsed());
        }
    }

    /// Check out the connection the whole transaction runs on.
    pub async fn open(&mut self) -> IngestResult<()> {
        self.state.require(TransactionState::Pending)?;
        self.unit = Some(self.db.begin().await?);
        self.state = TransactionState::Processing;
        debug!("Transaction opened");
        Ok(())
    }

    /// Upload images and insert raw rows, uncommitted.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn stage(
        &mut self,
        records: &[RecognitionData],
        use_temp_storage: bool,
    ) -> IngestResult<StageSummary> {
        self.state.require(TransactionState::Processing)?;
        let started = Instant::now();

        let uploads: Vec<_> = records.iter().flat_map(RecognitionData::upload_items).collect();
        let upload_count = uploads.len();
        let bytes: usize = records.iter().map(RecognitionData::image_bytes).sum();
        info!(uploads = upload_count, use_temp_storage, "Staging images");

        let report = self
            .storage
            .batch_upload(uploads, use_temp_storage, self.upload_workers)
            .await;

        // Successful uploads are tracked even when others failed.
        let staged_keys = if use_temp_storage {
            &mut self.staging.temp_keys
        } else {
            &mut self.staging.permanent_keys
        };
        staged_keys.extend(report.succeeded.iter().cloned());
        self.staging
            .recognition_ids
            .extend(records.iter().map(|record| record.recognition_id));

        self.count(metrics::UPLOADS_SUCCEEDED, report.success_count() as u64);
        if !report.is_complete() {
            self.count(metrics::UPLOADS_FAILED, report.failure_count() as u64);
            return Err(IngestError::Staging {
                succeeded: report.success_count(),
                failed: report.failure_count(),
            });
        }
        self.count(metrics::BYTES_UPLOADED, bytes as u64);

        let recognition_rows: Vec<SqlRow> = records
            .iter()
            .map(RecognitionData::recognition_files_row)
            .collect();
        let recipe_rows: Vec<SqlRow> = records.iter().filter_map(RecognitionData::recipe_row).collect();

        let unit = self
            .unit
            .as_mut()
            .ok_or(IngestError::InvalidState("closed", "open"))?;
        self.staging.rows_staged = true;
        let recognition_loaded = unit
            .bulk_load(RECOGNITION_FILES_TABLE, RECOGNITION_FILES_COLUMNS, &recognition_rows)
            .await?;
        let recipe_loaded = unit
            .bulk_load(RECIPES_TABLE, RECIPES_COLUMNS, &recipe_rows)
            .await?;

        self.count(metrics::ROWS_LOADED, recognition_loaded + recipe_loaded);
        self.time(metrics::TIMER_STAGING, started);
        info!(
            records = records.len(),
            recognition_rows = recognition_loaded,
            recipe_rows = recipe_loaded,
            "Batch staged"
        );

        Ok(StageSummary {
            records: records.len(),
            uploads: upload_count,
            recognition_rows: recognition_loaded,
            recipe_rows: recipe_loaded,
        })
    }

    /// Commit rows, promote temp blobs, run transforms. Rolls back on any failure.
    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> IngestResult<CommitSummary> {
        self.state.require(TransactionState::Processing)?;
        let started = Instant::now();

        match self.commit_steps().await {
            Ok(summary) => {
                self.state = TransactionState::Complete;
                self.staging = StagingRecord::default();
                self.unit = None;

                self.count(metrics::BATCHES_COMMITTED, 1);
                self.count(metrics::RECORDS_COMMITTED, summary.records as u64);
                self.time(metrics::TIMER_COMMIT, started);
                info!(
                    records = summary.records,
                    promoted = summary.promoted,
                    recognitions = summary.recognitions.recognitions,
                    images = summary.recognitions.images,
                    recipes = summary.recipes.recipes,
                    "Transaction committed"
                );
                Ok(summary)
            },
            Err(e) => {
                error!(error = %e, "Commit failed, rolling back");
                self.rollback().await;
                Err(e)
            },
        }
    }

    async fn commit_steps(&mut self) -> IngestResult<CommitSummary> {
        let storage = self.storage;
        let unit = self
            .unit
            .as_mut()
            .ok_or(IngestError::InvalidState("closed", "open"))?;

        unit.commit()
            .await
            .map_err(|e| IngestError::commit("committing staged rows", e.into()))?;
        self.staging.db_committed = true;

        let mut pending = std::mem::take(&mut self.staging.temp_keys).into_iter();
        let mut promoted = 0;
        while let Some(temp_key) = pending.next() {
            let permanent = storage.permanent_path(&temp_key).to_string();
            if let Err(e) = storage.move_object(&temp_key, &permanent).await {
                self.staging.temp_keys.push(temp_key);
                self.staging.temp_keys.extend(pending);
                return Err(IngestError::commit("promoting staged blobs", e.into()));
            }
            self.staging.permanent_keys.push(permanent);
            promoted += 1;
        }

        let recognitions = queries::transform_recognitions_and_images(unit)
            .await
            .map_err(|e| IngestError::commit("running transforms", e.into()))?;
        let recipes = queries::transform_recipes(unit)
            .await
            .map_err(|e| IngestError::commit("running transforms", e.into()))?;
        unit.commit()
            .await
            .map_err(|e| IngestError::commit("committing transforms", e.into()))?;

        Ok(CommitSummary {
            records: self.staging.recognition_ids.len(),
            promoted,
            recognitions,
            recipes,
        })
    }

    /// Best-effort undo of everything staged. Releases the connection.
    #[instrument(skip(self))]
    pub async fn rollback(&mut self) -> RollbackSummary {
        if matches!(self.state, TransactionState::Complete | TransactionState::RolledBack) {
            warn!(state = %self.state, "Rollback requested on a finished transaction");
            return RollbackSummary::default();
        }
        warn!(
            records = self.staging.recognition_ids.len(),
            temp_blobs = self.staging.temp_keys.len(),
            permanent_blobs = self.staging.permanent_keys.len(),
            "Rolling back transaction"
        );

        if let Some(mut unit) = self.unit.take() {
            if let Err(e) = unit.rollback().await {
                error!(error = %e, "Database rollback failed");
            }
        }

        let mut summary = RollbackSummary::default();

        let temp_keys = std::mem::take(&mut self.staging.temp_keys);
        if !temp_keys.is_empty() {
            if self.staging.db_committed {
                // Committed rows point at these images; leave them for a later promotion.
                error!(
                    count = temp_keys.len(),
                    keys = ?temp_keys,
                    "Rows already committed, keeping unpromoted blobs under the temp prefix"
                );
                summary.blobs_kept += temp_keys.len();
            } else {
                let report = self.storage.delete_batch(&temp_keys).await;
                summary.blobs_deleted += report.deleted;
                summary.blobs_failed += report.failed;
            }
        }

        let permanent_keys = std::mem::take(&mut self.staging.permanent_keys);
        if !permanent_keys.is_empty() {
            if self.staging.db_committed {
                warn!(
                    count = permanent_keys.len(),
                    "Rows already committed, keeping blobs at their final keys"
                );
                summary.blobs_kept += permanent_keys.len();
            } else {
                let report = self.storage.delete_batch(&permanent_keys).await;
                summary.blobs_deleted += report.deleted;
                summary.blobs_failed += report.failed;
            }
        }

        if summary.blobs_failed > 0 {
            error!(failed = summary.blobs_failed, "Some staged blobs could not be deleted");
        }

        self.staging = StagingRecord::default();
        self.state = TransactionState::RolledBack;
        self.count(metrics::BATCHES_ROLLED_BACK, 1);
        warn!(deleted = summary.blobs_deleted, kept = summary.blobs_kept, "Transaction rolled back");
        summary
    }

    /// Commit when `result` is `Ok`, roll back when it is `Err`.
    ///
    /// The connection is released either way and the body's error is
    /// returned after cleanup.
    pub async fn finish<T>(mut self, result: IngestResult<T>) -> IngestResult<(T, CommitSummary)> {
        match result {
            Ok(value) => {
                let summary = self.commit().await?;
                Ok((value, summary))
            },
            Err(e) => {
                self.rollback().await;
                Err(e)
            },
        }
    }

    /// Open, stage `records` and finish.
    pub async fn run(
        mut self,
        records: &[RecognitionData],
        use_temp_storage: bool,
    ) -> IngestResult<CommitSummary> {
        self.open().await?;
        let staged = self.stage(records, use_temp_storage).await;
        self.finish(staged).await.map(|(_, summary)| summary)
    }
}

impl<D: Database> Drop for TransactionContext<'_, D> {
    fn drop(&mut self) {
        if self.state == TransactionState::Processing && !self.staging.is_empty() {
            warn!(
                temp_blobs = self.staging.temp_keys.len(),
                permanent_blobs = self.staging.permanent_keys.len(),
                "Transaction dropped while staged, blobs left behind"
            );
        }
    }
}
