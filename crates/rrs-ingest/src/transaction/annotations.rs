//! Database-only transaction for the annotation feed.
//!
//! Rows are kept only when their recognition is already loaded, so one
//! orphan detection does not make the whole COPY fail on a foreign key.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::TransactionState;
use crate::db::queries::{self, AnnotationTransformCounts, ANNOTATIONS_COLUMNS, ANNOTATIONS_TABLE};
use crate::db::{Database, SqlRow, UnitOfWork};
use crate::error::{IngestError, IngestResult};
use crate::ingest::AnnotationRow;
use crate::metrics::{self, MetricsCollector};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationLoadSummary {
    pub received: usize,
    pub loaded: u64,
    /// Rows dropped because their recognition is not loaded
    pub filtered: usize,
    pub transform: AnnotationTransformCounts,
}

pub struct AnnotationTransaction<'a, D: Database> {
    db: &'a D,
    metrics: Option<Arc<MetricsCollector>>,
    state: TransactionState,
    unit: Option<D::Unit>,
}

impl<'a, D: Database> AnnotationTransaction<'a, D> {
    pub fn new(db: &'a D) -> Self {
        Self {
            db,
            metrics: None,
            state: TransactionState::Pending,
            unit: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub async fn open(&mut self) -> IngestResult<()> {
        self.state.require(TransactionState::Pending)?;
        self.unit = Some(self.db.begin().await?);
        self.state = TransactionState::Processing;
        Ok(())
    }

    /// Ids of loaded recognitions, read on the held connection.
    pub async fn existing_ids(&mut self) -> IngestResult<HashSet<i64>> {
        self.state.require(TransactionState::Processing)?;
        let unit = self
            .unit
            .as_mut()
            .ok_or(IngestError::InvalidState("closed", "open"))?;
        Ok(unit.existing_ids().await?)
    }

    /// Filter `rows` to known recognitions, bulk-load them and run the transform.
    #[instrument(skip(self, rows, existing), fields(rows = rows.len(), known = existing.len()))]
    pub async fn load(
        &mut self,
        rows: &[AnnotationRow],
        existing: &HashSet<i64>,
    ) -> IngestResult<AnnotationLoadSummary> {
        self.state.require(TransactionState::Processing)?;

        let kept: Vec<SqlRow> = rows
            .iter()
            .filter(|row| existing.contains(&row.recognition_id))
            .map(AnnotationRow::to_row)
            .collect();
        let filtered = rows.len() - kept.len();
        if filtered > 0 {
            info!(kept = kept.len(), filtered, "Dropped annotations for unknown recognitions");
        }

        let unit = self
            .unit
            .as_mut()
            .ok_or(IngestError::InvalidState("closed", "open"))?;
        let loaded = unit
            .bulk_load(ANNOTATIONS_TABLE, ANNOTATIONS_COLUMNS, &kept)
            .await?;
        let transform = queries::transform_initial_items_and_annotations(unit).await?;

        if let Some(metrics) = &self.metrics {
            metrics.increment(metrics::ANNOTATIONS_LOADED, loaded);
            metrics.increment(metrics::ANNOTATIONS_FILTERED, filtered as u64);
        }
        debug!(loaded, items = transform.items, "Annotations staged");

        Ok(AnnotationLoadSummary {
            received: rows.len(),
            loaded,
            filtered,
            transform,
        })
    }

    pub async fn commit(&mut self) -> IngestResult<()> {
        self.state.require(TransactionState::Processing)?;
        let Some(mut unit) = self.unit.take() else {
            return Err(IngestError::InvalidState("closed", "open"));
        };

        match unit.commit().await {
            Ok(()) => {
                self.state = TransactionState::Complete;
                Ok(())
            },
            Err(e) => {
                error!(error = %e, "Annotation commit failed");
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed commit also failed");
                }
                self.state = TransactionState::RolledBack;
                Err(IngestError::commit("committing annotations", e.into()))
            },
        }
    }

    pub async fn rollback(&mut self) {
        if let Some(mut unit) = self.unit.take() {
            if let Err(e) = unit.rollback().await {
                error!(error = %e, "Annotation rollback failed");
            }
        }
        if self.state != TransactionState::Complete {
            self.state = TransactionState::RolledBack;
        }
    }

    pub async fn finish<T>(mut self, result: IngestResult<T>) -> IngestResult<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            },
            Err(e) => {
                self.rollback().await;
                Err(e)
            },
        }
    }

    /// Open, filter against the loaded recognitions, load and finish.
    pub async fn run(mut self, rows: &[AnnotationRow]) -> IngestResult<AnnotationLoadSummary> {
        self.open().await?;
        let result = match self.existing_ids().await {
            Ok(existing) if existing.is_empty() => Err(IngestError::not_found(
                "No recognitions loaded yet; load recognitions before annotations",
            )),
            Ok(existing) => self.load(rows, &existing).await,
            Err(e) => Err(e),
        };
        self.finish(result).await
    }
}
