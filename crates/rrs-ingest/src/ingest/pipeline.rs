//! Parallel record processing
//!
//! Scans the dataset, drops records that are already loaded, and runs
//! [`RecordProcessor`] over the rest on a bounded pool of blocking tasks.
//! Results arrive in completion order.

use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::models::{RecognitionData, Skip};
use super::processor::RecordProcessor;
use super::scanner::{recognition_id_from_dir, DatasetScanner};
use crate::error::{IngestError, IngestResult};
use crate::metrics::{self, MetricsCollector};
use crate::progress;

#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub dataset: PathBuf,
    pub batch_id: String,
    pub limit: Option<usize>,
    /// Ids already ingested; their directories are not processed unless `force`
    pub existing_ids: HashSet<i64>,
    pub force: bool,
}

#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub records: Vec<RecognitionData>,
    pub skips: Vec<Skip>,
    pub already_loaded: usize,
}

pub struct ParallelDataProcessor {
    threads: usize,
    metrics: Arc<MetricsCollector>,
    show_progress: bool,
}

impl ParallelDataProcessor {
    pub fn new(threads: usize, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            threads: threads.max(1),
            metrics,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Process every pending record directory of the dataset.
    ///
    /// Cancelling `cancel` stops new directories from being started; work
    /// already running completes and the call returns [`IngestError::Cancelled`].
    #[instrument(skip(self, request, cancel), fields(dataset = %request.dataset.display(), batch_id = %request.batch_id))]
    pub async fn process_dataset(
        &self,
        request: &ProcessRequest,
        cancel: &CancellationToken,
    ) -> IngestResult<ProcessOutcome> {
        let _timer = self.metrics.start_timer(metrics::TIMER_PROCESSING);

        let scanner = DatasetScanner::new(&request.dataset);
        let limit = request.limit;
        let dirs = tokio::task::spawn_blocking(move || scanner.record_dirs(limit)).await??;

        let (pending, already_loaded) = filter_existing(dirs, &request.existing_ids, request.force);
        self.metrics
            .increment(metrics::RECORDS_ALREADY_LOADED, already_loaded as u64);
        info!(
            pending = pending.len(),
            already_loaded,
            threads = self.threads,
            "Processing recognition directories"
        );

        let mut outcome = ProcessOutcome {
            already_loaded,
            ..ProcessOutcome::default()
        };
        if pending.is_empty() {
            return Ok(outcome);
        }

        let bar = if self.show_progress {
            progress::create_progress_bar(pending.len() as u64, "Processing recognitions")
        } else {
            ProgressBar::hidden()
        };

        let processor = Arc::new(RecordProcessor::new(request.batch_id.clone()));
        let mut results = std::pin::pin!(stream::iter(pending)
            .take_until(cancel.cancelled())
            .map(|dir| {
                let processor = Arc::clone(&processor);
                async move {
                    let path = dir.clone();
                    let result = tokio::task::spawn_blocking(move || processor.process(&dir)).await;
                    (path, result)
                }
            })
            .buffer_unordered(self.threads));

        while let Some((dir, result)) = results.next().await {
            bar.inc(1);
            match result {
                Ok(Ok(record)) => {
                    self.metrics.increment(metrics::RECORDS_PROCESSED, 1);
                    outcome.records.push(record);
                },
                Ok(Err(skip)) => {
                    warn!(
                        directory = %skip.directory.display(),
                        reason = %skip.reason,
                        detail = %skip.detail,
                        "Skipping recognition"
                    );
                    self.metrics.increment(metrics::RECORDS_SKIPPED, 1);
                    outcome.skips.push(skip);
                },
                Err(e) => {
                    error!(directory = %dir.display(), error = %e, "Record worker failed");
                    self.metrics.increment(metrics::RECORDS_SKIPPED, 1);
                },
            }
        }
        bar.finish_and_clear();

        if cancel.is_cancelled() {
            warn!(
                processed = outcome.records.len(),
                "Processing cancelled, discarding partial results"
            );
            return Err(IngestError::Cancelled);
        }

        info!(
            processed = outcome.records.len(),
            skipped = outcome.skips.len(),
            "Dataset processing finished"
        );
        Ok(outcome)
    }
}

/// Split off directories whose id is already loaded. Returns `(pending, already_loaded)`.
fn filter_existing(
    dirs: Vec<PathBuf>,
    existing: &HashSet<i64>,
    force: bool,
) -> (Vec<PathBuf>, usize) {
    if force || existing.is_empty() {
        return (dirs, 0);
    }

    let total = dirs.len();
    let pending: Vec<PathBuf> = dirs
        .into_iter()
        .filter(|dir| !recognition_id_from_dir(dir).is_some_and(|id| existing.contains(&id)))
        .collect();
    let skipped = total - pending.len();
    (pending, skipped)
}
