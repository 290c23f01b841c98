//! Run-level counters and timers.
//!
//! Pure bookkeeping shared by the pipeline, the coordinator and the loader.
//! Nothing here performs I/O; the binary prints [`MetricsCollector::format_summary`]
//! at the end of a run.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const RECORDS_PROCESSED: &str = "records_processed";
pub const RECORDS_SKIPPED: &str = "records_skipped";
pub const RECORDS_ALREADY_LOADED: &str = "records_already_loaded";
pub const RECORDS_COMMITTED: &str = "records_committed";
pub const UPLOADS_SUCCEEDED: &str = "uploads_succeeded";
pub const UPLOADS_FAILED: &str = "uploads_failed";
pub const BYTES_UPLOADED: &str = "bytes_uploaded";
pub const ROWS_LOADED: &str = "rows_loaded";
pub const BATCHES_COMMITTED: &str = "batches_committed";
pub const BATCHES_ROLLED_BACK: &str = "batches_rolled_back";
pub const ANNOTATIONS_LOADED: &str = "annotations_loaded";
pub const ANNOTATIONS_FILTERED: &str = "annotations_filtered";

pub const TIMER_PROCESSING: &str = "processing";
pub const TIMER_STAGING: &str = "staging";
pub const TIMER_COMMIT: &str = "commit";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimerStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TimerStats {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub elapsed: Duration,
    pub counters: BTreeMap<String, u64>,
    pub timers: BTreeMap<String, TimerStats>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    counters: BTreeMap<String, u64>,
    timers: BTreeMap<String, TimerStats>,
}

#[derive(Debug)]
pub struct MetricsCollector {
    started: Instant,
    state: Mutex<MetricsState>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(MetricsState::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MetricsState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn increment(&self, name: &str, by: u64) {
        self.with_state(|state| *state.counters.entry(name.to_string()).or_insert(0) += by);
    }

    pub fn count(&self, name: &str) -> u64 {
        self.with_state(|state| state.counters.get(name).copied().unwrap_or(0))
    }

    pub fn record_duration(&self, name: &str, elapsed: Duration) {
        self.with_state(|state| state.timers.entry(name.to_string()).or_default().record(elapsed));
    }

    /// Records the time until the guard is dropped.
    pub fn start_timer<'a>(&'a self, name: &'a str) -> TimerGuard<'a> {
        TimerGuard {
            metrics: self,
            name,
            started: Instant::now(),
        }
    }

    pub fn timer(&self, name: &str) -> TimerStats {
        self.with_state(|state| state.timers.get(name).copied().unwrap_or_default())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Per-second rate of a counter since the collector was created.
    pub fn rate(&self, name: &str) -> f64 {
        rate_per_second(self.count(name), self.elapsed())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self.elapsed();
        self.with_state(|state| MetricsSnapshot {
            elapsed,
            counters: state.counters.clone(),
            timers: state.timers.clone(),
        })
    }

    pub fn format_summary(&self) -> String {
        format_snapshot(&self.snapshot())
    }
}

pub struct TimerGuard<'a> {
    metrics: &'a MetricsCollector,
    name: &'a str,
    started: Instant,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_duration(self.name, self.started.elapsed());
    }
}

pub fn rate_per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        count as f64 / secs
    }
}

fn format_snapshot(snapshot: &MetricsSnapshot) -> String {
    let secs = snapshot.elapsed.as_secs_f64();
    let mut lines = vec![format!("Run summary ({:.1}s)", secs)];

    for (name, value) in &snapshot.counters {
        let value = if name == BYTES_UPLOADED {
            crate::progress::format_bytes(*value)
        } else {
            value.to_string()
        };
        lines.push(format!("  {:<24} {}", name, value));
    }

    let committed = snapshot.counter(RECORDS_COMMITTED);
    if committed > 0 {
        lines.push(format!(
            "  {:<24} {:.2} records/s",
            "throughput",
            rate_per_second(committed, snapshot.elapsed)
        ));
    }

    for (name, stats) in &snapshot.timers {
        lines.push(format!(
            "  {:<24} {} runs, mean {:.2}s, max {:.2}s",
            format!("{} time", name),
            stats.count,
            stats.mean().as_secs_f64(),
            stats.max.as_secs_f64()
        ));
    }

    lines.join("\n")
}
