//! Shared fakes and fixtures for the integration tests
//!
//! - [`MemoryObjectStore`]: bucket in a `BTreeMap`, with failure injection
//!   and optional throttling
//! - [`MemoryDatabase`]: tables in memory; each unit of work edits a private
//!   copy that replaces the shared state on commit
//! - dataset builders writing `export_*/recognition_<id>` trees into a temp dir

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use image::{Rgb, RgbImage};
use rrs_ingest::config::{Environment, IngestConfig, PerformanceProfile};
use rrs_ingest::db::queries::{
    ANNOTATIONS_TABLE, RECIPES_TABLE, RECOGNITION_FILES_TABLE, TRANSFORM_ANNOTATIONS,
    TRANSFORM_RECIPES, TRANSFORM_RECOGNITIONS,
};
use rrs_ingest::db::{Database, DbError, DbResult, SqlRow, SqlValue, UnitOfWork};
use rrs_ingest::storage::{
    BlobStore, ObjectStore, RateLimitConfig, RateLimiter, RetryPolicy, StorageError, StorageResult,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const TEST_BUCKET: &str = "rrs-test";
pub const TEMP_PREFIX: &str = "temp";

// ============================================================================
// Object store
// ============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    put_calls: AtomicUsize,
    failing_keys: Mutex<HashSet<String>>,
    transient_failures: AtomicUsize,
    min_put_interval: Mutex<Option<Duration>>,
    last_put: Mutex<Option<Instant>>,
    throttled: AtomicUsize,
    rename_disabled: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every put of `key` fails with a 500.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.lock().unwrap().insert(key.into());
    }

    /// The next `count` puts fail with a 500, whatever their key.
    pub fn fail_next_puts(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Reject puts arriving sooner than `interval` after the last accepted one with a 429.
    pub fn throttle_below(&self, interval: Duration) {
        *self.min_put_interval.lock().unwrap() = Some(interval);
    }

    pub fn disable_rename(&self) {
        self.rename_disabled.store(true, Ordering::SeqCst);
    }

    pub fn insert(&self, key: &str, data: &'static [u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::from_static(data));
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn throttled(&self) -> usize {
        self.throttled.load(Ordering::SeqCst)
    }

    fn check_throttle(&self) -> StorageResult<()> {
        let Some(interval) = *self.min_put_interval.lock().unwrap() else {
            return Ok(());
        };
        let mut last = self.last_put.lock().unwrap();
        let now = Instant::now();
        if let Some(previous) = *last {
            if now.duration_since(previous) < interval {
                self.throttled.fetch_add(1, Ordering::SeqCst);
                return Err(StorageError::backend(Some(429), "SlowDown: reduce your request rate"));
            }
        }
        *last = Some(now);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> StorageResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(StorageError::backend(Some(500), "InternalError"));
        }
        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if transient.is_ok() {
            return Err(StorageError::backend(Some(500), "connection reset"));
        }
        self.check_throttle()?;

        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.contains(key))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        if self.rename_disabled.load(Ordering::SeqCst) {
            return Err(StorageError::Unsupported("rename"));
        }
        let mut objects = self.objects.lock().unwrap();
        let data = objects
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        objects.insert(to.to_string(), data);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> StorageResult<()> {
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    fn bucket(&self) -> &str {
        TEST_BUCKET
    }
}

pub fn blob_store(backend: Arc<MemoryObjectStore>) -> BlobStore {
    blob_store_with(backend, RateLimitConfig::default(), RetryPolicy::immediate(3))
}

pub fn blob_store_with(
    backend: Arc<MemoryObjectStore>,
    rate_limit: RateLimitConfig,
    retry: RetryPolicy,
) -> BlobStore {
    BlobStore::new(
        backend,
        TEMP_PREFIX,
        Arc::new(RateLimiter::new(rate_limit)),
        retry,
    )
}

// ============================================================================
// Database
// ============================================================================

pub const RECOGNITIONS: &str = "recognitions";
pub const IMAGES: &str = "images";
pub const RECIPES: &str = "recipes";
pub const ITEMS: &str = "items";

type Tables = HashMap<String, Vec<SqlRow>>;

#[derive(Default)]
struct Failures {
    bulk_load_table: Option<String>,
    transforms: bool,
    commits: bool,
}

struct MemoryState {
    committed: Mutex<Tables>,
    failures: Mutex<Failures>,
    checked_out: AtomicUsize,
    commits: AtomicUsize,
    max_connections: usize,
}

/// In-memory stand-in for the PostgreSQL pool.
#[derive(Clone)]
pub struct MemoryDatabase {
    state: Arc<MemoryState>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::with_max_connections(4)
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(max_connections: usize) -> Self {
        let tables = [
            RECOGNITION_FILES_TABLE,
            RECIPES_TABLE,
            ANNOTATIONS_TABLE,
            RECOGNITIONS,
            IMAGES,
            RECIPES,
            ITEMS,
        ]
        .into_iter()
        .map(|name| (name.to_string(), Vec::new()))
        .collect();

        Self {
            state: Arc::new(MemoryState {
                committed: Mutex::new(tables),
                failures: Mutex::new(Failures::default()),
                checked_out: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                max_connections,
            }),
        }
    }

    pub fn fail_bulk_load_into(&self, table: &str) {
        self.state.failures.lock().unwrap().bulk_load_table = Some(table.to_string());
    }

    pub fn fail_transforms(&self) {
        self.state.failures.lock().unwrap().transforms = true;
    }

    pub fn fail_commits(&self) {
        self.state.failures.lock().unwrap().commits = true;
    }

    pub fn clear_failures(&self) {
        *self.state.failures.lock().unwrap() = Failures::default();
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<SqlRow> {
        self.state
            .committed
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    pub fn recognition_ids(&self) -> HashSet<i64> {
        self.rows(RECOGNITIONS)
            .iter()
            .filter_map(|row| row.first().and_then(SqlValue::as_i64))
            .collect()
    }

    pub fn insert_committed(&self, table: &str, rows: Vec<SqlRow>) {
        self.state
            .committed
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Unit = MemoryUnit;

    async fn begin(&self) -> DbResult<MemoryUnit> {
        let claimed = self.state.checked_out.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < self.state.max_connections).then_some(n + 1)
        });
        if claimed.is_err() {
            return Err(DbError::PoolExhausted);
        }
        Ok(MemoryUnit {
            state: Arc::clone(&self.state),
            working: None,
        })
    }

    fn checked_out(&self) -> usize {
        self.state.checked_out.load(Ordering::SeqCst)
    }
}

pub struct MemoryUnit {
    state: Arc<MemoryState>,
    working: Option<Tables>,
}

impl Drop for MemoryUnit {
    fn drop(&mut self) {
        self.state.checked_out.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryUnit {
    fn tables(&mut self) -> &mut Tables {
        let state = &self.state;
        self.working
            .get_or_insert_with(|| state.committed.lock().unwrap().clone())
    }

    fn table(&mut self, name: &str) -> &mut Vec<SqlRow> {
        self.tables().entry(name.to_string()).or_default()
    }

    fn ids_of(&mut self, table: &str) -> HashSet<i64> {
        self.table(table)
            .iter()
            .filter_map(|row| row.first().and_then(SqlValue::as_i64))
            .collect()
    }

    fn batch_ids(&mut self, batch_id: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .table(RECOGNITION_FILES_TABLE)
            .iter()
            .filter(|row| row.get(1).and_then(SqlValue::as_str) == Some(batch_id))
            .filter_map(|row| row.first().and_then(SqlValue::as_i64))
            .collect();
        ids.sort_unstable();
        ids
    }

    fn delete_where(&mut self, table: &str, keep: impl Fn(&SqlRow) -> bool) -> Vec<SqlRow> {
        let rows = std::mem::take(self.table(table));
        let (kept, removed): (Vec<_>, Vec<_>) = rows.into_iter().partition(|row| keep(row));
        *self.table(table) = kept;
        removed
            .iter()
            .map(|row| vec![row[0].clone()])
            .collect()
    }

    fn transform(&mut self, name: &str) -> DbResult<SqlRow> {
        if self.state.failures.lock().unwrap().transforms {
            return Err(DbError::Sqlx(sqlx::Error::Protocol(format!("{} failed", name))));
        }

        match name {
            TRANSFORM_RECOGNITIONS => {
                let known = self.ids_of(RECOGNITIONS);
                let fresh: Vec<SqlRow> = self
                    .table(RECOGNITION_FILES_TABLE)
                    .iter()
                    .filter(|row| row[0].as_i64().is_some_and(|id| !known.contains(&id)))
                    .cloned()
                    .collect();
                for row in &fresh {
                    self.table(RECOGNITIONS).push(vec![row[0].clone(), row[1].clone()]);
                    self.table(IMAGES).push(vec![row[0].clone(), row[3].clone()]);
                    self.table(IMAGES).push(vec![row[0].clone(), row[4].clone()]);
                }
                let n = fresh.len() as i64;
                Ok(vec![SqlValue::Int(n), SqlValue::Int(2 * n), SqlValue::Int(0)])
            },
            TRANSFORM_RECIPES => {
                let known = self.ids_of(RECIPES);
                let fresh: Vec<SqlRow> = self
                    .table(RECIPES_TABLE)
                    .iter()
                    .filter(|row| row[0].as_i64().is_some_and(|id| !known.contains(&id)))
                    .cloned()
                    .collect();
                let n = fresh.len() as i64;
                self.table(RECIPES).extend(fresh);
                Ok(vec![SqlValue::Int(n), SqlValue::Int(0), SqlValue::Int(0)])
            },
            TRANSFORM_ANNOTATIONS => {
                let raw = self.table(ANNOTATIONS_TABLE).clone();
                let items: HashSet<(i64, String)> = raw
                    .iter()
                    .filter_map(|row| Some((row[0].as_i64()?, row[3].as_str()?.to_string())))
                    .collect();
                let n = items.len() as i64;
                *self.table(ITEMS) = items
                    .into_iter()
                    .map(|(id, class)| vec![SqlValue::Int(id), SqlValue::Text(class)])
                    .collect();
                Ok(vec![SqlValue::Int(n), SqlValue::Int(raw.len() as i64)])
            },
            other => Err(DbError::config(format!("unknown function {}", other))),
        }
    }
}

fn text_param(params: &[SqlValue], index: usize) -> DbResult<String> {
    params
        .get(index)
        .and_then(SqlValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| DbError::config(format!("missing text parameter ${}", index + 1)))
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn bulk_load(&mut self, table: &str, columns: &[&str], rows: &[SqlRow]) -> DbResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if self.state.failures.lock().unwrap().bulk_load_table.as_deref() == Some(table) {
            return Err(DbError::Sqlx(sqlx::Error::Protocol(format!("COPY into {} failed", table))));
        }
        if rows.iter().any(|row| row.len() != columns.len()) {
            return Err(DbError::Encode(format!("row width does not match {} columns", columns.len())));
        }
        if table == RECOGNITION_FILES_TABLE {
            let present = self.ids_of(table);
            if let Some(id) = rows.iter().filter_map(|row| row[0].as_i64()).find(|id| present.contains(id)) {
                return Err(DbError::Sqlx(sqlx::Error::Protocol(format!(
                    "duplicate key value violates unique constraint: recognition_id={}",
                    id
                ))));
            }
        }

        self.table(table).extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Vec<SqlRow>>> {
        let sql = sql.split_whitespace().collect::<Vec<_>>().join(" ");

        if sql.contains("information_schema.tables") {
            let schema = text_param(params, 0)?;
            let name = text_param(params, 1)?;
            let key = if schema == "public" {
                name
            } else {
                format!("{}.{}", schema, name)
            };
            let exists = self.tables().contains_key(&key);
            return Ok(Some(vec![vec![SqlValue::Bool(exists)]]));
        }

        if sql == "SELECT 1" {
            return Ok(Some(vec![vec![SqlValue::Int(1)]]));
        }

        if sql == "SELECT id FROM recognitions" {
            let rows = self
                .table(RECOGNITIONS)
                .iter()
                .map(|row| vec![row[0].clone()])
                .collect();
            return Ok(Some(rows));
        }

        if let Some(rest) = sql.strip_prefix("SELECT * FROM ") {
            let name = rest.trim_end_matches("()");
            return self.transform(name).map(|row| Some(vec![row]));
        }

        if let Some(table) = sql.strip_prefix("SELECT COUNT(*) FROM ") {
            let count = self.table(table).len() as i64;
            return Ok(Some(vec![vec![SqlValue::Int(count)]]));
        }

        if sql.starts_with("SELECT recognition_id FROM raw.recognition_files WHERE batch_id = $1") {
            let batch_id = text_param(params, 0)?;
            let rows = self
                .batch_ids(&batch_id)
                .into_iter()
                .map(|id| vec![SqlValue::Int(id)])
                .collect();
            return Ok(Some(rows));
        }

        if let Some(rest) = sql.strip_prefix("DELETE FROM ") {
            let batch_id = text_param(params, 0)?;
            let (table, _) = rest.split_once(' ').unwrap_or((rest, ""));
            let table = table.to_string();
            let in_batch: HashSet<i64> = self.batch_ids(&batch_id).into_iter().collect();
            let removed = self.delete_where(&table, |row| {
                !row[0].as_i64().is_some_and(|id| in_batch.contains(&id))
            });
            return Ok(Some(removed));
        }

        Err(DbError::config(format!("unsupported statement: {}", sql)))
    }

    async fn commit(&mut self) -> DbResult<()> {
        let Some(working) = self.working.take() else {
            return Ok(());
        };
        if self.state.failures.lock().unwrap().commits {
            return Err(DbError::Sqlx(sqlx::Error::Protocol("commit failed".to_string())));
        }
        *self.state.committed.lock().unwrap() = working;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.working = None;
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

pub fn test_config(batch_size: usize) -> IngestConfig {
    IngestConfig {
        environment: Environment::Local,
        profile: PerformanceProfile::Custom,
        threads: 2,
        batch_size,
        use_temp_storage: false,
        rate_limit: RateLimitConfig::default(),
        retry: RetryPolicy::immediate(2),
        dataset_paths: Vec::new(),
        annotations_file: PathBuf::from("missing.json"),
    }
}

// ============================================================================
// Dataset fixtures
// ============================================================================

/// Dataset root holding one `export_*` directory.
pub struct DatasetFixture {
    pub dir: tempfile::TempDir,
}

impl DatasetFixture {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("export_2024_01_01")).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn record_dir(&self, id: i64) -> PathBuf {
        self.root()
            .join("export_2024_01_01")
            .join(format!("recognition_{}", id))
    }

    /// Record with metadata, a recipe and `images` photos.
    pub fn add_record(&self, id: i64, images: usize) -> PathBuf {
        let dir = self.record_dir(id);
        std::fs::create_dir_all(dir.join("photos")).unwrap();
        std::fs::write(
            dir.join(format!("{}_AM.json", id)),
            format!(r#"{{"menu": [{}]}}"#, id),
        )
        .unwrap();
        std::fs::write(
            dir.join(format!("{}_correct_dishes.json", id)),
            r#"{"dishes": [{"name": "soup"}]}"#,
        )
        .unwrap();

        let names = [format!("{}_Main.jpg", id), format!("{}_Side.jpg", id), format!("{}_Extra.jpg", id)];
        for name in names.iter().take(images) {
            write_jpeg(&dir.join("photos").join(name), 6, 4);
        }
        dir
    }
}

pub fn write_jpeg(path: &Path, width: u32, height: u32) {
    RgbImage::from_pixel(width, height, Rgb([10, 120, 200]))
        .save(path)
        .unwrap();
}
