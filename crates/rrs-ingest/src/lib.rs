//! RRS Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Bulk loader for recognition records: images go to an S3-compatible
//! bucket, rows go to PostgreSQL.
//!
//! # Overview
//!
//! - **Dataset**: locate the export directory and turn each record directory
//!   into a [`RecognitionData`] (metadata plus two normalized JPEGs)
//! - **Storage**: uploads with retry and an adaptive rate limiter
//! - **Database**: pooled connections, `COPY` bulk loads and the transform
//!   functions, all behind the [`Database`] / [`UnitOfWork`] traits
//! - **Transactions**: stage a batch in both stores, then commit it or roll
//!   it back as one unit
//!
//! # Example
//!
//! ```no_run
//! use rrs_ingest::config::{IngestConfig, PerformanceProfile};
//! use rrs_ingest::loader::{LoadRequest, RecognitionLoader};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env(false, PerformanceProfile::Balanced)?;
//!     let loader = RecognitionLoader::connect(config).await?;
//!     let report = loader
//!         .load(&LoadRequest::default(), &CancellationToken::new())
//!         .await?;
//!     println!("committed {} recognitions", report.committed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod loader;
pub mod metrics;
pub mod progress;
pub mod storage;
pub mod transaction;

pub use config::{Environment, IngestConfig, PerformanceProfile};
pub use db::{with_connection, Database, DbError, PgDatabase, UnitOfWork};
pub use error::{IngestError, IngestResult};
pub use ingest::{RecognitionData, Skip, SkipReason};
pub use loader::{LoadReport, LoadRequest, RecognitionLoader};
pub use metrics::MetricsCollector;
pub use storage::{BlobStore, ObjectStore, StorageError};
pub use transaction::{TransactionContext, TransactionState};
