//! Dataset side of a load: discovery, per-record processing and the
//! annotation feed.

pub mod annotations;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod scanner;

pub use annotations::{parse_annotations, AnnotationFeed, AnnotationRow, ItemType};
pub use models::{ImageSlot, RecognitionData, Skip, SkipReason};
pub use pipeline::{ParallelDataProcessor, ProcessOutcome, ProcessRequest};
pub use processor::{normalize_image, RecordProcessor};
pub use scanner::{recognition_id_from_dir, DatasetScanner};
