//! In-memory records produced by the dataset processor.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

use crate::db::{SqlRow, SqlValue};

/// One normalized camera image, ready for upload.
#[derive(Debug, Clone)]
pub struct ImageSlot {
    /// File name in the dataset, kept for logging
    pub source_name: String,
    /// Name within the recognition, e.g. `camera1.jpg`
    pub relative_path: String,
    /// Storage key, e.g. `recognitions/42/camera1.jpg`
    pub storage_path: String,
    pub width: u32,
    pub height: u32,
    /// JPEG-encoded RGB image
    pub data: Bytes,
}

/// One ingestible recognition: metadata plus both camera images.
#[derive(Debug, Clone)]
pub struct RecognitionData {
    pub recognition_id: i64,
    pub batch_id: String,
    pub active_menu: Option<Value>,
    pub images: [ImageSlot; 2],
    pub recipe: Option<Value>,
}

impl RecognitionData {
    /// `(storage_path, bytes)` for both images.
    pub fn upload_items(&self) -> Vec<(String, Bytes)> {
        self.images
            .iter()
            .map(|slot| (slot.storage_path.clone(), slot.data.clone()))
            .collect()
    }

    /// Row for `raw.recognition_files`.
    pub fn recognition_files_row(&self) -> SqlRow {
        let [first, second] = &self.images;
        vec![
            SqlValue::Int(self.recognition_id),
            SqlValue::from(self.batch_id.as_str()),
            SqlValue::from(self.active_menu.clone()),
            SqlValue::from(first.relative_path.as_str()),
            SqlValue::from(second.relative_path.as_str()),
            SqlValue::from(first.width),
            SqlValue::from(first.height),
            SqlValue::from(second.width),
            SqlValue::from(second.height),
        ]
    }

    /// Row for `raw.recipes`, when the record carries a recipe.
    pub fn recipe_row(&self) -> Option<SqlRow> {
        self.recipe
            .as_ref()
            .map(|payload| vec![SqlValue::Int(self.recognition_id), SqlValue::Json(payload.clone())])
    }

    pub fn image_bytes(&self) -> usize {
        self.images.iter().map(|slot| slot.data.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingFiles,
    MalformedMetadata,
    ImageCountMismatch,
    InvalidImage,
    InvalidDirectoryName,
}

impl SkipReason {
    pub fn as_str(&self) -> &str {
        match self {
            SkipReason::MissingFiles => "missing_files",
            SkipReason::MalformedMetadata => "malformed_metadata",
            SkipReason::ImageCountMismatch => "image_count_mismatch",
            SkipReason::InvalidImage => "invalid_image",
            SkipReason::InvalidDirectoryName => "invalid_directory_name",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record directory that was left out of the run, and why.
#[derive(Debug, Clone)]
pub struct Skip {
    pub directory: PathBuf,
    pub recognition_id: Option<i64>,
    pub reason: SkipReason,
    pub detail: String,
}

impl Skip {
    pub fn new(
        directory: impl Into<PathBuf>,
        recognition_id: Option<i64>,
        reason: SkipReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            recognition_id,
            reason,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Skip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.directory.display(), self.reason, self.detail)
    }
}
