//! Turns one recognition directory into a [`RecognitionData`].
//!
//! Expected layout of a record directory:
//!
//! ```text
//! recognition_42/
//!   42_AM.json                 active menu (required)
//!   42_correct_dishes.json     recipe (optional)
//!   photos/                    optional; images may also sit next to the JSON
//!     ..._Main.jpg             primary camera
//!     ..._Side.jpg
//! ```

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::models::{ImageSlot, RecognitionData, Skip, SkipReason};
use super::scanner::recognition_id_from_dir;
use crate::storage::recognition_image_path;

pub const JPEG_QUALITY: u8 = 85;

/// Filename marker of the primary camera shot (compared case-insensitively).
pub const PRIMARY_IMAGE_MARKER: &str = "main";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Debug, Clone)]
pub struct RecordProcessor {
    batch_id: String,
    jpeg_quality: u8,
}

impl RecordProcessor {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            jpeg_quality: JPEG_QUALITY,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Load, validate and normalize one record directory.
    pub fn process(&self, dir: &Path) -> Result<RecognitionData, Skip> {
        let recognition_id = recognition_id_from_dir(dir).ok_or_else(|| {
            Skip::new(
                dir,
                None,
                SkipReason::InvalidDirectoryName,
                "directory name is not recognition_<id> or <id>",
            )
        })?;
        let skip = |reason, detail: String| Skip::new(dir, Some(recognition_id), reason, detail);

        let menu_path = find_metadata(dir, "_AM.json", "AM.json").ok_or_else(|| {
            skip(SkipReason::MissingFiles, "no active menu (*_AM.json or AM.json)".to_string())
        })?;
        let active_menu = read_json(&menu_path).map_err(|(reason, detail)| skip(reason, detail))?;

        let recipe = match find_metadata(dir, "_correct_dishes.json", "CD.json") {
            Some(path) => read_json(&path).map_err(|(reason, detail)| skip(reason, detail))?,
            None => None,
        };

        let image_files = find_images(dir)
            .map_err(|e| skip(SkipReason::MissingFiles, format!("cannot list images: {}", e)))?;
        let [primary, secondary] = order_images(image_files).map_err(|count| {
            skip(
                SkipReason::ImageCountMismatch,
                format!("expected 2 images, found {}", count),
            )
        })?;

        let images = [
            self.load_image(recognition_id, 1, &primary)
                .map_err(|detail| skip(SkipReason::InvalidImage, detail))?,
            self.load_image(recognition_id, 2, &secondary)
                .map_err(|detail| skip(SkipReason::InvalidImage, detail))?,
        ];

        debug!(recognition_id, "Processed recognition");
        Ok(RecognitionData {
            recognition_id,
            batch_id: self.batch_id.clone(),
            active_menu,
            images,
            recipe,
        })
    }

    fn load_image(&self, recognition_id: i64, camera: u8, path: &Path) -> Result<ImageSlot, String> {
        let source_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let raw = std::fs::read(path).map_err(|e| format!("{}: {}", source_name, e))?;
        let (data, width, height) = normalize_image(&raw, self.jpeg_quality)
            .map_err(|e| format!("{}: {}", source_name, e))?;

        Ok(ImageSlot {
            source_name,
            relative_path: format!("camera{}.jpg", camera),
            storage_path: recognition_image_path(recognition_id, camera),
            width,
            height,
            data,
        })
    }
}

/// Decode any supported image, convert to 8-bit RGB and re-encode as JPEG.
pub fn normalize_image(raw: &[u8], quality: u8) -> image::ImageResult<(Bytes, u32, u32)> {
    let decoded = image::load_from_memory(raw)?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut encoded = Vec::with_capacity(raw.len());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut encoded, quality))?;

    Ok((Bytes::from(encoded), width, height))
}

fn find_metadata(dir: &Path, suffix: &str, exact: &str) -> Option<PathBuf> {
    let mut candidates = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(suffix) || name == exact)
        })
        .collect::<Vec<_>>();
    candidates.sort();
    candidates.into_iter().next()
}

/// `Ok(None)` for a JSON `null` document.
fn read_json(path: &Path) -> Result<Option<Value>, (SkipReason, String)> {
    let name = path.display();
    let contents = std::fs::read(path)
        .map_err(|e| (SkipReason::MissingFiles, format!("{}: {}", name, e)))?;
    let value: Value = serde_json::from_slice(&contents)
        .map_err(|e| (SkipReason::MalformedMetadata, format!("{}: {}", name, e)))?;
    Ok((!value.is_null()).then_some(value))
}

fn find_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let photos = dir.join("photos");
    let search = if photos.is_dir() { photos } else { dir.to_path_buf() };

    let mut images = Vec::new();
    for entry in std::fs::read_dir(&search)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_image && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Primary shot first; name order otherwise. `Err(count)` unless exactly two.
fn order_images(images: Vec<PathBuf>) -> Result<[PathBuf; 2], usize> {
    let [first, second]: [PathBuf; 2] = images.try_into().map_err(|v: Vec<PathBuf>| v.len())?;

    let is_primary = |path: &Path| {
        path.file_name()
            .map(|name| name.to_string_lossy().to_lowercase().contains(PRIMARY_IMAGE_MARKER))
            .unwrap_or(false)
    };

    if is_primary(&second) && !is_primary(&first) {
        Ok([second, first])
    } else {
        Ok([first, second])
    }
}
