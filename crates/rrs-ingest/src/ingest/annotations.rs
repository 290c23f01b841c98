//! Parser for the detection-annotation feed.
//!
//! The feed is one JSON object keyed by source image path. Each entry holds
//! `dishes` and `plates` groups whose `qwen_detections` carry a `label` and a
//! `bbox_2d = [x1, y1, x2, y2]` box:
//!
//! ```json
//! {
//!   "data/recognition_100024/photos/100024_Main.jpg": {
//!     "dishes": {"qwen_detections": [{"bbox_2d": [10, 20, 110, 220], "label": "soup"}]},
//!     "plates": {"qwen_detections": []}
//!   }
//! }
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::db::{SqlRow, SqlValue};
use crate::error::IngestResult;
use rrs_common::RrsError;

const RECOGNITION_ID_PATTERN: &str = r"recognition_(\d+)";

/// Marker in the source path of primary-camera images.
const PRIMARY_CAMERA_MARKER: &str = "Main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemType {
    Food,
    Plate,
}

impl ItemType {
    pub fn as_str(&self) -> &str {
        match self {
            ItemType::Food => "FOOD",
            ItemType::Plate => "PLATE",
        }
    }
}

/// One row of `raw.qwen_annotations`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRow {
    pub recognition_id: i64,
    /// `camera1.jpg` or `camera2.jpg`
    pub image_path: String,
    /// `{x, y, w, h}`
    pub bbox: Value,
    pub class_name: String,
    pub item_type: ItemType,
    pub external_id: Option<String>,
}

impl AnnotationRow {
    pub fn to_row(&self) -> SqlRow {
        vec![
            SqlValue::Int(self.recognition_id),
            SqlValue::from(self.image_path.as_str()),
            SqlValue::Json(self.bbox.clone()),
            SqlValue::from(self.class_name.as_str()),
            SqlValue::from(self.item_type.as_str()),
            SqlValue::from(self.external_id.clone()),
        ]
    }
}

#[derive(Debug, Default)]
pub struct AnnotationFeed {
    pub rows: Vec<AnnotationRow>,
    pub images: usize,
    /// Entries whose path carries no recognition id
    pub unmatched_images: usize,
    /// Detections dropped for a malformed box
    pub malformed_boxes: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ImageEntry {
    #[serde(default)]
    dishes: DetectionGroup,
    #[serde(default)]
    plates: DetectionGroup,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionGroup {
    #[serde(default)]
    qwen_detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct Detection {
    #[serde(default)]
    bbox_2d: Vec<Value>,
    #[serde(default)]
    label: String,
}

pub fn parse_annotations(contents: &[u8]) -> IngestResult<AnnotationFeed> {
    let id_pattern = recognition_id_pattern()?;
    let document: Map<String, Value> = serde_json::from_slice(contents)?;
    let mut feed = AnnotationFeed {
        images: document.len(),
        ..AnnotationFeed::default()
    };

    for (image_path, entry) in document {
        let Some(recognition_id) = recognition_id_from_path(&id_pattern, &image_path) else {
            debug!(image_path = %image_path, "No recognition id in annotation path");
            feed.unmatched_images += 1;
            continue;
        };

        let entry: ImageEntry = match serde_json::from_value(entry) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(image_path = %image_path, error = %e, "Skipping malformed annotation entry");
                continue;
            },
        };

        let camera = camera_file(&image_path);
        let groups = [
            (ItemType::Food, entry.dishes.qwen_detections),
            (ItemType::Plate, entry.plates.qwen_detections),
        ];

        for (item_type, detections) in groups {
            for detection in detections {
                let Some(bbox) = bbox_json(&detection.bbox_2d) else {
                    feed.malformed_boxes += 1;
                    continue;
                };
                feed.rows.push(AnnotationRow {
                    recognition_id,
                    image_path: camera.to_string(),
                    bbox,
                    class_name: detection.label,
                    item_type,
                    external_id: None,
                });
            }
        }
    }

    Ok(feed)
}

pub fn recognition_id_pattern() -> IngestResult<Regex> {
    Regex::new(RECOGNITION_ID_PATTERN).map_err(|e| RrsError::parse(e.to_string()).into())
}

pub fn recognition_id_from_path(pattern: &Regex, path: &str) -> Option<i64> {
    pattern
        .captures(path)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

fn camera_file(image_path: &str) -> &'static str {
    if image_path.contains(PRIMARY_CAMERA_MARKER) {
        "camera1.jpg"
    } else {
        "camera2.jpg"
    }
}

/// `[x1, y1, x2, y2]` to `{x, y, w, h}`. Integer boxes stay integral.
fn bbox_json(corners: &[Value]) -> Option<Value> {
    let [x1, y1, x2, y2] = corners else {
        return None;
    };

    let ints = [x1, y1, x2, y2].map(Value::as_i64);
    if let [Some(x1), Some(y1), Some(x2), Some(y2)] = ints {
        if let (Some(w), Some(h)) = (x2.checked_sub(x1), y2.checked_sub(y1)) {
            return Some(json!({"x": x1, "y": y1, "w": w, "h": h}));
        }
    }

    let floats = [x1, y1, x2, y2].map(Value::as_f64);
    if let [Some(x1), Some(y1), Some(x2), Some(y2)] = floats {
        return Some(json!({"x": x1, "y": y1, "w": x2 - x1, "h": y2 - y1}));
    }
    None
}
