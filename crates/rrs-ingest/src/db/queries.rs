//! Table layout of the raw layer and typed wrappers around the server-side
//! transform functions.

use std::collections::HashSet;

use super::copy::{SqlRow, SqlValue};
use super::{DbResult, UnitOfWork};

pub const RECOGNITION_FILES_TABLE: &str = "raw.recognition_files";
pub const RECOGNITION_FILES_COLUMNS: &[&str] = &[
    "recognition_id",
    "batch_id",
    "active_menu",
    "image1_path",
    "image2_path",
    "image1_width",
    "image1_height",
    "image2_width",
    "image2_height",
];

pub const RECIPES_TABLE: &str = "raw.recipes";
pub const RECIPES_COLUMNS: &[&str] = &["recognition_id", "payload"];

pub const ANNOTATIONS_TABLE: &str = "raw.qwen_annotations";
pub const ANNOTATIONS_COLUMNS: &[&str] = &[
    "recognition_id",
    "image_path",
    "bbox",
    "class_name",
    "item_type",
    "external_id",
];

pub const TRANSFORM_RECOGNITIONS: &str = "transform_recognitions_and_images";
pub const TRANSFORM_RECIPES: &str = "transform_recipes";
pub const TRANSFORM_ANNOTATIONS: &str = "transform_initial_items_and_annotations";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecognitionTransformCounts {
    pub recognitions: i64,
    pub images: i64,
    pub menu_items: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecipeTransformCounts {
    pub recipes: i64,
    pub lines: i64,
    pub options: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationTransformCounts {
    pub items: i64,
    pub annotations: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchDeleteCounts {
    pub recipes: usize,
    pub annotations: usize,
    pub recognition_files: usize,
}

fn count_at(row: Option<&SqlRow>, index: usize) -> i64 {
    row.and_then(|r| r.get(index))
        .and_then(SqlValue::as_i64)
        .unwrap_or(0)
}

pub async fn table_exists<U: UnitOfWork + ?Sized>(unit: &mut U, table: &str) -> DbResult<bool> {
    let (schema, name) = table.split_once('.').unwrap_or(("public", table));
    let rows = unit
        .query(
            "SELECT EXISTS (SELECT FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
            &[schema.into(), name.into()],
        )
        .await?
        .unwrap_or_default();

    Ok(rows
        .first()
        .and_then(|row| row.first())
        .and_then(SqlValue::as_bool)
        .unwrap_or(false))
}

pub async fn existing_recognition_ids<U: UnitOfWork + ?Sized>(
    unit: &mut U,
) -> DbResult<HashSet<i64>> {
    if !table_exists(unit, "public.recognitions").await? {
        return Ok(HashSet::new());
    }

    let rows = unit
        .query("SELECT id FROM recognitions", &[])
        .await?
        .unwrap_or_default();

    Ok(rows
        .iter()
        .filter_map(|row| row.first().and_then(SqlValue::as_i64))
        .collect())
}

pub async fn transform_recognitions_and_images<U: UnitOfWork + ?Sized>(
    unit: &mut U,
) -> DbResult<RecognitionTransformCounts> {
    let row = unit.call_procedure(TRANSFORM_RECOGNITIONS, &[]).await?;
    Ok(RecognitionTransformCounts {
        recognitions: count_at(row.as_ref(), 0),
        images: count_at(row.as_ref(), 1),
        menu_items: count_at(row.as_ref(), 2),
    })
}

pub async fn transform_recipes<U: UnitOfWork + ?Sized>(
    unit: &mut U,
) -> DbResult<RecipeTransformCounts> {
    let row = unit.call_procedure(TRANSFORM_RECIPES, &[]).await?;
    Ok(RecipeTransformCounts {
        recipes: count_at(row.as_ref(), 0),
        lines: count_at(row.as_ref(), 1),
        options: count_at(row.as_ref(), 2),
    })
}

pub async fn transform_initial_items_and_annotations<U: UnitOfWork + ?Sized>(
    unit: &mut U,
) -> DbResult<AnnotationTransformCounts> {
    let row = unit.call_procedure(TRANSFORM_ANNOTATIONS, &[]).await?;
    Ok(AnnotationTransformCounts {
        items: count_at(row.as_ref(), 0),
        annotations: count_at(row.as_ref(), 1),
    })
}

pub async fn recognition_ids_for_batch<U: UnitOfWork + ?Sized>(
    unit: &mut U,
    batch_id: &str,
) -> DbResult<Vec<i64>> {
    let rows = unit
        .query(
            "SELECT recognition_id FROM raw.recognition_files WHERE batch_id = $1 \
             ORDER BY recognition_id",
            &[batch_id.into()],
        )
        .await?
        .unwrap_or_default();

    Ok(rows
        .iter()
        .filter_map(|row| row.first().and_then(SqlValue::as_i64))
        .collect())
}

/// Remove the raw-layer rows written by one load run.
pub async fn delete_batch_rows<U: UnitOfWork + ?Sized>(
    unit: &mut U,
    batch_id: &str,
) -> DbResult<BatchDeleteCounts> {
    let in_batch = "recognition_id IN \
                    (SELECT recognition_id FROM raw.recognition_files WHERE batch_id = $1)";

    let recipes = unit
        .query(
            &format!("DELETE FROM {} WHERE {} RETURNING recognition_id", RECIPES_TABLE, in_batch),
            &[batch_id.into()],
        )
        .await?
        .map_or(0, |rows| rows.len());

    let annotations = unit
        .query(
            &format!(
                "DELETE FROM {} WHERE {} RETURNING recognition_id",
                ANNOTATIONS_TABLE, in_batch
            ),
            &[batch_id.into()],
        )
        .await?
        .map_or(0, |rows| rows.len());

    let recognition_files = unit
        .query(
            &format!(
                "DELETE FROM {} WHERE batch_id = $1 RETURNING recognition_id",
                RECOGNITION_FILES_TABLE
            ),
            &[batch_id.into()],
        )
        .await?
        .map_or(0, |rows| rows.len());

    Ok(BatchDeleteCounts {
        recipes,
        annotations,
        recognition_files,
    })
}

/// Row count of `table`, or `None` when the table does not exist.
pub async fn row_count<U: UnitOfWork + ?Sized>(unit: &mut U, table: &str) -> DbResult<Option<i64>> {
    super::copy::validate_identifier(table)?;
    if !table_exists(unit, table).await? {
        return Ok(None);
    }

    let rows = unit
        .query(&format!("SELECT COUNT(*) FROM {}", table), &[])
        .await?
        .unwrap_or_default();
    Ok(Some(count_at(rows.first(), 0)))
}
