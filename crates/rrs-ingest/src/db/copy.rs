//! Values passed to and read back from the database, and their CSV encoding
//! for `COPY ... FROM STDIN`.

use super::{DbError, DbResult};

/// NULL marker used in COPY payloads.
pub const NULL_MARKER: &str = "\\N";

/// A single SQL value, independent of the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

pub type SqlRow = Vec<SqlValue>;

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    fn to_csv_field(&self) -> DbResult<String> {
        Ok(match self {
            SqlValue::Null => NULL_MARKER.to_string(),
            SqlValue::Bool(true) => "t".to_string(),
            SqlValue::Bool(false) => "f".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) if v.is_nan() => "NaN".to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Text(v) if v == NULL_MARKER => {
                return Err(DbError::Encode(format!(
                    "text value '{}' collides with the COPY NULL marker",
                    NULL_MARKER
                )))
            },
            SqlValue::Text(v) => v.clone(),
            SqlValue::Json(v) => serde_json::to_string(v)
                .map_err(|e| DbError::Encode(format!("JSON column: {}", e)))?,
        })
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Encode rows as headerless CSV for `COPY ... WITH (FORMAT csv, NULL '\N')`.
pub fn encode_csv(columns: &[&str], rows: &[SqlRow]) -> DbResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(DbError::Encode(format!(
                "row {} has {} values, expected {} ({})",
                index,
                row.len(),
                columns.len(),
                columns.join(", ")
            )));
        }

        let fields = row
            .iter()
            .map(SqlValue::to_csv_field)
            .collect::<DbResult<Vec<_>>>()?;
        writer
            .write_record(&fields)
            .map_err(|e| DbError::Encode(e.to_string()))?;
    }

    writer
        .into_inner()
        .map_err(|e| DbError::Encode(e.to_string()))
}

/// Build the COPY statement, rejecting identifiers that would need quoting.
pub fn copy_statement(table: &str, columns: &[&str]) -> DbResult<String> {
    validate_identifier(table)?;
    for column in columns {
        validate_identifier(column)?;
    }
    if columns.is_empty() {
        return Err(DbError::config("COPY needs at least one column"));
    }

    Ok(format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, NULL '{}')",
        table,
        columns.join(", "),
        NULL_MARKER
    ))
}

pub(crate) fn validate_identifier(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(DbError::config(format!("invalid SQL identifier '{}'", name)))
    }
}
