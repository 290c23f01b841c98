//! PostgreSQL implementation of [`Database`] / [`UnitOfWork`] on a sqlx pool.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::BigDecimal;
use sqlx::{Column, Executor, PgPool, Postgres, Row, Transaction, TypeInfo};
use tracing::{debug, instrument, warn};

use super::copy::{self, SqlRow, SqlValue};
use super::{create_pool, Database, DbConfig, DbError, DbResult, UnitOfWork};

#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DbConfig) -> DbResult<Self> {
        Ok(Self::new(create_pool(config).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> DbResult<()> {
        super::health_check(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Unit = PgUnitOfWork;

    async fn begin(&self) -> DbResult<PgUnitOfWork> {
        let tx = self.pool.begin().await?;
        Ok(PgUnitOfWork {
            pool: self.pool.clone(),
            tx: Some(tx),
        })
    }

    fn checked_out(&self) -> usize {
        (self.pool.size() as usize).saturating_sub(self.pool.num_idle())
    }
}

/// Unit of work over a pooled transaction.
///
/// Committing or rolling back hands the connection back to the pool; the
/// next statement begins a fresh transaction.
pub struct PgUnitOfWork {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUnitOfWork {
    async fn transaction(&mut self) -> DbResult<&mut Transaction<'static, Postgres>> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(self.tx.insert(tx))
    }
}

impl Drop for PgUnitOfWork {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("Unit of work dropped inside an open transaction, rolling back");
        }
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    #[instrument(skip(self, columns, rows), fields(rows = rows.len()))]
    async fn bulk_load(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &[SqlRow],
    ) -> DbResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let statement = copy::copy_statement(table, columns)?;
        let payload = copy::encode_csv(columns, rows)?;
        let tx = self.transaction().await?;

        let mut copy_in = tx.copy_in_raw(&statement).await?;
        let sent = copy_in.send(payload).await.map(|_| ());
        if let Err(e) = sent {
            if let Err(abort_err) = copy_in.abort(e.to_string()).await {
                debug!(error = %abort_err, "COPY abort reported an error");
            }
            return Err(e.into());
        }
        let loaded = copy_in.finish().await?;

        debug!(table, loaded, "COPY finished");
        Ok(loaded)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Vec<SqlRow>>> {
        let tx = self.transaction().await?;

        let described = (&mut **tx).describe(sql).await?;
        let query = params.iter().fold(sqlx::query(sql), bind_value);

        if described.columns().is_empty() {
            query.execute(&mut **tx).await?;
            return Ok(None);
        }

        let rows = query.fetch_all(&mut **tx).await?;
        rows.iter()
            .map(decode_row)
            .collect::<DbResult<Vec<_>>>()
            .map(Some)
    }

    async fn commit(&mut self) -> DbResult<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> DbResult<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Json(v) => query.bind(sqlx::types::Json(v)),
    }
}

fn decode_row(row: &PgRow) -> DbResult<SqlRow> {
    row.columns()
        .iter()
        .map(|column| {
            let index = column.ordinal();
            let type_name = column.type_info().name();
            decode_column(row, index, type_name).map_err(|e| {
                DbError::Decode(format!("column '{}' ({}): {}", column.name(), type_name, e))
            })
        })
        .collect()
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Result<SqlValue, sqlx::Error> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(i64::from).into(),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.into(),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.into(),
        "NUMERIC" => row
            .try_get::<Option<BigDecimal>, _>(index)?
            .map(numeric_value)
            .unwrap_or(SqlValue::Null),
        "JSON" | "JSONB" => row.try_get::<Option<serde_json::Value>, _>(index)?.into(),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)?
            .map(|ts| ts.to_rfc3339())
            .into(),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)?
            .map(|ts| ts.to_string())
            .into(),
        _ => row.try_get::<Option<String>, _>(index)?.into(),
    };
    Ok(value)
}

fn numeric_value(value: BigDecimal) -> SqlValue {
    let rendered = value.to_string();
    rendered
        .parse::<i64>()
        .map(SqlValue::Int)
        .or_else(|_| rendered.parse::<f64>().map(SqlValue::Float))
        .unwrap_or(SqlValue::Text(rendered))
}
