use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo};
use thiserror::Error;

use crate::DbPool;

/// One result row from a generated SELECT. Statements project arbitrary
/// column subsets, so rows stay dynamically shaped until the gate formats
/// them.
pub type RowMap = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Read-side access to the external `outlets` table. The gate owns no data,
/// only this handle.
#[async_trait]
pub trait OutletStore: Send + Sync {
    /// Executes an already-validated SELECT and returns its rows.
    async fn select(&self, sql: &str) -> Result<Vec<RowMap>, StoreError>;

    /// Total row count, for the stats endpoint.
    async fn count_all(&self) -> Result<i64, StoreError>;
}

pub struct SqlOutletStore {
    pool: DbPool,
}

impl SqlOutletStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutletStore for SqlOutletStore {
    async fn select(&self, sql: &str) -> Result<Vec<RowMap>, StoreError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_map).collect()
    }

    async fn count_all(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outlets")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn row_to_map(row: &SqliteRow) -> Result<RowMap, StoreError> {
    let mut map = RowMap::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INTEGER" => row
                .try_get::<Option<i64>, _>(index)
                .map(|maybe| maybe.map(Value::from).unwrap_or(Value::Null)),
            "REAL" => row
                .try_get::<Option<f64>, _>(index)
                .map(|maybe| maybe.map(Value::from).unwrap_or(Value::Null)),
            "NULL" => Ok(Value::Null),
            // TEXT, BLOB-as-text, DATETIME and expression columns all decode
            // through the string path.
            _ => row
                .try_get::<Option<String>, _>(index)
                .map(|maybe| maybe.map(Value::from).unwrap_or(Value::Null)),
        }
        .map_err(|error| StoreError::Decode(format!("column `{}`: {error}", column.name())))?;

        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}
