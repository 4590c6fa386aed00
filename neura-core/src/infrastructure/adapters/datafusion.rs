// neura-core/src/infrastructure/adapters/datafusion.rs

use async_trait::async_trait;
use datafusion::prelude::*;
use std::path::Path;
use std::sync::Arc;

// Hexagonal Imports
use crate::error::NeuraError;
use crate::infrastructure::error::{DatabaseError, InfrastructureError};
use crate::ports::connector::{AnalyticConnector, ColumnSchema, QueryResult};

use datafusion::arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::array_value_to_string;
use datafusion::datasource::MemTable;

/// In-memory analytical engine. The source sqlite database is materialized
/// into arrow tables so the generated SQL gets window functions, NULLIF and
/// CTEs regardless of the source driver.
pub struct DataFusionConnector {
    ctx: Arc<SessionContext>,
}

impl DataFusionConnector {
    pub fn new() -> Self {
        Self { ctx: Arc::new(SessionContext::new()) }
    }

    fn wrap(e: datafusion::error::DataFusionError) -> NeuraError {
        NeuraError::Infrastructure(InfrastructureError::Database(DatabaseError::DataFusion(e)))
    }

    fn batch_to_rows(batch: &RecordBatch, out: &mut Vec<Vec<serde_json::Value>>) {
        for row_idx in 0..batch.num_rows() {
            let mut row = Vec::with_capacity(batch.num_columns());
            for col in batch.columns() {
                row.push(Self::cell_to_json(col, row_idx));
            }
            out.push(row);
        }
    }

    fn cell_to_json(col: &ArrayRef, row: usize) -> serde_json::Value {
        if col.is_null(row) {
            return serde_json::Value::Null;
        }
        if let Some(arr) = col.as_any().downcast_ref::<Int64Array>() {
            return serde_json::Value::from(arr.value(row));
        }
        if let Some(arr) = col.as_any().downcast_ref::<Float64Array>() {
            return serde_json::Number::from_f64(arr.value(row))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null);
        }
        if let Some(arr) = col.as_any().downcast_ref::<BooleanArray>() {
            return serde_json::Value::from(arr.value(row));
        }
        if let Some(arr) = col.as_any().downcast_ref::<StringArray>() {
            return serde_json::Value::from(arr.value(row));
        }
        // Int32, decimals, dates, timestamps: the display form is stable
        // enough for token substitution.
        array_value_to_string(col, row)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl Default for DataFusionConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyticConnector for DataFusionConnector {
    async fn execute(&self, query: &str) -> Result<(), NeuraError> {
        let df = self.ctx.sql(query).await.map_err(Self::wrap)?;
        // Collect to trigger execution
        df.collect().await.map_err(Self::wrap)?;
        Ok(())
    }

    async fn query(&self, query: &str) -> Result<QueryResult, NeuraError> {
        let df = self.ctx.sql(query).await.map_err(Self::wrap)?;
        let columns: Vec<String> = df
            .schema()
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect();
        let batches = df.collect().await.map_err(Self::wrap)?;

        let mut rows = Vec::new();
        for batch in &batches {
            Self::batch_to_rows(batch, &mut rows);
        }
        Ok(QueryResult { columns, rows })
    }

    async fn fetch_columns(&self, table_name: &str) -> Result<Vec<ColumnSchema>, NeuraError> {
        let df = self.ctx.table(table_name).await.map_err(Self::wrap)?;
        let schema = df.schema();
        let columns = schema
            .fields()
            .iter()
            .map(|field| ColumnSchema {
                name: field.name().clone(),
                data_type: format!("{:?}", field.data_type()),
                is_nullable: field.is_nullable(),
            })
            .collect();
        Ok(columns)
    }

    async fn register_sqlite(&self, db_path: &Path) -> Result<Vec<String>, NeuraError> {
        let tables = read_sqlite_tables(db_path)?;
        let mut registered = Vec::with_capacity(tables.len());
        for (name, batch) in tables {
            let mem = MemTable::try_new(batch.schema(), vec![vec![batch]]).map_err(Self::wrap)?;
            // Re-registration replaces the previous snapshot of the table.
            let _ = self.ctx.deregister_table(name.as_str());
            self.ctx
                .register_table(name.as_str(), Arc::new(mem))
                .map_err(Self::wrap)?;
            registered.push(name);
        }
        Ok(registered)
    }

    fn engine_name(&self) -> &str {
        "datafusion"
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SqliteColumnKind {
    Integer,
    Real,
    Text,
}

fn column_kind(declared: &str) -> SqliteColumnKind {
    let upper = declared.to_ascii_uppercase();
    if upper.contains("INT") {
        SqliteColumnKind::Integer
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB")
        || upper.contains("NUM") || upper.contains("DEC")
    {
        SqliteColumnKind::Real
    } else {
        SqliteColumnKind::Text
    }
}

/// Read every user table of a sqlite file into one arrow batch per table.
/// Declared column affinities pick the arrow type; values are coerced.
fn read_sqlite_tables(db_path: &Path) -> Result<Vec<(String, RecordBatch)>, NeuraError> {
    use rusqlite::Connection;
    use rusqlite::types::ValueRef;

    let conn = Connection::open(db_path)
        .map_err(|e| NeuraError::Infrastructure(InfrastructureError::from(e)))?;

    let mut table_names: Vec<String> = Vec::new();
    {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .map_err(InfrastructureError::from)?;
        let mut rows = stmt.query([]).map_err(InfrastructureError::from)?;
        while let Some(row) = rows.next().map_err(InfrastructureError::from)? {
            let name: String = row.get(0).map_err(InfrastructureError::from)?;
            table_names.push(name);
        }
    }

    let mut tables = Vec::with_capacity(table_names.len());
    for table in table_names {
        let mut columns: Vec<(String, SqliteColumnKind)> = Vec::new();
        {
            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info('{}')", table.replace('\'', "''")))
                .map_err(InfrastructureError::from)?;
            let mut rows = stmt.query([]).map_err(InfrastructureError::from)?;
            while let Some(row) = rows.next().map_err(InfrastructureError::from)? {
                let name: String = row.get(1).map_err(InfrastructureError::from)?;
                let declared: String = row.get::<_, Option<String>>(2)
                    .map_err(InfrastructureError::from)?
                    .unwrap_or_default();
                columns.push((name.to_ascii_lowercase(), column_kind(&declared)));
            }
        }
        if columns.is_empty() {
            continue;
        }

        let mut ints: Vec<Vec<Option<i64>>> = vec![Vec::new(); columns.len()];
        let mut reals: Vec<Vec<Option<f64>>> = vec![Vec::new(); columns.len()];
        let mut texts: Vec<Vec<Option<String>>> = vec![Vec::new(); columns.len()];

        let mut stmt = conn
            .prepare(&format!("SELECT * FROM \"{}\"", table.replace('"', "\"\"")))
            .map_err(InfrastructureError::from)?;
        let mut rows = stmt.query([]).map_err(InfrastructureError::from)?;
        while let Some(row) = rows.next().map_err(InfrastructureError::from)? {
            for (idx, (_, kind)) in columns.iter().enumerate() {
                let value = row.get_ref(idx).map_err(InfrastructureError::from)?;
                match kind {
                    SqliteColumnKind::Integer => ints[idx].push(match value {
                        ValueRef::Integer(v) => Some(v),
                        ValueRef::Real(v) => Some(v as i64),
                        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).trim().parse().ok(),
                        _ => None,
                    }),
                    SqliteColumnKind::Real => reals[idx].push(match value {
                        ValueRef::Integer(v) => Some(v as f64),
                        ValueRef::Real(v) => Some(v),
                        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).trim().parse().ok(),
                        _ => None,
                    }),
                    SqliteColumnKind::Text => texts[idx].push(match value {
                        ValueRef::Null => None,
                        ValueRef::Integer(v) => Some(v.to_string()),
                        ValueRef::Real(v) => Some(v.to_string()),
                        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                        ValueRef::Blob(bytes) => {
                            Some(bytes.iter().map(|b| format!("{b:02x}")).collect())
                        }
                    }),
                }
            }
        }

        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, kind)| {
                let data_type = match kind {
                    SqliteColumnKind::Integer => DataType::Int64,
                    SqliteColumnKind::Real => DataType::Float64,
                    SqliteColumnKind::Text => DataType::Utf8,
                };
                Field::new(name, data_type, true)
            })
            .collect();
        let arrays: Vec<ArrayRef> = columns
            .iter()
            .enumerate()
            .map(|(idx, (_, kind))| -> ArrayRef {
                match kind {
                    SqliteColumnKind::Integer => {
                        Arc::new(Int64Array::from(std::mem::take(&mut ints[idx])))
                    }
                    SqliteColumnKind::Real => {
                        Arc::new(Float64Array::from(std::mem::take(&mut reals[idx])))
                    }
                    SqliteColumnKind::Text => {
                        Arc::new(StringArray::from(std::mem::take(&mut texts[idx])))
                    }
                }
            })
            .collect();

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema, arrays)
            .map_err(|e| NeuraError::InternalError(format!("arrow batch for '{table}': {e}")))?;
        tables.push((table.to_ascii_lowercase(), batch));
    }

    Ok(tables)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn seed_sqlite(path: &Path) -> Result<()> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, balance REAL);
             INSERT INTO customers (id, name, balance) VALUES (1, 'Alice', 120.5), (2, 'Bob', NULL);
             CREATE TABLE readings (id INTEGER, customer_id INTEGER, amount REAL, reading_date TEXT);
             INSERT INTO readings VALUES (1, 1, 10.0, '2024-01-05'), (2, 1, 20.0, '2024-01-09'), (3, 2, 5.5, '2024-02-01');",
        )?;
        Ok(())
    }

    #[tokio::test]
    async fn test_register_sqlite_and_query() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = tmp.path().join("source.sqlite3");
        seed_sqlite(&db)?;

        let connector = DataFusionConnector::new();
        let tables = connector.register_sqlite(&db).await?;
        assert_eq!(tables, vec!["customers", "readings"]);

        let result = connector
            .query("SELECT name, balance FROM customers ORDER BY id")
            .await?;
        assert_eq!(result.columns, vec!["name", "balance"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0][0], serde_json::json!("Alice"));
        assert_eq!(result.rows[1][1], serde_json::Value::Null);
        Ok(())
    }

    #[tokio::test]
    async fn test_rich_sql_over_materialized_tables() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = tmp.path().join("source.sqlite3");
        seed_sqlite(&db)?;

        let connector = DataFusionConnector::new();
        connector.register_sqlite(&db).await?;

        // Window functions and NULLIF both work against the in-memory engine.
        let result = connector
            .query(
                "WITH ranked AS (
                     SELECT customer_id, amount,
                            ROW_NUMBER() OVER (PARTITION BY customer_id ORDER BY amount DESC) AS rn
                     FROM readings
                 )
                 SELECT customer_id, NULLIF(amount, 0) AS amount FROM ranked WHERE rn = 1 ORDER BY customer_id",
            )
            .await?;
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0][1], serde_json::json!(20.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_columns() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = tmp.path().join("source.sqlite3");
        seed_sqlite(&db)?;

        let connector = DataFusionConnector::new();
        connector.register_sqlite(&db).await?;
        let columns = connector.fetch_columns("customers").await?;
        assert_eq!(columns.len(), 3);
        let balance = columns.iter().find(|c| c.name == "balance").expect("balance column");
        assert_eq!(balance.data_type, "Float64");
        Ok(())
    }

    #[tokio::test]
    async fn test_query_error_surfaces() -> Result<()> {
        let connector = DataFusionConnector::new();
        let result = connector.query("SELECT * FROM missing_table").await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_engine_name() {
        assert_eq!(DataFusionConnector::new().engine_name(), "datafusion");
    }
}
