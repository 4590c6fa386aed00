// neura-core/src/ports/connector.rs

// What the executor needs from an analytical SQL engine, without knowing
// which one. Column order is part of the result because scalar tokens are
// mapped position-then-name against the generator's output schemas.

use crate::error::NeuraError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
}

/// Ordered projection of a SELECT: column names once, then one value vector
/// per row, positionally aligned with `columns`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Value at (row, column-name), when present.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

#[async_trait]
pub trait AnalyticConnector: Send + Sync {
    /// Execute a statement for its side effects.
    async fn execute(&self, query: &str) -> Result<(), NeuraError>;

    /// Execute a SELECT and collect every row in order.
    async fn query(&self, query: &str) -> Result<QueryResult, NeuraError>;

    async fn fetch_columns(&self, table_name: &str) -> Result<Vec<ColumnSchema>, NeuraError>;

    /// Materialize a sqlite database as in-memory tables, one per source
    /// table. Returns the registered table names.
    async fn register_sqlite(&self, db_path: &Path) -> Result<Vec<String>, NeuraError>;

    fn engine_name(&self) -> &str;
}
