// neura-core/src/infrastructure/introspect.rs

// Schema introspection over the source sqlite file: the catalog allow-list
// (qualified table.column lines), foreign-key join candidates and per-table
// date columns. Results are cached per (connection, flags) with a TTL and a
// small LRU bound; a changed db mtime invalidates the entry.

use crate::error::NeuraError;
use crate::infrastructure::artifacts::sha256_hex;
use crate::infrastructure::error::InfrastructureError;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub notnull: bool,
    pub pk: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForeignKey {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DatabaseSchema {
    pub database: PathBuf,
    pub tables: Vec<TableInfo>,
    pub foreign_keys: Vec<ForeignKey>,
    /// table -> first date-looking column.
    pub date_columns: BTreeMap<String, String>,
}

impl DatabaseSchema {
    /// The catalog allow-list: sorted unique `table.column` lines.
    pub fn catalog(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .tables
            .iter()
            .flat_map(|table| {
                table
                    .columns
                    .iter()
                    .map(move |col| format!("{}.{}", table.name, col.name))
            })
            .collect();
        lines.sort();
        lines.dedup();
        lines
    }
}

const DATE_NAME_HINTS: [&str; 6] = ["date", "time", "month", "year", "period", "timestamp"];

fn looks_like_date_column(name: &str, declared: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    let declared_upper = declared.to_ascii_uppercase();
    declared_upper.contains("DATE")
        || declared_upper.contains("TIME")
        || DATE_NAME_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// Introspect a sqlite database file directly (no cache).
pub fn introspect_sqlite(db_path: &Path, include_row_counts: bool) -> Result<DatabaseSchema, NeuraError> {
    let conn = Connection::open(db_path).map_err(InfrastructureError::from)?;

    let mut table_names: Vec<String> = Vec::new();
    {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .map_err(InfrastructureError::from)?;
        let mut rows = stmt.query([]).map_err(InfrastructureError::from)?;
        while let Some(row) = rows.next().map_err(InfrastructureError::from)? {
            table_names.push(row.get::<_, String>(0).map_err(InfrastructureError::from)?);
        }
    }

    let mut tables = Vec::with_capacity(table_names.len());
    let mut foreign_keys = Vec::new();
    let mut date_columns = BTreeMap::new();

    for table in &table_names {
        let escaped = table.replace('\'', "''");
        let mut columns = Vec::new();
        {
            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info('{escaped}')"))
                .map_err(InfrastructureError::from)?;
            let mut rows = stmt.query([]).map_err(InfrastructureError::from)?;
            while let Some(row) = rows.next().map_err(InfrastructureError::from)? {
                let name: String = row.get(1).map_err(InfrastructureError::from)?;
                let declared: Option<String> = row.get(2).map_err(InfrastructureError::from)?;
                let notnull: i64 = row.get(3).map_err(InfrastructureError::from)?;
                let pk: i64 = row.get(5).map_err(InfrastructureError::from)?;
                let declared = declared.unwrap_or_default();
                let lowered_name = name.to_ascii_lowercase();
                let table_lower = table.to_ascii_lowercase();
                if looks_like_date_column(&lowered_name, &declared) {
                    date_columns.entry(table_lower).or_insert(lowered_name.clone());
                }
                columns.push(ColumnInfo {
                    name: lowered_name,
                    declared_type: declared,
                    notnull: notnull != 0,
                    pk: pk != 0,
                });
            }
        }

        {
            let mut stmt = conn
                .prepare(&format!("PRAGMA foreign_key_list('{escaped}')"))
                .map_err(InfrastructureError::from)?;
            let mut rows = stmt.query([]).map_err(InfrastructureError::from)?;
            while let Some(row) = rows.next().map_err(InfrastructureError::from)? {
                let to_table: String = row.get(2).map_err(InfrastructureError::from)?;
                let from_column: String = row.get(3).map_err(InfrastructureError::from)?;
                let to_column: Option<String> = row.get(4).map_err(InfrastructureError::from)?;
                foreign_keys.push(ForeignKey {
                    from_table: table.to_ascii_lowercase(),
                    from_column: from_column.to_ascii_lowercase(),
                    to_table: to_table.to_ascii_lowercase(),
                    to_column: to_column.unwrap_or_else(|| "id".to_string()).to_ascii_lowercase(),
                });
            }
        }

        let row_count = if include_row_counts {
            let quoted = table.replace('"', "\"\"");
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM \"{quoted}\""), [], |row| row.get(0))
                .map_err(InfrastructureError::from)?;
            Some(count as u64)
        } else {
            None
        };

        tables.push(TableInfo {
            name: table.to_ascii_lowercase(),
            columns,
            row_count,
        });
    }

    Ok(DatabaseSchema {
        database: db_path.to_path_buf(),
        tables,
        foreign_keys,
        date_columns,
    })
}

/// Deterministic signature of the database file identity, used in pipeline
/// cache keys: path + mtime + size hashed.
pub fn db_signature(db_path: &Path) -> String {
    let meta = std::fs::metadata(db_path).ok();
    let mtime = meta
        .as_ref()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let size = meta.map(|m| m.len()).unwrap_or(0);
    sha256_hex(format!("{}|{mtime}|{size}", db_path.display()).as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    connection_id: String,
    include_row_counts: bool,
}

struct CacheEntry {
    schema: DatabaseSchema,
    mtime: Option<std::time::SystemTime>,
    stored_at: Instant,
}

/// Process-wide cache of introspected schemas, TTL-bounded and LRU-capped.
pub struct SchemaCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<Vec<(CacheKey, CacheEntry)>>,
}

impl SchemaCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn get_or_introspect(
        &self,
        connection_id: &str,
        db_path: &Path,
        include_row_counts: bool,
    ) -> Result<DatabaseSchema, NeuraError> {
        let key = CacheKey {
            connection_id: connection_id.to_string(),
            include_row_counts,
        };
        let mtime = std::fs::metadata(db_path).and_then(|m| m.modified()).ok();

        if self.ttl > Duration::ZERO {
            #[allow(clippy::unwrap_used)]
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(pos) = entries.iter().position(|(k, _)| *k == key) {
                let fresh = {
                    let (_, entry) = &entries[pos];
                    entry.stored_at.elapsed() <= self.ttl && entry.mtime == mtime
                };
                if fresh {
                    // LRU touch: move to the back.
                    let hit = entries.remove(pos);
                    let schema = hit.1.schema.clone();
                    entries.push(hit);
                    debug!(connection_id, "schema cache hit");
                    return Ok(schema);
                }
                entries.remove(pos);
            }
        }

        let schema = introspect_sqlite(db_path, include_row_counts)?;

        if self.ttl > Duration::ZERO {
            #[allow(clippy::unwrap_used)]
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.push((
                key,
                CacheEntry { schema: schema.clone(), mtime, stored_at: Instant::now() },
            ));
            while entries.len() > self.max_entries {
                entries.remove(0);
            }
        }
        Ok(schema)
    }
}
