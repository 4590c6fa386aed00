// neura-core/src/domain/connection.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub name: String,
    pub db_type: String,
    /// Resolved filesystem path of the database file.
    #[serde(default)]
    pub database_path: String,
    /// AEAD-sealed blob holding the original URL / credentials.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_detail: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> String {
    "unknown".to_string()
}

/// Connection view with the secret stripped, safe for any caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionView {
    pub id: String,
    pub name: String,
    pub db_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<f64>,
    pub has_credentials: bool,
    /// File name of the database, never the full path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&ConnectionRecord> for ConnectionView {
    fn from(rec: &ConnectionRecord) -> Self {
        let summary = std::path::Path::new(&rec.database_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .or_else(|| {
                if rec.database_path.is_empty() {
                    None
                } else {
                    Some(rec.database_path.clone())
                }
            });
        ConnectionView {
            id: rec.id.clone(),
            name: rec.name.clone(),
            db_type: rec.db_type.clone(),
            status: rec.status.clone(),
            last_connected_at: rec.last_connected_at,
            last_latency_ms: rec.last_latency_ms,
            has_credentials: !rec.secret.is_empty(),
            summary,
            tags: rec.tags.clone(),
            created_at: rec.created_at,
            updated_at: rec.updated_at,
            details: rec.last_detail.clone(),
        }
    }
}
