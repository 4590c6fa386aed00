// neura-core/src/domain/report_run.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Historical record of a completed report run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRunRecord {
    pub id: String,
    pub template_id: String,
    pub template_name: String,
    #[serde(default)]
    pub template_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub batch_ids: Vec<String>,
    #[serde(default)]
    pub key_values: BTreeMap<String, serde_json::Value>,
    pub status: String,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    pub created_at: DateTime<Utc>,
}
