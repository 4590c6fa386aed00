// neura-core/src/domain/schedule.rs

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// Dedup while preserving the order of first appearance. Idempotent.
pub fn normalize_email_targets<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for raw in values {
        let text = raw.as_ref().trim().to_string();
        if text.is_empty() || !seen.insert(text.to_ascii_lowercase()) {
            continue;
        }
        out.push(text);
    }
    out
}

/// The serialized request to execute one report.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RunPayload {
    #[validate(length(min = 3))]
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_values: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub docx: bool,
    #[serde(default)]
    pub xlsx: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_recipients: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleRunStatus {
    #[default]
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScheduleRecord {
    pub id: String,
    pub name: String,
    pub template_id: String,
    pub template_name: String,
    #[serde(default)]
    pub template_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    /// UTC dispatch window. No run is dispatched outside [start_date, end_date].
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub key_values: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub batch_ids: Vec<String>,
    #[serde(default)]
    pub docx: bool,
    #[serde(default)]
    pub xlsx: bool,
    #[serde(default)]
    pub email_recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_message: Option<String>,
    pub frequency: String,
    #[validate(range(min = 1))]
    pub interval_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<ScheduleRunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_error: Option<String>,
    #[serde(default)]
    pub last_run_artifacts: BTreeMap<String, String>,
    #[serde(default = "default_active")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl ScheduleRecord {
    /// Date-window + activity + next_run gating, evaluated at dispatch time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        if now < self.start_date || now > self.end_date {
            return false;
        }
        match self.next_run_at {
            Some(next) => next <= now,
            None => true,
        }
    }

    /// `next = max(now, finish) + interval`, recorded after every dispatch.
    pub fn next_run_after(&self, now: DateTime<Utc>, finished: DateTime<Utc>) -> DateTime<Utc> {
        let baseline = if finished > now { finished } else { now };
        baseline + Duration::minutes(self.interval_minutes.max(1))
    }

    /// Fully populated run payload snapshot for a scheduled dispatch.
    pub fn run_payload(&self) -> RunPayload {
        RunPayload {
            template_id: self.template_id.clone(),
            connection_id: self.connection_id.clone(),
            start_date: self.start_date.to_rfc3339(),
            end_date: self.end_date.to_rfc3339(),
            batch_ids: if self.batch_ids.is_empty() { None } else { Some(self.batch_ids.clone()) },
            key_values: if self.key_values.is_empty() { None } else { Some(self.key_values.clone()) },
            docx: self.docx,
            xlsx: self.xlsx,
            email_recipients: if self.email_recipients.is_empty() {
                None
            } else {
                Some(self.email_recipients.clone())
            },
            email_subject: self.email_subject.clone().or_else(|| {
                Some(format!("[Scheduled] {}", self.template_name))
            }),
            email_message: self.email_message.clone().or_else(|| {
                Some(format!(
                    "Scheduled run '{}' completed.\nWindow: {} - {}.",
                    self.name, self.start_date, self.end_date
                ))
            }),
            schedule_id: Some(self.id.clone()),
            schedule_name: Some(self.name.clone()),
        }
    }
}
