// neura-core/src/infrastructure/state/store.rs

// File-backed store that keeps connection credentials (encrypted), template
// metadata, jobs, schedules, run history and the last-used selection.
// Every mutator re-reads the document under the lock, applies the change and
// writes atomically. No long-lived read handles.

use crate::domain::connection::{ConnectionRecord, ConnectionView};
use crate::domain::job::{JobRecord, JobStatus, JobStep, StepStatus, clamp_progress};
use crate::domain::report_run::ReportRunRecord;
use crate::domain::schedule::{ScheduleRecord, ScheduleRunStatus, normalize_email_targets};
use crate::domain::template::{
    GeneratorMeta, TemplateKind, TemplateRecord, TemplateStatus, normalize_string_list,
};
use crate::error::NeuraError;
use crate::infrastructure::fs::write_json_atomic;
use crate::infrastructure::state::secrets::SecretBox;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const STATE_FILENAME: &str = "state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDocument {
    pub connections: BTreeMap<String, ConnectionRecord>,
    pub templates: BTreeMap<String, TemplateRecord>,
    pub jobs: BTreeMap<String, JobRecord>,
    pub schedules: BTreeMap<String, ScheduleRecord>,
    pub report_runs: BTreeMap<String, ReportRunRecord>,
    pub last_used: LastUsed,
    pub saved_charts: BTreeMap<String, SavedChart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LastUsed {
    pub connection_id: Option<String>,
    pub template_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedChart {
    pub id: String,
    pub template_id: String,
    pub name: String,
    pub spec: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionUpsert {
    pub conn_id: Option<String>,
    pub name: String,
    pub db_type: String,
    pub database_path: String,
    /// When present, replaces the stored secret; otherwise the previous
    /// sealed blob is kept.
    pub secret_payload: Option<serde_json::Value>,
    pub status: Option<String>,
    pub latency_ms: Option<f64>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateUpsert {
    pub name: String,
    pub status: TemplateStatus,
    pub artifacts: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub connection_id: Option<String>,
    pub mapping_keys: Option<Vec<String>>,
    pub kind: Option<TemplateKind>,
}

#[derive(Debug, Clone)]
pub struct StepSeed {
    pub name: String,
    pub label: String,
}

impl StepSeed {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self { name: name.into(), label: label.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobCreate {
    pub job_type: String,
    pub template_id: Option<String>,
    pub template_name: Option<String>,
    pub template_kind: Option<String>,
    pub connection_id: Option<String>,
    pub schedule_id: Option<String>,
    pub correlation_id: Option<String>,
    pub steps: Vec<StepSeed>,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub types: Vec<String>,
    pub limit: usize,
    pub active_only: bool,
}

#[derive(Debug, Clone)]
pub struct ScheduleCreate {
    pub name: Option<String>,
    pub template_id: String,
    pub template_name: String,
    pub template_kind: String,
    pub connection_id: Option<String>,
    pub connection_name: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub key_values: BTreeMap<String, serde_json::Value>,
    pub batch_ids: Vec<String>,
    pub docx: bool,
    pub xlsx: bool,
    pub email_recipients: Vec<String>,
    pub email_subject: Option<String>,
    pub email_message: Option<String>,
    pub frequency: String,
    pub interval_minutes: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub first_run_at: Option<DateTime<Utc>>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct ScheduleRunOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ScheduleRunStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub artifacts: BTreeMap<String, String>,
    pub error: Option<String>,
}

pub struct StateStore {
    state_path: PathBuf,
    secrets: SecretBox,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn open(state_dir: &Path) -> Result<Self, NeuraError> {
        std::fs::create_dir_all(state_dir)?;
        let secrets = SecretBox::open(state_dir).map_err(NeuraError::Infrastructure)?;
        Ok(Self {
            state_path: state_dir.join(STATE_FILENAME),
            secrets,
            lock: Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------
    // state IO helpers
    // ------------------------------------------------------------------
    fn read_state(&self) -> StateDocument {
        if !self.state_path.exists() {
            return StateDocument::default();
        }
        match std::fs::read_to_string(&self.state_path)
            .map_err(NeuraError::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(NeuraError::from))
        {
            Ok(doc) => doc,
            Err(err) => {
                warn!(path = %self.state_path.display(), error = %err, "state document unreadable, starting empty");
                StateDocument::default()
            }
        }
    }

    fn write_state(&self, doc: &StateDocument) -> Result<(), NeuraError> {
        write_json_atomic(&self.state_path, doc).map_err(NeuraError::Infrastructure)
    }

    fn with_state_mut<T>(
        &self,
        mutate: impl FnOnce(&mut StateDocument) -> Result<T, NeuraError>,
    ) -> Result<T, NeuraError> {
        #[allow(clippy::unwrap_used)]
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut doc = self.read_state();
        let out = mutate(&mut doc)?;
        self.write_state(&doc)?;
        Ok(out)
    }

    fn with_state<T>(&self, read: impl FnOnce(&StateDocument) -> T) -> T {
        #[allow(clippy::unwrap_used)]
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        read(&self.read_state())
    }

    // ------------------------------------------------------------------
    // connection helpers
    // ------------------------------------------------------------------
    pub fn list_connections(&self) -> Vec<ConnectionView> {
        self.with_state(|doc| doc.connections.values().map(ConnectionView::from).collect())
    }

    pub fn get_connection_record(&self, conn_id: &str) -> Option<ConnectionRecord> {
        self.with_state(|doc| doc.connections.get(conn_id).cloned())
    }

    /// Newest connection by `updated_at`, used as the last-resort database
    /// path fallback.
    pub fn get_latest_connection(&self) -> Option<ConnectionRecord> {
        self.with_state(|doc| {
            doc.connections
                .values()
                .max_by_key(|rec| rec.updated_at)
                .cloned()
        })
    }

    pub fn get_connection_secrets(&self, conn_id: &str) -> Option<serde_json::Value> {
        let record = self.get_connection_record(conn_id)?;
        let mut secrets = self.secrets.unseal(&record.secret)?;
        if let Some(map) = secrets.as_object_mut() {
            map.insert("database_path".into(), record.database_path.clone().into());
            map.insert("db_type".into(), record.db_type.clone().into());
            map.insert("name".into(), record.name.clone().into());
        }
        Some(secrets)
    }

    pub fn upsert_connection(&self, upsert: ConnectionUpsert) -> Result<ConnectionView, NeuraError> {
        let conn_id = upsert.conn_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let sealed = match &upsert.secret_payload {
            Some(payload) => Some(self.secrets.seal(payload).map_err(NeuraError::Infrastructure)?),
            None => None,
        };
        self.with_state_mut(move |doc| {
            let now = Utc::now();
            let existing = doc.connections.get(&conn_id);
            let created_at = existing.map(|r| r.created_at).unwrap_or(now);
            let secret = sealed
                .or_else(|| existing.map(|r| r.secret.clone()))
                .unwrap_or_default();
            let database_path = if upsert.database_path.is_empty() {
                existing.map(|r| r.database_path.clone()).unwrap_or_default()
            } else {
                upsert.database_path.clone()
            };
            let mut tags = normalize_string_list(&upsert.tags);
            if tags.is_empty() {
                tags = existing.map(|r| r.tags.clone()).unwrap_or_default();
            }
            tags.sort();
            let record = ConnectionRecord {
                id: conn_id.clone(),
                name: upsert.name.clone(),
                db_type: upsert.db_type.clone(),
                database_path,
                secret,
                status: upsert
                    .status
                    .clone()
                    .or_else(|| existing.map(|r| r.status.clone()))
                    .unwrap_or_else(|| "unknown".to_string()),
                last_connected_at: existing.and_then(|r| r.last_connected_at),
                last_latency_ms: upsert.latency_ms.or_else(|| existing.and_then(|r| r.last_latency_ms)),
                last_detail: existing.and_then(|r| r.last_detail.clone()),
                tags,
                created_at,
                updated_at: now,
            };
            let view = ConnectionView::from(&record);
            doc.connections.insert(conn_id.clone(), record);
            Ok(view)
        })
    }

    pub fn record_connection_ping(
        &self,
        conn_id: &str,
        status: &str,
        detail: Option<&str>,
        latency_ms: Option<f64>,
    ) -> Result<(), NeuraError> {
        self.with_state_mut(|doc| {
            if let Some(record) = doc.connections.get_mut(conn_id) {
                let now = Utc::now();
                record.status = status.to_string();
                record.last_connected_at = Some(now);
                record.last_latency_ms = latency_ms;
                record.last_detail = detail.map(String::from);
                record.updated_at = now;
            }
            Ok(())
        })
    }

    pub fn delete_connection(&self, conn_id: &str) -> Result<bool, NeuraError> {
        self.with_state_mut(|doc| {
            let removed = doc.connections.remove(conn_id).is_some();
            if removed && doc.last_used.connection_id.as_deref() == Some(conn_id) {
                doc.last_used.connection_id = None;
                doc.last_used.updated_at = Some(Utc::now());
            }
            Ok(removed)
        })
    }

    // ------------------------------------------------------------------
    // template helpers
    // ------------------------------------------------------------------
    pub fn list_templates(&self) -> Vec<TemplateRecord> {
        self.with_state(|doc| doc.templates.values().cloned().collect())
    }

    pub fn get_template_record(&self, template_id: &str) -> Option<TemplateRecord> {
        self.with_state(|doc| doc.templates.get(template_id).cloned())
    }

    pub fn upsert_template(
        &self,
        template_id: &str,
        upsert: TemplateUpsert,
    ) -> Result<TemplateRecord, NeuraError> {
        self.with_state_mut(|doc| {
            let now = Utc::now();
            let existing = doc.templates.get(template_id);
            let created_at = existing.map(|r| r.created_at).unwrap_or(now);
            let mut artifacts = existing.map(|r| r.artifacts.clone()).unwrap_or_default();
            for (name, url) in upsert.artifacts {
                if url.is_empty() {
                    artifacts.remove(&name);
                } else {
                    artifacts.insert(name, url);
                }
            }
            let mut tags = normalize_string_list(&upsert.tags);
            if tags.is_empty() {
                tags = existing.map(|r| r.tags.clone()).unwrap_or_default();
            }
            tags.sort();
            let mapping_keys = match upsert.mapping_keys {
                Some(keys) => normalize_string_list(&keys),
                None => existing.map(|r| r.mapping_keys.clone()).unwrap_or_default(),
            };
            let record = TemplateRecord {
                id: template_id.to_string(),
                name: upsert.name,
                status: upsert.status,
                kind: upsert
                    .kind
                    .or_else(|| existing.map(|r| r.kind))
                    .unwrap_or_default(),
                artifacts,
                tags,
                mapping_keys,
                last_connection_id: upsert
                    .connection_id
                    .or_else(|| existing.and_then(|r| r.last_connection_id.clone())),
                last_run_at: existing.and_then(|r| r.last_run_at),
                generator: existing.and_then(|r| r.generator.clone()),
                created_at,
                updated_at: now,
            };
            doc.templates.insert(template_id.to_string(), record.clone());
            Ok(record)
        })
    }

    pub fn record_template_run(
        &self,
        template_id: &str,
        connection_id: Option<&str>,
    ) -> Result<(), NeuraError> {
        self.with_state_mut(|doc| {
            if let Some(record) = doc.templates.get_mut(template_id) {
                let now = Utc::now();
                record.last_run_at = Some(now);
                if let Some(conn) = connection_id {
                    record.last_connection_id = Some(conn.to_string());
                }
                record.updated_at = now;
            }
            Ok(())
        })
    }

    /// Atomic template removal: the record, its saved charts and the
    /// last-used pointer half all go in one write.
    pub fn delete_template(&self, template_id: &str) -> Result<bool, NeuraError> {
        self.with_state_mut(|doc| {
            let removed = doc.templates.remove(template_id).is_some();
            if !removed {
                return Ok(false);
            }
            if doc.last_used.template_id.as_deref() == Some(template_id) {
                doc.last_used.template_id = None;
                doc.last_used.updated_at = Some(Utc::now());
            }
            doc.saved_charts.retain(|_, chart| chart.template_id != template_id);
            Ok(true)
        })
    }

    pub fn update_template_generator(
        &self,
        template_id: &str,
        update: GeneratorMeta,
    ) -> Result<Option<TemplateRecord>, NeuraError> {
        self.with_state_mut(|doc| {
            let Some(record) = doc.templates.get_mut(template_id) else {
                return Ok(None);
            };
            let now = Utc::now();
            let mut generator = update;
            generator.needs_user_fix = normalize_string_list(&generator.needs_user_fix);
            generator.updated_at = Some(now);
            record.generator = Some(generator);
            record.updated_at = now;
            Ok(Some(record.clone()))
        })
    }

    // ------------------------------------------------------------------
    // job helpers
    // ------------------------------------------------------------------
    pub fn create_job(&self, create: JobCreate) -> Result<JobRecord, NeuraError> {
        self.with_state_mut(|doc| {
            let now = Utc::now();
            let job_id = Uuid::new_v4().to_string();
            let template = create
                .template_id
                .as_deref()
                .and_then(|id| doc.templates.get(id));
            let template_name = create
                .template_name
                .clone()
                .or_else(|| template.map(|t| t.name.clone()))
                .or_else(|| create.template_id.clone());
            let template_kind = create
                .template_kind
                .clone()
                .or_else(|| template.map(|t| t.kind.as_str().to_string()))
                .unwrap_or_else(|| "pdf".to_string());
            let steps = create
                .steps
                .iter()
                .filter(|seed| !seed.name.trim().is_empty())
                .map(|seed| JobStep {
                    id: Uuid::new_v4().to_string(),
                    name: seed.name.trim().to_string(),
                    label: if seed.label.trim().is_empty() {
                        seed.name.trim().to_string()
                    } else {
                        seed.label.trim().to_string()
                    },
                    status: StepStatus::Queued,
                    progress: 0.0,
                    created_at: now,
                    started_at: None,
                    finished_at: None,
                    error: None,
                })
                .collect();
            let record = JobRecord {
                id: job_id.clone(),
                job_type: if create.job_type.is_empty() {
                    "run_report".to_string()
                } else {
                    create.job_type.clone()
                },
                template_id: create.template_id.clone(),
                template_name,
                template_kind,
                connection_id: create.connection_id.clone(),
                schedule_id: create.schedule_id.clone(),
                correlation_id: create.correlation_id.clone(),
                status: JobStatus::Queued,
                progress: 0.0,
                error: None,
                result: serde_json::Map::new(),
                steps,
                created_at: now,
                queued_at: now,
                started_at: None,
                finished_at: None,
                updated_at: now,
                meta: create.meta.clone(),
            };
            doc.jobs.insert(job_id, record.clone());
            Ok(record)
        })
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.with_state(|doc| {
            let mut jobs: Vec<&JobRecord> = doc.jobs.values().collect();
            // newest first
            jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let mut out = Vec::new();
            for job in jobs {
                if filter.active_only && job.status.is_terminal() {
                    continue;
                }
                if !filter.statuses.is_empty() && !filter.statuses.contains(&job.status) {
                    continue;
                }
                if !filter.types.is_empty() && !filter.types.contains(&job.job_type) {
                    continue;
                }
                out.push(job.clone());
                if filter.limit > 0 && out.len() >= filter.limit {
                    break;
                }
            }
            out
        })
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.with_state(|doc| doc.jobs.get(job_id).cloned())
    }

    /// The original serialized payload, kept for restart recovery.
    pub fn get_job_meta(&self, job_id: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.with_state(|doc| doc.jobs.get(job_id).map(|j| j.meta.clone()))
    }

    pub fn record_job_start(&self, job_id: &str) -> Result<Option<JobRecord>, NeuraError> {
        self.with_state_mut(|doc| {
            let Some(record) = doc.jobs.get_mut(job_id) else {
                return Ok(None);
            };
            let now = Utc::now();
            if record.status.can_transition_to(JobStatus::Running) {
                record.status = JobStatus::Running;
                if record.started_at.is_none() {
                    record.started_at = Some(now);
                }
            }
            record.updated_at = now;
            Ok(Some(record.clone()))
        })
    }

    pub fn record_job_progress(
        &self,
        job_id: &str,
        progress: f64,
    ) -> Result<Option<JobRecord>, NeuraError> {
        self.with_state_mut(|doc| {
            let Some(record) = doc.jobs.get_mut(job_id) else {
                return Ok(None);
            };
            record.progress = clamp_progress(progress);
            record.updated_at = Utc::now();
            Ok(Some(record.clone()))
        })
    }

    /// Terminal and write-once: a completed job ignores later completions.
    pub fn record_job_completion(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
        result: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Option<JobRecord>, NeuraError> {
        let status = if status.is_terminal() { status } else { JobStatus::Failed };
        self.with_state_mut(|doc| {
            let Some(record) = doc.jobs.get_mut(job_id) else {
                return Ok(None);
            };
            if record.status.is_terminal() {
                return Ok(Some(record.clone()));
            }
            let now = Utc::now();
            record.status = status;
            if record.finished_at.is_none() {
                record.finished_at = Some(now);
            }
            if status == JobStatus::Succeeded && record.progress < 100.0 {
                record.progress = 100.0;
            }
            if let Some(err) = error {
                record.error = Some(err.to_string());
            }
            if let Some(result) = result {
                record.result = result;
            }
            record.updated_at = now;
            Ok(Some(record.clone()))
        })
    }

    pub fn record_job_step(
        &self,
        job_id: &str,
        name: &str,
        status: Option<StepStatus>,
        error: Option<&str>,
        progress: Option<f64>,
        label: Option<&str>,
    ) -> Result<Option<JobRecord>, NeuraError> {
        let step_name = name.trim().to_string();
        if step_name.is_empty() {
            return Ok(None);
        }
        self.with_state_mut(|doc| {
            let Some(record) = doc.jobs.get_mut(job_id) else {
                return Ok(None);
            };
            let now = Utc::now();
            let step = match record.steps.iter_mut().find(|s| s.name == step_name) {
                Some(step) => step,
                None => {
                    record.steps.push(JobStep {
                        id: Uuid::new_v4().to_string(),
                        name: step_name.clone(),
                        label: label.unwrap_or(&step_name).to_string(),
                        status: status.unwrap_or_default(),
                        progress: 0.0,
                        created_at: now,
                        started_at: None,
                        finished_at: None,
                        error: None,
                    });
                    #[allow(clippy::unwrap_used)]
                    let appended = record.steps.last_mut().unwrap();
                    appended
                }
            };
            if let Some(label) = label {
                step.label = label.to_string();
            }
            if let Some(status) = status {
                step.status = status;
                if status == StepStatus::Running && step.started_at.is_none() {
                    step.started_at = Some(now);
                }
                if matches!(status, StepStatus::Succeeded | StepStatus::Failed | StepStatus::Cancelled)
                    && step.finished_at.is_none()
                {
                    step.finished_at = Some(now);
                }
            }
            if let Some(err) = error {
                step.error = Some(err.to_string());
            }
            if let Some(progress) = progress {
                step.progress = clamp_progress(progress);
            }
            record.updated_at = now;
            Ok(Some(record.clone()))
        })
    }

    // ------------------------------------------------------------------
    // schedule helpers
    // ------------------------------------------------------------------
    pub fn list_schedules(&self) -> Vec<ScheduleRecord> {
        self.with_state(|doc| doc.schedules.values().cloned().collect())
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Option<ScheduleRecord> {
        self.with_state(|doc| doc.schedules.get(schedule_id).cloned())
    }

    pub fn create_schedule(&self, create: ScheduleCreate) -> Result<ScheduleRecord, NeuraError> {
        self.with_state_mut(|doc| {
            let now = Utc::now();
            let schedule_id = Uuid::new_v4().to_string();
            let name = create
                .name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .unwrap_or_else(|| create.template_name.clone());
            let record = ScheduleRecord {
                id: schedule_id.clone(),
                name,
                template_id: create.template_id,
                template_name: create.template_name,
                template_kind: create.template_kind,
                connection_id: create.connection_id,
                connection_name: create.connection_name,
                start_date: create.start_date,
                end_date: create.end_date,
                key_values: create.key_values,
                batch_ids: normalize_string_list(&create.batch_ids),
                docx: create.docx,
                xlsx: create.xlsx,
                email_recipients: normalize_email_targets(&create.email_recipients),
                email_subject: create
                    .email_subject
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
                email_message: create
                    .email_message
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
                frequency: create.frequency,
                interval_minutes: create.interval_minutes.max(1),
                next_run_at: create.next_run_at,
                first_run_at: create.first_run_at,
                last_run_at: None,
                last_run_status: None,
                last_run_error: None,
                last_run_artifacts: BTreeMap::new(),
                active: create.active,
                created_at: now,
                updated_at: now,
            };
            doc.schedules.insert(schedule_id, record.clone());
            Ok(record)
        })
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> Result<bool, NeuraError> {
        self.with_state_mut(|doc| Ok(doc.schedules.remove(schedule_id).is_some()))
    }

    pub fn set_schedule_active(
        &self,
        schedule_id: &str,
        active: bool,
    ) -> Result<Option<ScheduleRecord>, NeuraError> {
        self.with_state_mut(|doc| {
            let Some(record) = doc.schedules.get_mut(schedule_id) else {
                return Ok(None);
            };
            record.active = active;
            record.updated_at = Utc::now();
            Ok(Some(record.clone()))
        })
    }

    pub fn set_schedule_next_run(
        &self,
        schedule_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<ScheduleRecord>, NeuraError> {
        self.with_state_mut(|doc| {
            let Some(record) = doc.schedules.get_mut(schedule_id) else {
                return Ok(None);
            };
            record.next_run_at = Some(next_run_at);
            record.updated_at = Utc::now();
            Ok(Some(record.clone()))
        })
    }

    pub fn record_schedule_run(
        &self,
        schedule_id: &str,
        outcome: ScheduleRunOutcome,
    ) -> Result<Option<ScheduleRecord>, NeuraError> {
        self.with_state_mut(|doc| {
            let Some(record) = doc.schedules.get_mut(schedule_id) else {
                return Ok(None);
            };
            record.last_run_at = Some(outcome.finished_at);
            record.last_run_status = Some(outcome.status);
            record.last_run_error = outcome.error;
            record.last_run_artifacts = outcome.artifacts;
            if let Some(next) = outcome.next_run_at {
                record.next_run_at = Some(next);
            }
            record.updated_at = Utc::now();
            Ok(Some(record.clone()))
        })
    }

    // ------------------------------------------------------------------
    // report-run history
    // ------------------------------------------------------------------
    pub fn record_report_run(&self, record: ReportRunRecord) -> Result<(), NeuraError> {
        self.with_state_mut(|doc| {
            doc.report_runs.insert(record.id.clone(), record);
            Ok(())
        })
    }

    pub fn get_report_run(&self, run_id: &str) -> Option<ReportRunRecord> {
        self.with_state(|doc| doc.report_runs.get(run_id).cloned())
    }

    pub fn list_report_runs(
        &self,
        template_id: Option<&str>,
        connection_id: Option<&str>,
        schedule_id: Option<&str>,
        limit: usize,
    ) -> Vec<ReportRunRecord> {
        self.with_state(|doc| {
            let mut runs: Vec<&ReportRunRecord> = doc
                .report_runs
                .values()
                .filter(|run| template_id.is_none_or(|id| run.template_id == id))
                .filter(|run| connection_id.is_none_or(|id| run.connection_id.as_deref() == Some(id)))
                .filter(|run| schedule_id.is_none_or(|id| run.schedule_id.as_deref() == Some(id)))
                .collect();
            runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            runs.into_iter()
                .take(if limit == 0 { usize::MAX } else { limit })
                .cloned()
                .collect()
        })
    }

    // ------------------------------------------------------------------
    // saved charts
    // ------------------------------------------------------------------
    pub fn list_saved_charts(&self, template_id: &str) -> Vec<SavedChart> {
        self.with_state(|doc| {
            doc.saved_charts
                .values()
                .filter(|chart| chart.template_id == template_id)
                .cloned()
                .collect()
        })
    }

    pub fn create_saved_chart(
        &self,
        template_id: &str,
        name: &str,
        spec: serde_json::Value,
    ) -> Result<SavedChart, NeuraError> {
        self.with_state_mut(|doc| {
            let now = Utc::now();
            let chart = SavedChart {
                id: Uuid::new_v4().to_string(),
                template_id: template_id.to_string(),
                name: name.to_string(),
                spec,
                created_at: now,
                updated_at: now,
            };
            doc.saved_charts.insert(chart.id.clone(), chart.clone());
            Ok(chart)
        })
    }

    pub fn delete_saved_chart(&self, chart_id: &str) -> Result<bool, NeuraError> {
        self.with_state_mut(|doc| Ok(doc.saved_charts.remove(chart_id).is_some()))
    }

    // ------------------------------------------------------------------
    // last-used helpers
    // ------------------------------------------------------------------
    pub fn get_last_used(&self) -> LastUsed {
        self.with_state(|doc| doc.last_used.clone())
    }

    pub fn set_last_used(
        &self,
        connection_id: Option<&str>,
        template_id: Option<&str>,
    ) -> Result<LastUsed, NeuraError> {
        self.with_state_mut(|doc| {
            doc.last_used = LastUsed {
                connection_id: connection_id.map(String::from),
                template_id: template_id.map(String::from),
                updated_at: Some(Utc::now()),
            };
            Ok(doc.last_used.clone())
        })
    }
}
