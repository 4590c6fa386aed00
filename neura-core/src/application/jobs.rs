// neura-core/src/application/jobs.rs

// Bounded worker pool for report jobs. Submission returns immediately with
// a queued job id; workers drain an mpsc channel. Cancellation is
// cooperative (status poll at named checkpoints) with an opt-in forced mode
// that flips the per-job flag and terminates registered child processes.

use crate::application::Services;
use crate::application::orchestrator;
use crate::domain::error::DomainError;
use crate::domain::job::{JobStatus, StepStatus};
use crate::domain::schedule::{RunPayload, normalize_email_targets};
use crate::domain::template::TemplateKind;
use crate::error::NeuraError;
use crate::infrastructure::state::{JobCreate, JobFilter, StateStore, StepSeed};
use crate::ports::process::{CURRENT_JOB_ID, ProcessTracker};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use validator::Validate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Static step -> coarse progress table.
pub const DEFAULT_JOB_STEP_PROGRESS: [(&str, f64); 7] = [
    ("dataLoad", 5.0),
    ("contractCheck", 15.0),
    ("renderPdf", 60.0),
    ("renderDocx", 75.0),
    ("renderXlsx", 85.0),
    ("finalize", 95.0),
    ("email", 100.0),
];

pub fn step_progress_for(name: &str) -> Option<f64> {
    DEFAULT_JOB_STEP_PROGRESS
        .iter()
        .find(|(step, _)| *step == name)
        .map(|(_, progress)| *progress)
}

/// The ordered step list for one run payload.
pub fn build_job_steps(payload: &RunPayload, kind: TemplateKind) -> Vec<StepSeed> {
    let mut steps = vec![
        StepSeed::new("dataLoad", "Load database"),
        StepSeed::new("contractCheck", "Prepare contract"),
        StepSeed::new("renderPdf", "Render PDF"),
    ];
    let docx_landscape = kind == TemplateKind::Excel;
    if payload.docx || docx_landscape {
        steps.push(StepSeed::new("renderDocx", "Render DOCX"));
    }
    if payload.xlsx || kind == TemplateKind::Excel {
        steps.push(StepSeed::new("renderXlsx", "Render XLSX"));
    }
    steps.push(StepSeed::new("finalize", "Finalize artifacts"));
    if !normalize_email_targets(payload.email_recipients.clone().unwrap_or_default()).is_empty() {
        steps.push(StepSeed::new("email", "Send email"));
    }
    steps
}

/// Mirrors step transitions and coarse progress into the state store.
#[derive(Clone)]
pub struct JobRunTracker {
    state: Arc<StateStore>,
    pub job_id: String,
    pub correlation_id: Option<String>,
    step_names: HashSet<String>,
    force_flag: Option<Arc<AtomicBool>>,
}

impl JobRunTracker {
    pub fn new(
        state: Arc<StateStore>,
        job_id: impl Into<String>,
        correlation_id: Option<String>,
        steps: &[StepSeed],
    ) -> Self {
        Self {
            state,
            job_id: job_id.into(),
            correlation_id,
            step_names: steps.iter().map(|s| s.name.clone()).collect(),
            force_flag: None,
        }
    }

    fn with_force_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.force_flag = Some(flag);
        self
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.step_names.contains(name)
    }

    /// Trackers without a job id (in-process CLI runs) are inert: steps and
    /// progress are not recorded and cancellation never fires.
    fn is_tracking(&self) -> bool {
        !self.job_id.is_empty()
    }

    pub fn start(&self) {
        if !self.is_tracking() {
            return;
        }
        if let Err(err) = self.state.record_job_start(&self.job_id) {
            error!(job_id = %self.job_id, error = %err, "job start record failed");
        }
    }

    pub fn progress(&self, value: f64) {
        if !self.is_tracking() {
            return;
        }
        if let Err(err) = self.state.record_job_progress(&self.job_id, value) {
            error!(job_id = %self.job_id, error = %err, "job progress record failed");
        }
    }

    fn record_step(
        &self,
        name: &str,
        status: StepStatus,
        error_message: Option<&str>,
        progress: Option<f64>,
        label: Option<&str>,
    ) {
        if !self.is_tracking() || !self.has_step(name) {
            return;
        }
        if let Err(err) =
            self.state
                .record_job_step(&self.job_id, name, Some(status), error_message, progress, label)
        {
            error!(job_id = %self.job_id, step = name, error = %err, "job step record failed");
        }
    }

    pub fn step_running(&self, name: &str, label: Option<&str>) {
        self.record_step(name, StepStatus::Running, None, None, label);
    }

    pub fn step_succeeded(&self, name: &str) {
        self.record_step(name, StepStatus::Succeeded, None, None, None);
        if let Some(progress) = step_progress_for(name) {
            self.progress(progress);
        }
    }

    pub fn step_failed(&self, name: &str, error_message: &str) {
        self.record_step(name, StepStatus::Failed, Some(error_message), None, None);
    }

    pub fn succeed(&self, result: serde_json::Map<String, Value>) {
        if !self.is_tracking() {
            return;
        }
        self.progress(100.0);
        if let Err(err) =
            self.state
                .record_job_completion(&self.job_id, JobStatus::Succeeded, None, Some(result))
        {
            error!(job_id = %self.job_id, error = %err, "job completion record failed");
        }
    }

    pub fn fail(&self, error_message: &str, status: JobStatus) {
        if !self.is_tracking() {
            return;
        }
        if let Err(err) =
            self.state
                .record_job_completion(&self.job_id, status, Some(error_message), None)
        {
            error!(job_id = %self.job_id, error = %err, "job completion record failed");
        }
    }

    /// Cooperative cancellation poll, called at every safe point.
    pub fn check_cancelled(&self) -> Result<(), NeuraError> {
        if !self.is_tracking() {
            return Ok(());
        }
        if let Some(flag) = &self.force_flag
            && flag.load(Ordering::SeqCst)
        {
            return Err(NeuraError::Domain(DomainError::JobCancelled));
        }
        let cancelled = self
            .state
            .get_job(&self.job_id)
            .map(|job| job.status == JobStatus::Cancelled)
            .unwrap_or(false);
        if cancelled {
            return Err(NeuraError::Domain(DomainError::JobCancelled));
        }
        Ok(())
    }
}

struct QueuedJob {
    job_id: String,
    payload: RunPayload,
    kind: TemplateKind,
    correlation_id: String,
    steps: Vec<StepSeed>,
}

#[derive(Default)]
struct CancellationRegistry {
    force_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl CancellationRegistry {
    fn register(&self, job_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        #[allow(clippy::unwrap_used)]
        self.force_flags
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(job_id.to_string(), flag.clone());
        flag
    }

    fn clear(&self, job_id: &str) {
        #[allow(clippy::unwrap_used)]
        self.force_flags
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(job_id);
    }

    fn force(&self, job_id: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        let flags = self.force_flags.lock().unwrap_or_else(|p| p.into_inner());
        match flags.get(job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Bounded worker pool. Workers drain the channel; each job is wrapped in a
/// tracker and runs the report orchestrator.
pub struct JobEngine {
    services: Services,
    tx: mpsc::UnboundedSender<QueuedJob>,
    registry: Arc<CancellationRegistry>,
    processes: Arc<ProcessTracker>,
}

impl JobEngine {
    pub fn start(services: Services, processes: Arc<ProcessTracker>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<QueuedJob>();
        let registry = Arc::new(CancellationRegistry::default());
        let engine = Arc::new(Self {
            services: services.clone(),
            tx,
            registry,
            processes: processes.clone(),
        });

        let workers = services.config.job_max_workers.max(1);
        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker_idx in 0..workers {
            let services = services.clone();
            let registry = engine.registry.clone();
            let processes = processes.clone();
            let shared_rx = shared_rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = shared_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        break;
                    };
                    run_one_job(&services, &registry, &processes, job).await;
                }
                info!(worker_idx, "job worker stopped");
            });
        }
        info!(workers, "job engine started");
        engine
    }

    /// Queue a run-report job. Returns the queued job id immediately.
    pub fn submit(
        &self,
        payload: RunPayload,
        kind: TemplateKind,
        schedule_id: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<String, NeuraError> {
        payload
            .validate()
            .map_err(|e| NeuraError::Domain(DomainError::Validation(e.to_string())))?;
        let correlation_id = correlation_id
            .unwrap_or_else(|| format!("job-{}", &uuid::Uuid::new_v4().to_string()[..10]));
        let steps = build_job_steps(&payload, kind);
        let template_record = self.services.state.get_template_record(&payload.template_id);

        let mut meta = serde_json::Map::new();
        meta.insert("start_date".into(), Value::String(payload.start_date.clone()));
        meta.insert("end_date".into(), Value::String(payload.end_date.clone()));
        meta.insert("docx".into(), Value::Bool(payload.docx));
        meta.insert("xlsx".into(), Value::Bool(payload.xlsx));
        meta.insert("payload".into(), serde_json::to_value(&payload)?);

        let job = self.services.state.create_job(JobCreate {
            job_type: "run_report".into(),
            template_id: Some(payload.template_id.clone()),
            template_name: template_record.as_ref().map(|t| t.name.clone()),
            template_kind: Some(kind.as_str().to_string()),
            connection_id: payload.connection_id.clone(),
            schedule_id,
            correlation_id: Some(correlation_id.clone()),
            steps: steps.clone(),
            meta,
        })?;

        self.tx
            .send(QueuedJob {
                job_id: job.id.clone(),
                payload,
                kind,
                correlation_id: correlation_id.clone(),
                steps,
            })
            .map_err(|_| NeuraError::InternalError("job channel closed".into()))?;
        info!(job_id = %job.id, correlation_id = %correlation_id, "job enqueued");
        Ok(job.id)
    }

    /// Cancel a job. Queued jobs go terminal immediately; running jobs get
    /// the cooperative flag, plus child-process termination when forced.
    pub fn cancel(&self, job_id: &str, force: bool) -> Result<bool, NeuraError> {
        let Some(job) = self.services.state.get_job(job_id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        if job.status == JobStatus::Queued {
            self.services.state.record_job_completion(
                job_id,
                JobStatus::Cancelled,
                Some("Cancelled before start"),
                None,
            )?;
            return Ok(true);
        }
        // Running: cooperative mark, the worker observes it at the next poll.
        self.services.state.record_job_completion(
            job_id,
            JobStatus::Cancelled,
            Some("Cancelled by user"),
            None,
        )?;
        if force {
            self.registry.force(job_id);
            self.processes.kill_job(job_id);
        }
        Ok(true)
    }
}

async fn run_one_job(
    services: &Services,
    registry: &Arc<CancellationRegistry>,
    processes: &Arc<ProcessTracker>,
    job: QueuedJob,
) {
    // Cancelled while queued: never start.
    let current = services.state.get_job(&job.job_id);
    if current.map(|j| j.status.is_terminal()).unwrap_or(true) {
        info!(job_id = %job.job_id, "skipping terminal job");
        return;
    }

    let flag = registry.register(&job.job_id);
    let tracker = JobRunTracker::new(
        services.state.clone(),
        job.job_id.clone(),
        Some(job.correlation_id.clone()),
        &job.steps,
    )
    .with_force_flag(flag);
    tracker.start();

    let job_id = job.job_id.clone();
    let outcome = CURRENT_JOB_ID
        .scope(job_id.clone(), async {
            orchestrator::run_report_with_email(
                services,
                &job.payload,
                job.kind,
                Some(&job.correlation_id),
                &tracker,
            )
            .await
        })
        .await;

    match outcome {
        Ok(result) => {
            tracker.succeed(result);
            info!(job_id = %job_id, "job completed");
        }
        Err(NeuraError::Domain(DomainError::JobCancelled)) => {
            tracker.fail("Job cancelled", JobStatus::Cancelled);
            if let Ok(tdir) = crate::application::templates::template_dir(
                &services.config,
                &job.payload.template_id,
                job.kind,
                true,
                false,
            ) {
                let swept = crate::infrastructure::artifacts::sweep_temp_files(&tdir);
                if swept > 0 {
                    info!(job_id = %job_id, swept, "temp files removed after cancellation");
                }
            }
            info!(job_id = %job_id, "job cancelled");
        }
        Err(err) => {
            tracker.fail(&err.to_string(), JobStatus::Failed);
            warn!(job_id = %job_id, error = %err, "job failed");
        }
    }
    registry.clear(&job_id);
    processes.clear(&job_id);
}

/// Restart recovery: queued/running jobs with a complete serialized payload
/// are requeued as fresh jobs; the originals go terminal. Capped at
/// `max_jobs` recoveries per restart.
pub fn recover_report_jobs(
    services: &Services,
    engine: &JobEngine,
    max_jobs: usize,
) -> Result<usize, NeuraError> {
    let stuck = services.state.list_jobs(&JobFilter {
        statuses: vec![JobStatus::Queued, JobStatus::Running],
        types: vec!["run_report".into()],
        limit: 0,
        active_only: false,
    });

    let mut recovered = 0usize;
    for job in stuck {
        if max_jobs > 0 && recovered >= max_jobs {
            break;
        }
        let meta = services.state.get_job_meta(&job.id).unwrap_or_default();
        let Some(payload_value) = meta.get("payload") else {
            services.state.record_job_completion(
                &job.id,
                JobStatus::Failed,
                Some("Server restarted before job could resume"),
                None,
            )?;
            continue;
        };
        let payload: RunPayload = match serde_json::from_value(payload_value.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                services.state.record_job_completion(
                    &job.id,
                    JobStatus::Failed,
                    Some(&format!("Server restarted; job payload invalid: {err}")),
                    None,
                )?;
                continue;
            }
        };

        services.state.record_job_completion(
            &job.id,
            JobStatus::Failed,
            Some("Server restarted; job requeued"),
            None,
        )?;

        let kind: TemplateKind = job.template_kind.parse().unwrap_or_default();
        let correlation_id = job
            .correlation_id
            .clone()
            .unwrap_or_else(|| format!("recovered-{}", &job.id[..8.min(job.id.len())]));

        // The fresh job carries the provenance of the one it replaces.
        let steps = build_job_steps(&payload, kind);
        let mut meta = serde_json::Map::new();
        meta.insert("payload".into(), payload_value.clone());
        meta.insert("recovered_from".into(), Value::String(job.id.clone()));
        let new_job = services.state.create_job(JobCreate {
            job_type: "run_report".into(),
            template_id: Some(payload.template_id.clone()),
            template_name: job.template_name.clone(),
            template_kind: Some(kind.as_str().to_string()),
            connection_id: payload.connection_id.clone(),
            schedule_id: payload.schedule_id.clone(),
            correlation_id: Some(correlation_id.clone()),
            steps: steps.clone(),
            meta,
        })?;
        engine
            .tx
            .send(QueuedJob {
                job_id: new_job.id.clone(),
                payload,
                kind,
                correlation_id,
                steps,
            })
            .map_err(|_| NeuraError::InternalError("job channel closed".into()))?;
        recovered += 1;
        info!(original = %job.id, requeued = %new_job.id, "job recovered after restart");
    }
    Ok(recovered)
}
