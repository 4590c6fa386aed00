// neura-core/src/application/scheduler.rs

// Interval-triggered schedule dispatcher. One process-wide poll loop walks
// the active schedules, gates each on its date window and next_run_at, and
// enqueues at most one in-flight job per schedule. The scheduler is
// authoritative for next_run_at; it never cancels in-flight jobs.

use crate::application::Services;
use crate::application::jobs::JobEngine;
use crate::domain::job::JobStatus;
use crate::domain::schedule::{ScheduleRecord, ScheduleRunStatus};
use crate::domain::template::TemplateKind;
use crate::infrastructure::state::ScheduleRunOutcome;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Grace window for misfired triggers; anything older is coalesced into a
/// single dispatch.
pub const MISFIRE_GRACE: Duration = Duration::from_secs(60);

const COMPLETION_POLL: Duration = Duration::from_secs(2);

pub struct ReportScheduler {
    services: Services,
    engine: Arc<JobEngine>,
    poll_interval: Duration,
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl ReportScheduler {
    pub fn new(services: Services, engine: Arc<JobEngine>) -> Self {
        let poll_interval = Duration::from_secs(services.config.scheduler_poll_seconds.max(5));
        Self {
            services,
            engine,
            poll_interval,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run the poll loop forever. Callers spawn this on the runtime.
    pub async fn run(self: Arc<Self>) {
        info!(poll_seconds = self.poll_interval.as_secs(), "scheduler started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            self.dispatch_due_jobs().await;
        }
    }

    pub fn inflight_count(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        let inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        inflight.len()
    }

    /// One poll pass: dispatch every due schedule that is not already
    /// in flight.
    pub async fn dispatch_due_jobs(self: &Arc<Self>) {
        let now = Utc::now();
        for schedule in self.services.state.list_schedules() {
            if !schedule.is_due(now) {
                continue;
            }
            if let Some(next) = schedule.next_run_at
                && now.signed_duration_since(next).num_seconds() > MISFIRE_GRACE.as_secs() as i64
            {
                // Missed triggers collapse into this single dispatch; the
                // recomputed next_run_at restores the cadence.
                info!(schedule_id = %schedule.id, "misfired trigger coalesced");
            }
            {
                #[allow(clippy::unwrap_used)]
                let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
                if !inflight.insert(schedule.id.clone()) {
                    // Coalesce: one in-flight run per schedule id.
                    continue;
                }
            }
            let this = self.clone();
            tokio::spawn(async move {
                this.dispatch_one(schedule).await;
            });
        }
    }

    async fn dispatch_one(self: Arc<Self>, schedule: ScheduleRecord) {
        let started = Utc::now();
        let schedule_id = schedule.id.clone();
        let correlation_id = format!("sched-{}-{}", schedule_id, started.timestamp());
        let kind: TemplateKind = schedule.template_kind.parse().unwrap_or_default();
        let payload = schedule.run_payload();

        info!(schedule_id = %schedule_id, "schedule dispatch");
        let submit = self.engine.submit(
            payload,
            kind,
            Some(schedule_id.clone()),
            Some(correlation_id),
        );

        let outcome = match submit {
            Ok(job_id) => self.await_job(&job_id).await,
            Err(err) => {
                warn!(schedule_id = %schedule_id, error = %err, "schedule dispatch failed");
                (ScheduleRunStatus::Failed, Some(err.to_string()), Default::default())
            }
        };
        let (status, error, artifacts) = outcome;

        let finished = Utc::now();
        let next_run_at = schedule.next_run_after(Utc::now(), finished);
        if let Err(err) = self.services.state.record_schedule_run(&schedule_id, ScheduleRunOutcome {
            started_at: started,
            finished_at: finished,
            status,
            next_run_at: Some(next_run_at),
            artifacts,
            error,
        }) {
            warn!(schedule_id = %schedule_id, error = %err, "schedule run record failed");
        }

        #[allow(clippy::unwrap_used)]
        self.inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&schedule_id);
        info!(schedule_id = %schedule_id, status = ?status, "schedule run recorded");
    }

    /// Wait for the submitted job to reach a terminal status, collecting
    /// the artifact URLs from its result payload.
    async fn await_job(
        &self,
        job_id: &str,
    ) -> (
        ScheduleRunStatus,
        Option<String>,
        std::collections::BTreeMap<String, String>,
    ) {
        loop {
            let Some(job) = self.services.state.get_job(job_id) else {
                return (
                    ScheduleRunStatus::Failed,
                    Some("job record disappeared".to_string()),
                    Default::default(),
                );
            };
            if job.status.is_terminal() {
                let mut artifacts = std::collections::BTreeMap::new();
                for key in ["html_url", "pdf_url", "docx_url", "xlsx_url"] {
                    if let Some(url) = job.result.get(key).and_then(|v| v.as_str()) {
                        artifacts.insert(key.to_string(), url.to_string());
                    }
                }
                let status = if job.status == JobStatus::Succeeded {
                    ScheduleRunStatus::Success
                } else {
                    ScheduleRunStatus::Failed
                };
                return (status, job.error, artifacts);
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    // Date-window gating itself is covered on ScheduleRecord::is_due; the
    // scheduler-level scenarios (no dispatch past end_date, empty inflight
    // set) live in the integration tests where a full Services bundle with
    // mock ports is available.
}
