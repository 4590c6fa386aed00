// neura-core/tests/report_flow.rs

// End-to-end flows over mock collaborator ports: a full report run, job
// cancellation mid-render, restart recovery, schedule date-window gating
// and the auto-map cache hit.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use neura_core::NeuraError;
use neura_core::application::Services;
use neura_core::application::jobs::{JobEngine, JobRunTracker, build_job_steps, recover_report_jobs};
use neura_core::application::orchestrator;
use neura_core::application::pipeline::automap_stage;
use neura_core::application::scheduler::ReportScheduler;
use neura_core::domain::job::{JobStatus, StepStatus};
use neura_core::domain::schedule::RunPayload;
use neura_core::domain::template::{TemplateKind, TemplateStatus};
use neura_core::infrastructure::config::AppConfig;
use neura_core::infrastructure::introspect::SchemaCache;
use neura_core::infrastructure::state::{
    ConnectionUpsert, JobCreate, ScheduleCreate, StateStore, TemplateUpsert,
};
use neura_core::ports::llm::{ChatModel, ChatRequest};
use neura_core::ports::mailer::{Mailer, OutboundEmail};
use neura_core::ports::process::ProcessTracker;
use neura_core::ports::render::{
    DocxConverter, DocxHints, PageRenderer, PdfOptions, PdfRasterizer, Viewport, XlsxExporter,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ---------------------------------------------------------------------
// mock collaborators
// ---------------------------------------------------------------------

struct ScriptedChat {
    responses: Mutex<Vec<String>>,
}

impl ScriptedChat {
    fn new(responses: Vec<String>) -> Self {
        Self { responses: Mutex::new(responses.into_iter().rev().collect()) }
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, _request: &ChatRequest) -> Result<String, NeuraError> {
        self.responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| NeuraError::InternalError("scripted chat exhausted".into()))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

fn write_test_png(path: &Path) -> Result<(), NeuraError> {
    image::GrayImage::from_pixel(8, 8, image::Luma([128]))
        .save(path)
        .map_err(|e| NeuraError::InternalError(e.to_string()))
}

/// Renderer that writes a fixed PNG / placeholder PDF; PDF rendering can be
/// gated on a notify so tests can cancel a job mid-render.
#[derive(Default)]
struct FakeRenderer {
    block_pdf: Option<Arc<tokio::sync::Notify>>,
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn html_to_png(
        &self,
        _html_path: &Path,
        out_png: &Path,
        _viewport: Viewport,
    ) -> Result<(), NeuraError> {
        write_test_png(out_png)
    }

    async fn html_to_pdf(
        &self,
        _html_path: &Path,
        out_pdf: &Path,
        _options: PdfOptions,
    ) -> Result<(), NeuraError> {
        if let Some(gate) = &self.block_pdf {
            gate.notified().await;
        }
        std::fs::write(out_pdf, b"%PDF-1.4 fake")?;
        Ok(())
    }
}

struct FakeRasterizer;

#[async_trait]
impl PdfRasterizer for FakeRasterizer {
    async fn rasterize_page(
        &self,
        _pdf_path: &Path,
        _page: usize,
        _dpi: u32,
        out_png: &Path,
    ) -> Result<(), NeuraError> {
        write_test_png(out_png)
    }
}

struct FakeOffice;

#[async_trait]
impl DocxConverter for FakeOffice {
    async fn pdf_to_docx(
        &self,
        _pdf_path: &Path,
        out_docx: &Path,
        _timeout: Duration,
    ) -> Result<(), NeuraError> {
        std::fs::write(out_docx, b"docx")?;
        Ok(())
    }

    async fn html_to_docx(
        &self,
        _html_path: &Path,
        out_docx: &Path,
        _hints: DocxHints,
    ) -> Result<(), NeuraError> {
        std::fs::write(out_docx, b"docx")?;
        Ok(())
    }
}

#[async_trait]
impl XlsxExporter for FakeOffice {
    async fn html_to_xlsx(&self, _html_path: &Path, out_xlsx: &Path) -> Result<(), NeuraError> {
        std::fs::write(out_xlsx, b"xlsx")?;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<bool, NeuraError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(true)
    }
}

// ---------------------------------------------------------------------
// fixture
// ---------------------------------------------------------------------

struct Fixture {
    _root: TempDir,
    services: Services,
    mailer: Arc<RecordingMailer>,
    db_path: PathBuf,
    connection_id: String,
}

fn seed_database(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE readings (id INTEGER PRIMARY KEY, customer_id INTEGER, amount REAL, reading_date TEXT);
         INSERT INTO customers VALUES (1, 'Alice');
         INSERT INTO readings VALUES (1, 1, 10.0, '2024-01-05'), (2, 1, 20.0, '2024-01-09');",
    )
    .unwrap();
}

fn build_fixture(chat_responses: Vec<String>, block_pdf: Option<Arc<tokio::sync::Notify>>) -> Fixture {
    let root = TempDir::new().unwrap();
    let mut config = AppConfig::from_env();
    config.upload_root = root.path().join("uploads");
    config.state_dir = root.path().join("state");
    config.job_max_workers = 2;
    let config = Arc::new(config);

    let state = Arc::new(StateStore::open(&config.state_dir).unwrap());
    let db_path = root.path().join("source.sqlite3");
    seed_database(&db_path);
    let connection = state
        .upsert_connection(ConnectionUpsert {
            conn_id: None,
            name: "Test DB".into(),
            db_type: "sqlite".into(),
            database_path: db_path.display().to_string(),
            secret_payload: None,
            status: Some("ok".into()),
            latency_ms: None,
            tags: vec![],
        })
        .unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let office = Arc::new(FakeOffice);
    let services = Services {
        config,
        state,
        chat: Arc::new(ScriptedChat::new(chat_responses)),
        page_renderer: Arc::new(FakeRenderer { block_pdf }),
        rasterizer: Arc::new(FakeRasterizer),
        docx: office.clone(),
        xlsx: office,
        mailer: mailer.clone(),
        schema_cache: Arc::new(SchemaCache::new(Duration::from_secs(30), 8)),
    };
    Fixture {
        _root: root,
        services,
        mailer,
        db_path,
        connection_id: connection.id,
    }
}

const TEMPLATE_ID: &str = "monthly-consumption";

const TEMPLATE_HTML: &str = concat!(
    "<html><body><h1>{customer}</h1>",
    "<!--BEGIN:BLOCK_REPEAT rows-->",
    "<table><tbody><tr><td>{row_amount}</td></tr></tbody></table>",
    "<!--END:BLOCK_REPEAT rows-->",
    "<p>Total: {total_amount}</p></body></html>"
);

/// Seed a template directory as if stages 1-5 already ran.
fn seed_approved_template(fixture: &Fixture) -> PathBuf {
    let tdir = fixture
        .services
        .config
        .upload_root
        .join("pdf")
        .join(TEMPLATE_ID);
    std::fs::create_dir_all(tdir.join("generator")).unwrap();
    std::fs::write(tdir.join("template_p1.html"), TEMPLATE_HTML).unwrap();

    let contract = serde_json::json!({
        "tokens": {"scalars": ["customer"], "row_tokens": ["row_amount"], "totals": ["total_amount"]},
        "mapping": {
            "customer": "customers.name",
            "row_amount": "readings.amount",
            "total_amount": "SUM(readings.amount)"
        },
        "join": {"parent_table": "customers", "parent_key": "id", "child_table": "readings", "child_key": "customer_id"},
        "order_by": {"rows": ["ROWID"]},
        "row_order": ["ROWID"]
    });
    std::fs::write(tdir.join("contract.json"), contract.to_string()).unwrap();

    let assets = serde_json::json!({
        "sql": {
            "header": "SELECT name AS customer FROM customers LIMIT 1",
            "rows": "SELECT amount AS row_amount FROM readings ORDER BY id",
            "totals": "SELECT SUM(amount) AS total_amount FROM readings"
        },
        "output_schemas": {"header": ["customer"], "rows": ["row_amount"], "totals": ["total_amount"]},
        "params": {"required": [], "optional": []},
        "contract": contract,
        "needs_user_fix": [],
        "invalid": false,
        "dialect": "sqlite"
    });
    std::fs::write(
        tdir.join("generator/generator_assets.json"),
        assets.to_string(),
    )
    .unwrap();

    fixture
        .services
        .state
        .upsert_template(TEMPLATE_ID, TemplateUpsert {
            name: "Monthly Consumption".into(),
            status: TemplateStatus::Approved,
            artifacts: BTreeMap::new(),
            tags: vec![],
            connection_id: Some(fixture.connection_id.clone()),
            mapping_keys: None,
            kind: Some(TemplateKind::Pdf),
        })
        .unwrap();
    tdir
}

fn run_payload(fixture: &Fixture) -> RunPayload {
    RunPayload {
        template_id: TEMPLATE_ID.into(),
        connection_id: Some(fixture.connection_id.clone()),
        start_date: "2024-01-01".into(),
        end_date: "2024-01-31".into(),
        batch_ids: None,
        key_values: None,
        docx: false,
        xlsx: false,
        email_recipients: Some(vec!["ops@example.com".into()]),
        email_subject: None,
        email_message: None,
        schedule_id: None,
        schedule_name: None,
    }
}

// ---------------------------------------------------------------------
// scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_full_report_run_produces_artifacts_and_history() {
    let fixture = build_fixture(vec![], None);
    let tdir = seed_approved_template(&fixture);
    let payload = run_payload(&fixture);

    let steps = build_job_steps(&payload, TemplateKind::Pdf);
    let job = fixture
        .services
        .state
        .create_job(JobCreate {
            job_type: "run_report".into(),
            template_id: Some(TEMPLATE_ID.into()),
            steps: steps.clone(),
            ..Default::default()
        })
        .unwrap();
    let tracker = JobRunTracker::new(
        fixture.services.state.clone(),
        job.id.clone(),
        None,
        &steps,
    );
    tracker.start();

    let result = orchestrator::run_report_with_email(
        &fixture.services,
        &payload,
        TemplateKind::Pdf,
        Some("cid-run"),
        &tracker,
    )
    .await
    .unwrap();

    assert_eq!(result.get("ok"), Some(&serde_json::json!(true)));
    let pdf_url = result.get("pdf_url").and_then(|v| v.as_str()).unwrap();
    assert!(pdf_url.starts_with("/uploads/pdf/monthly-consumption/filled_"));

    // The filled HTML contains the expanded rows and totals.
    let filled = std::fs::read_dir(&tdir)
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().ends_with(".html")
            && e.file_name().to_string_lossy().starts_with("filled_"))
        .unwrap();
    let html = std::fs::read_to_string(filled.path()).unwrap();
    assert!(html.contains("<h1>Alice</h1>"));
    assert!(html.contains("<td>10</td>") || html.contains("<td>10.0</td>"));
    assert!(html.contains("Total: 30"));

    // Manifest, run history, last-used pointer and the notification email.
    let manifest = neura_core::infrastructure::artifacts::load_manifest(&tdir)
        .unwrap()
        .unwrap();
    assert_eq!(manifest.step, "reports_run");
    let runs = fixture.services.state.list_report_runs(Some(TEMPLATE_ID), None, None, 10);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "succeeded");
    assert_eq!(
        fixture.services.state.get_last_used().template_id.as_deref(),
        Some(TEMPLATE_ID)
    );
    let sent = fixture.mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].attachments[0].to_string_lossy().ends_with(".pdf"));
}

#[tokio::test]
async fn test_job_cancel_while_rendering() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let fixture = build_fixture(vec![], Some(gate.clone()));
    seed_approved_template(&fixture);

    let engine = JobEngine::start(fixture.services.clone(), Arc::new(ProcessTracker::default()));
    let job_id = engine
        .submit(run_payload(&fixture), TemplateKind::Pdf, None, None)
        .unwrap();

    // Wait for the worker to reach the gated renderPdf step.
    for _ in 0..100 {
        let job = fixture.services.state.get_job(&job_id).unwrap();
        let rendering = job
            .steps
            .iter()
            .any(|s| s.name == "renderPdf" && s.status == StepStatus::Running);
        if rendering {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(engine.cancel(&job_id, false).unwrap());
    // notify_one stores a permit, so the renderer resumes even if it had
    // not reached its await yet.
    gate.notify_one();

    // The cooperative poll after the render observes the cancellation.
    let mut final_status = JobStatus::Running;
    for _ in 0..100 {
        let job = fixture.services.state.get_job(&job_id).unwrap();
        if job.status.is_terminal() {
            final_status = job.status;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(final_status, JobStatus::Cancelled);

    // No successful run was recorded.
    let runs = fixture.services.state.list_report_runs(Some(TEMPLATE_ID), None, None, 10);
    assert!(runs.iter().all(|run| run.status != "succeeded"));
}

#[tokio::test]
async fn test_restart_recovery_requeues_complete_payloads() {
    let fixture = build_fixture(vec![], None);
    seed_approved_template(&fixture);
    let payload = run_payload(&fixture);

    // Persist a queued job with a complete payload, as a crashed process
    // would have left it.
    let mut meta = serde_json::Map::new();
    meta.insert("payload".into(), serde_json::to_value(&payload).unwrap());
    let stale = fixture
        .services
        .state
        .create_job(JobCreate {
            job_type: "run_report".into(),
            template_id: Some(TEMPLATE_ID.into()),
            template_kind: Some("pdf".into()),
            meta,
            ..Default::default()
        })
        .unwrap();
    // And one with no payload at all.
    let hopeless = fixture
        .services
        .state
        .create_job(JobCreate { job_type: "run_report".into(), ..Default::default() })
        .unwrap();

    let engine = JobEngine::start(fixture.services.clone(), Arc::new(ProcessTracker::default()));
    let recovered = recover_report_jobs(&fixture.services, &engine, 50).unwrap();
    assert_eq!(recovered, 1);

    let original = fixture.services.state.get_job(&stale.id).unwrap();
    assert_eq!(original.status, JobStatus::Failed);
    assert_eq!(original.error.as_deref(), Some("Server restarted; job requeued"));

    let broken = fixture.services.state.get_job(&hopeless.id).unwrap();
    assert_eq!(broken.status, JobStatus::Failed);
    assert_eq!(
        broken.error.as_deref(),
        Some("Server restarted before job could resume")
    );

    let requeued = fixture
        .services
        .state
        .list_jobs(&Default::default())
        .into_iter()
        .find(|job| {
            job.meta.get("recovered_from").and_then(|v| v.as_str()) == Some(stale.id.as_str())
        })
        .expect("requeued job with recovered_from meta");

    // The fresh job runs to completion on the worker pool.
    for _ in 0..200 {
        let job = fixture.services.state.get_job(&requeued.id).unwrap();
        if job.status.is_terminal() {
            assert_eq!(job.status, JobStatus::Succeeded);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("recovered job never finished");
}

#[tokio::test]
async fn test_schedule_outside_window_never_dispatches() {
    let fixture = build_fixture(vec![], None);
    seed_approved_template(&fixture);

    let now = chrono::Utc::now();
    fixture
        .services
        .state
        .create_schedule(ScheduleCreate {
            name: Some("Expired".into()),
            template_id: TEMPLATE_ID.into(),
            template_name: "Monthly Consumption".into(),
            template_kind: "pdf".into(),
            connection_id: Some(fixture.connection_id.clone()),
            connection_name: None,
            start_date: now - chrono::Duration::days(30),
            end_date: now - chrono::Duration::days(1),
            key_values: BTreeMap::new(),
            batch_ids: vec![],
            docx: false,
            xlsx: false,
            email_recipients: vec![],
            email_subject: None,
            email_message: None,
            frequency: "daily".into(),
            interval_minutes: 1440,
            next_run_at: Some(now - chrono::Duration::hours(1)),
            first_run_at: None,
            active: true,
        })
        .unwrap();

    let engine = JobEngine::start(fixture.services.clone(), Arc::new(ProcessTracker::default()));
    let scheduler = Arc::new(ReportScheduler::new(fixture.services.clone(), engine));
    scheduler.dispatch_due_jobs().await;

    assert_eq!(scheduler.inflight_count(), 0);
    assert!(fixture.services.state.list_jobs(&Default::default()).is_empty());
}

#[tokio::test]
async fn test_due_schedule_dispatches_and_advances_next_run() {
    let fixture = build_fixture(vec![], None);
    seed_approved_template(&fixture);

    let now = chrono::Utc::now();
    let schedule = fixture
        .services
        .state
        .create_schedule(ScheduleCreate {
            name: Some("Hourly".into()),
            template_id: TEMPLATE_ID.into(),
            template_name: "Monthly Consumption".into(),
            template_kind: "pdf".into(),
            connection_id: Some(fixture.connection_id.clone()),
            connection_name: None,
            start_date: now - chrono::Duration::days(1),
            end_date: now + chrono::Duration::days(1),
            key_values: BTreeMap::new(),
            batch_ids: vec![],
            docx: false,
            xlsx: false,
            email_recipients: vec![],
            email_subject: None,
            email_message: None,
            frequency: "hourly".into(),
            interval_minutes: 60,
            next_run_at: Some(now - chrono::Duration::minutes(5)),
            first_run_at: None,
            active: true,
        })
        .unwrap();

    let engine = JobEngine::start(fixture.services.clone(), Arc::new(ProcessTracker::default()));
    let scheduler = Arc::new(ReportScheduler::new(fixture.services.clone(), engine));
    scheduler.dispatch_due_jobs().await;

    // Wait for the dispatched run to finish and the bookkeeping to land.
    for _ in 0..200 {
        let record = fixture.services.state.get_schedule(&schedule.id).unwrap();
        if record.last_run_at.is_some() {
            assert_eq!(
                record.last_run_status,
                Some(neura_core::domain::schedule::ScheduleRunStatus::Success)
            );
            let next = record.next_run_at.unwrap();
            assert!(next > now + chrono::Duration::minutes(59));
            assert!(record.last_run_artifacts.contains_key("pdf_url"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("schedule run was never recorded");
}

#[tokio::test]
async fn test_verify_stage_produces_draft_artifacts() {
    let schema = serde_json::json!({
        "scalars": {"report_title": "Report Title"},
        "row_tokens": ["row_amount"],
        "totals": ["total_amount"],
        "notes": ""
    })
    .to_string();
    let html = "<html><head><style>body { margin: 0; }</style></head>\
                <body><h1>{report_title}</h1></body></html>";
    let fixture = build_fixture(vec![schema, html.to_string()], None);

    let outcome = neura_core::application::pipeline::verify_stage(
        &fixture.services,
        "fresh-template",
        TemplateKind::Pdf,
        b"%PDF-1.4 upload",
        Some("cid-verify"),
    )
    .await
    .unwrap();

    // Identical reference and render: the photocopy passes without fixes.
    assert!(outcome.ssim > 0.99);
    assert_eq!(outcome.fix_passes, 0);

    let tdir = fixture.services.config.upload_root.join("pdf/fresh-template");
    for name in [
        "source.pdf",
        "reference_p1.png",
        "template_p1.html",
        "render_p1.png",
        "schema_ext.json",
        "artifact_manifest.json",
    ] {
        assert!(tdir.join(name).exists(), "missing {name}");
    }
    let record = fixture.services.state.get_template_record("fresh-template").unwrap();
    assert_eq!(record.status, TemplateStatus::Draft);
}

#[tokio::test]
async fn test_automap_cache_hit_on_second_call() {
    let mapping_response = serde_json::json!({
        "mapping": {
            "customer": "customers.name",
            "row_amount": "readings.amount",
            "total_amount": "SUM(readings.amount)"
        },
        "token_samples": {
            "customer": "Alice",
            "row_amount": "10.0",
            "total_amount": "30.0"
        },
        "meta": {}
    })
    .to_string();
    // Exactly one scripted response: a second LLM call would error.
    let fixture = build_fixture(vec![mapping_response], None);
    let tdir = fixture
        .services
        .config
        .upload_root
        .join("pdf")
        .join(TEMPLATE_ID);
    std::fs::create_dir_all(&tdir).unwrap();
    std::fs::write(tdir.join("template_p1.html"), TEMPLATE_HTML).unwrap();
    fixture
        .services
        .state
        .upsert_template(TEMPLATE_ID, TemplateUpsert {
            name: "Monthly Consumption".into(),
            status: TemplateStatus::Draft,
            kind: Some(TemplateKind::Pdf),
            ..Default::default()
        })
        .unwrap();

    let first = automap_stage(
        &fixture.services,
        TEMPLATE_ID,
        &fixture.connection_id,
        TemplateKind::Pdf,
        None,
        false,
    )
    .await
    .unwrap();
    assert!(!first.cached);

    let second = automap_stage(
        &fixture.services,
        TEMPLATE_ID,
        &fixture.connection_id,
        TemplateKind::Pdf,
        None,
        false,
    )
    .await
    .unwrap();
    assert!(second.cached);
    assert_eq!(first.mapping, second.mapping);
    assert_eq!(first.html_constants_applied, second.html_constants_applied);

    let _ = fixture.db_path;
}
