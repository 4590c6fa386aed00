// neura-core/src/application/orchestrator.rs

// The report orchestrator is the only place that mutates a template
// directory at run time: resolve the database, take the template lock,
// execute the contract SQL, render, write the manifest, record the run,
// then optionally notify.

use crate::application::Services;
use crate::application::executor::{ReportData, execute_entrypoints};
use crate::application::jobs::JobRunTracker;
use crate::application::pipeline::generator::GeneratorAssets;
use crate::application::render::{RunContext, render_report_html};
use crate::application::templates::{
    CONTRACT_JSON, GENERATOR_ASSETS_JSON, REPORT_FINAL_HTML, TEMPLATE_HTML, artifact_url,
    template_dir,
};
use crate::domain::contract::{Contract, validate_contract};
use crate::domain::error::DomainError;
use crate::domain::report_run::ReportRunRecord;
use crate::domain::schedule::{RunPayload, normalize_email_targets};
use crate::domain::template::TemplateKind;
use crate::error::NeuraError;
use crate::infrastructure::adapters::DataFusionConnector;
use crate::infrastructure::artifacts::write_artifact_manifest;
use crate::infrastructure::fs::{read_json_opt, write_text_atomic};
use crate::infrastructure::lock::acquire_template_lock;
use crate::ports::connector::AnalyticConnector;
use crate::ports::mailer::{Mailer, OutboundEmail};
use crate::ports::render::{DocxConverter, DocxHints, PageRenderer, PdfOptions, XlsxExporter};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Database path fallback precedence: explicit connection id, then the
/// last-used connection, then the environment default, then the newest
/// connection record.
pub fn resolve_db_path(services: &Services, payload: &RunPayload) -> Result<PathBuf, NeuraError> {
    if let Some(conn_id) = &payload.connection_id
        && let Some(record) = services.state.get_connection_record(conn_id)
        && !record.database_path.is_empty()
    {
        return Ok(PathBuf::from(record.database_path));
    }
    if let Some(conn_id) = services.state.get_last_used().connection_id
        && let Some(record) = services.state.get_connection_record(&conn_id)
        && !record.database_path.is_empty()
    {
        info!(connection_id = %conn_id, "database resolved from last-used connection");
        return Ok(PathBuf::from(record.database_path));
    }
    if let Some(path) = &services.config.default_db_path {
        info!(path = %path.display(), "database resolved from environment default");
        return Ok(path.clone());
    }
    if let Some(record) = services.state.get_latest_connection()
        && !record.database_path.is_empty()
    {
        info!(connection_id = %record.id, "database resolved from newest connection record");
        return Ok(PathBuf::from(record.database_path));
    }
    Err(NeuraError::Domain(DomainError::Validation(
        "no database connection available for this run".to_string(),
    )))
}

fn heuristically_fill_param(name: &str, payload: &RunPayload) -> Option<Value> {
    if let Some(values) = payload.key_values.as_ref()
        && let Some(value) = values.get(name)
    {
        return Some(value.clone());
    }
    // Match on name parts, not substrings: `customer_no` must not hit "to".
    let parts: Vec<String> = name
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    let has = |word: &str| parts.iter().any(|p| p == word);
    if has("batch") {
        return payload
            .batch_ids
            .as_ref()
            .and_then(|ids| ids.first())
            .map(|id| Value::String(id.clone()));
    }
    if has("from") || has("start") || has("begin") {
        return Some(Value::String(payload.start_date.clone()));
    }
    if has("to") || has("end") || has("thru") || has("through") {
        return Some(Value::String(payload.end_date.clone()));
    }
    None
}

fn build_params(assets: &GeneratorAssets, payload: &RunPayload) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();
    for name in assets.params.required.iter().chain(assets.params.optional.iter()) {
        if let Some(value) = heuristically_fill_param(name, payload) {
            params.insert(name.clone(), value);
        }
    }
    params
}

struct RunArtifacts {
    html: PathBuf,
    pdf: Option<PathBuf>,
    docx: Option<PathBuf>,
    xlsx: Option<PathBuf>,
}

/// Execute one report run end to end. The tracker carries step transitions
/// and the cooperative cancellation poll.
pub async fn run_report(
    services: &Services,
    payload: &RunPayload,
    kind: TemplateKind,
    correlation_id: Option<&str>,
    tracker: &JobRunTracker,
) -> Result<(serde_json::Map<String, Value>, RunArtifactPaths), NeuraError> {
    tracker.check_cancelled()?;
    let run_started = std::time::Instant::now();
    info!(
        template_id = %payload.template_id,
        correlation_id = correlation_id.unwrap_or(""),
        "report run start"
    );

    tracker.step_running("dataLoad", Some("Load database connection"));
    let db_path = resolve_db_path(services, payload)?;
    if !db_path.exists() {
        let message = format!("DB not found: {}", db_path.display());
        tracker.step_failed("dataLoad", &message);
        return Err(NeuraError::Domain(DomainError::Validation(message)));
    }
    tracker.step_succeeded("dataLoad");
    tracker.check_cancelled()?;

    tracker.step_running("contractCheck", Some("Prepare contract"));
    let tdir = template_dir(&services.config, &payload.template_id, kind, true, false)?;
    let template_html_path = if tdir.join(REPORT_FINAL_HTML).exists() {
        tdir.join(REPORT_FINAL_HTML)
    } else {
        tdir.join(TEMPLATE_HTML)
    };
    if !template_html_path.exists() {
        let message = "No template HTML found (report_final.html or template_p1.html).".to_string();
        tracker.step_failed("contractCheck", &message);
        return Err(NeuraError::Domain(DomainError::Validation(message)));
    }
    let contract: Contract = match read_json_opt(&tdir.join(CONTRACT_JSON)) {
        Ok(Some(contract)) => contract,
        Ok(None) => {
            let message =
                "Missing contract.json. Finish template approval/mapping first.".to_string();
            tracker.step_failed("contractCheck", &message);
            return Err(NeuraError::Domain(DomainError::ContractValidation(message)));
        }
        Err(err) => {
            tracker.step_failed("contractCheck", &err.to_string());
            return Err(NeuraError::Domain(DomainError::ContractValidation(format!(
                "Invalid contract.json: {err}"
            ))));
        }
    };
    let assets: GeneratorAssets = match read_json_opt(&tdir.join(GENERATOR_ASSETS_JSON)) {
        Ok(Some(assets)) => assets,
        Ok(None) => {
            let message =
                "Missing generator assets. Run the generator stage before reports.".to_string();
            tracker.step_failed("contractCheck", &message);
            return Err(NeuraError::Domain(DomainError::ContractValidation(message)));
        }
        Err(err) => {
            tracker.step_failed("contractCheck", &err.to_string());
            return Err(NeuraError::Domain(DomainError::ContractValidation(format!(
                "Invalid generator assets: {err}"
            ))));
        }
    };

    // Contract re-validated at this load boundary against the live catalog.
    let connection_key = payload.connection_id.as_deref().unwrap_or("default");
    let db_schema = services
        .schema_cache
        .get_or_introspect(connection_key, &db_path, false)?;
    let catalog = db_schema.catalog().into_iter().collect();
    if let Err(err) = validate_contract(&contract, &catalog) {
        tracker.step_failed("contractCheck", &err.to_string());
        return Err(err.into());
    }
    tracker.step_succeeded("contractCheck");
    tracker.check_cancelled()?;

    let _lock = acquire_template_lock(&tdir, "reports_run", correlation_id)?;

    tracker.step_running("renderPdf", Some("Render PDF artifacts"));
    let data = load_report_data(services, &assets, payload, &db_path, tracker).await?;

    let run_ctx = RunContext {
        start_date: payload.start_date.clone(),
        end_date: payload.end_date.clone(),
        key_values: payload.key_values.clone().unwrap_or_default().into_iter().collect(),
    };
    let template_html = std::fs::read_to_string(&template_html_path)?;
    let filled_html = render_report_html(&template_html, &contract, &data, &run_ctx)?;

    let ts = chrono::Utc::now().timestamp();
    let out_html = tdir.join(format!("filled_{ts}.html"));
    write_text_atomic(&out_html, &filled_html).map_err(NeuraError::Infrastructure)?;

    let docx_enabled = payload.docx || kind == TemplateKind::Excel;
    let xlsx_enabled = payload.xlsx || kind == TemplateKind::Excel;
    let artifacts = render_binaries(
        services,
        &tdir,
        &out_html,
        ts,
        kind,
        docx_enabled,
        xlsx_enabled,
        tracker,
    )
    .await?;
    tracker.check_cancelled()?;

    if tracker.has_step("finalize") {
        tracker.step_running("finalize", Some("Finalize artifacts"));
    }
    let mut files = BTreeMap::new();
    files.insert("html".to_string(), artifacts.html.clone());
    if let Some(pdf) = &artifacts.pdf {
        files.insert("pdf".to_string(), pdf.clone());
    }
    if let Some(docx) = &artifacts.docx {
        files.insert("docx".to_string(), docx.clone());
    }
    if let Some(xlsx) = &artifacts.xlsx {
        files.insert("xlsx".to_string(), xlsx.clone());
    }
    write_artifact_manifest(
        &tdir,
        "reports_run",
        &files,
        &[CONTRACT_JSON.to_string(), db_path.display().to_string()],
        correlation_id,
    )?;
    if tracker.has_step("finalize") {
        tracker.step_succeeded("finalize");
    }
    drop(_lock);

    services
        .state
        .record_template_run(&payload.template_id, payload.connection_id.as_deref())?;
    services
        .state
        .set_last_used(payload.connection_id.as_deref(), Some(&payload.template_id))?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let mut result = serde_json::Map::new();
    result.insert("ok".into(), Value::Bool(true));
    result.insert("run_id".into(), Value::String(run_id.clone()));
    result.insert("template_id".into(), Value::String(payload.template_id.clone()));
    result.insert("start_date".into(), Value::String(payload.start_date.clone()));
    result.insert("end_date".into(), Value::String(payload.end_date.clone()));
    let mut url_map = BTreeMap::new();
    for (key, path) in [
        ("html_url", Some(&artifacts.html)),
        ("pdf_url", artifacts.pdf.as_ref()),
        ("docx_url", artifacts.docx.as_ref()),
        ("xlsx_url", artifacts.xlsx.as_ref()),
    ] {
        let url = path.and_then(|p| artifact_url(&services.config, p));
        if let Some(url) = &url {
            url_map.insert(key.trim_end_matches("_url").to_string(), url.clone());
        }
        result.insert(key.into(), url.map(Value::String).unwrap_or(Value::Null));
    }
    if let Some(cid) = correlation_id {
        result.insert("correlation_id".into(), Value::String(cid.to_string()));
    }

    let template_record = services.state.get_template_record(&payload.template_id);
    let connection_record = payload
        .connection_id
        .as_deref()
        .and_then(|id| services.state.get_connection_record(id));
    services.state.record_report_run(ReportRunRecord {
        id: run_id,
        template_id: payload.template_id.clone(),
        template_name: template_record
            .map(|t| t.name)
            .unwrap_or_else(|| payload.template_id.clone()),
        template_kind: kind.as_str().to_string(),
        connection_id: payload.connection_id.clone(),
        connection_name: connection_record.map(|c| c.name),
        start_date: payload.start_date.clone(),
        end_date: payload.end_date.clone(),
        batch_ids: payload.batch_ids.clone().unwrap_or_default(),
        key_values: payload.key_values.clone().unwrap_or_default(),
        status: "succeeded".to_string(),
        artifacts: url_map,
        schedule_id: payload.schedule_id.clone(),
        schedule_name: payload.schedule_name.clone(),
        created_at: chrono::Utc::now(),
    })?;

    info!(
        template_id = %payload.template_id,
        elapsed_ms = run_started.elapsed().as_millis() as u64,
        "report run complete"
    );
    Ok((result, RunArtifactPaths {
        html: Some(artifacts.html),
        pdf: artifacts.pdf,
        docx: artifacts.docx,
        xlsx: artifacts.xlsx,
    }))
}

async fn load_report_data(
    services: &Services,
    assets: &GeneratorAssets,
    payload: &RunPayload,
    db_path: &Path,
    tracker: &JobRunTracker,
) -> Result<ReportData, NeuraError> {
    let connector = DataFusionConnector::new();
    connector.register_sqlite(db_path).await?;
    let params = build_params(assets, payload);
    execute_entrypoints(&connector, assets, &params, || tracker.check_cancelled()).await
}

#[derive(Debug, Clone, Default)]
pub struct RunArtifactPaths {
    pub html: Option<PathBuf>,
    pub pdf: Option<PathBuf>,
    pub docx: Option<PathBuf>,
    pub xlsx: Option<PathBuf>,
}

#[allow(clippy::too_many_arguments)]
async fn render_binaries(
    services: &Services,
    tdir: &Path,
    out_html: &Path,
    ts: i64,
    kind: TemplateKind,
    docx_enabled: bool,
    xlsx_enabled: bool,
    tracker: &JobRunTracker,
) -> Result<RunArtifacts, NeuraError> {
    tracker.check_cancelled()?;
    let out_pdf = tdir.join(format!("filled_{ts}.pdf"));
    let pdf_options = PdfOptions { landscape: kind == TemplateKind::Excel, scale: 1.0 };
    services
        .page_renderer
        .html_to_pdf(out_html, &out_pdf, pdf_options)
        .await
        .map_err(|err| {
            tracker.step_failed("renderPdf", &format!("Report generation failed: {err}"));
            err
        })?;
    tracker.step_succeeded("renderPdf");

    // DOCX and XLSX are best-effort: a failing format is recorded and the
    // run keeps the artifacts that did succeed.
    let mut docx_path = None;
    if docx_enabled {
        tracker.check_cancelled()?;
        tracker.step_running("renderDocx", Some("Render DOCX"));
        let target = tdir.join(format!("filled_{ts}.docx"));
        let hints = DocxHints {
            landscape: kind == TemplateKind::Excel,
            font_scale: if kind == TemplateKind::Excel { Some(0.82) } else { None },
        };
        let converted = match services
            .docx
            .pdf_to_docx(&out_pdf, &target, services.config.pdf2docx_timeout)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "pdf->docx failed, falling back to html->docx");
                services.docx.html_to_docx(out_html, &target, hints).await.is_ok()
            }
        };
        if converted && target.exists() {
            docx_path = Some(target);
            tracker.step_succeeded("renderDocx");
        } else {
            tracker.step_failed("renderDocx", "DOCX export failed");
        }
    }

    let mut xlsx_path = None;
    if xlsx_enabled {
        tracker.check_cancelled()?;
        tracker.step_running("renderXlsx", Some("Render XLSX"));
        let target = tdir.join(format!("filled_{ts}.xlsx"));
        match services.xlsx.html_to_xlsx(out_html, &target).await {
            Ok(()) if target.exists() => {
                xlsx_path = Some(target);
                tracker.step_succeeded("renderXlsx");
            }
            Ok(()) | Err(_) => {
                tracker.step_failed("renderXlsx", "XLSX export failed");
            }
        }
    }

    Ok(RunArtifacts {
        html: out_html.to_path_buf(),
        pdf: Some(out_pdf),
        docx: docx_path,
        xlsx: xlsx_path,
    })
}

async fn maybe_send_email(
    services: &Services,
    payload: &RunPayload,
    artifacts: &RunArtifactPaths,
    tracker: &JobRunTracker,
) -> Result<(), NeuraError> {
    tracker.check_cancelled()?;
    let recipients = normalize_email_targets(payload.email_recipients.clone().unwrap_or_default());
    let email_tracked = tracker.has_step("email");
    if recipients.is_empty() {
        if email_tracked {
            tracker.step_succeeded("email");
        }
        return Ok(());
    }
    if email_tracked {
        tracker.step_running("email", Some("Send notification email"));
    }

    // Attachment preference: PDF, then DOCX, then XLSX, then HTML.
    let attachment = [&artifacts.pdf, &artifacts.docx, &artifacts.xlsx, &artifacts.html]
        .into_iter()
        .flatten()
        .find(|path| path.exists())
        .cloned();
    let Some(attachment) = attachment else {
        if email_tracked {
            tracker.step_failed("email", "No artifact available to attach");
        }
        return Ok(());
    };

    let template_name = services
        .state
        .get_template_record(&payload.template_id)
        .map(|t| t.name)
        .unwrap_or_else(|| payload.template_id.clone());
    let subject = payload
        .email_subject
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("Report run for {template_name}"));
    let body = payload
        .email_message
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| {
            format!(
                "Template: {template_name} ({})\nRange: {} -> {}\n\nThis notification was generated automatically by NeuraReport.",
                payload.template_id, payload.start_date, payload.end_date
            )
        });

    let sent = services
        .mailer
        .send(&OutboundEmail {
            recipients: recipients.clone(),
            subject,
            body,
            attachments: vec![attachment],
        })
        .await?;
    if email_tracked {
        if sent {
            tracker.step_succeeded("email");
        } else {
            tracker.step_failed("email", "Email delivery failed");
        }
    }
    info!(recipients = recipients.len(), sent, "report email attempt");
    Ok(())
}

/// The full run including the optional notification, as dispatched by the
/// job engine and the scheduler.
pub async fn run_report_with_email(
    services: &Services,
    payload: &RunPayload,
    kind: TemplateKind,
    correlation_id: Option<&str>,
    tracker: &JobRunTracker,
) -> Result<serde_json::Map<String, Value>, NeuraError> {
    let (result, artifacts) = run_report(services, payload, kind, correlation_id, tracker).await?;
    maybe_send_email(services, payload, &artifacts, tracker).await?;
    Ok(result)
}
