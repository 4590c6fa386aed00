// neura/src/main.rs

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

// Infrastructure (Config & Adapters)
use neura_core::infrastructure::collaborators::{
    HeadlessBrowser, LibreOfficeConverter, PopplerRasterizer,
};
use neura_core::infrastructure::config::AppConfig;
use neura_core::infrastructure::introspect::SchemaCache;
use neura_core::infrastructure::llm::{DisabledChatModel, OpenAiChatModel};
use neura_core::infrastructure::mailer::{DisabledMailer, SmtpMailer};
use neura_core::infrastructure::state::{ConnectionUpsert, JobFilter, ScheduleCreate, StateStore};

// Domain (Enums for the CLI)
use neura_core::domain::job::JobStatus;
use neura_core::domain::schedule::RunPayload;
use neura_core::domain::template::TemplateKind;

// Application (Use Cases)
use neura_core::application::Services;
use neura_core::application::jobs::{JobEngine, JobRunTracker, build_job_steps, recover_report_jobs};
use neura_core::application::orchestrator;
use neura_core::application::pipeline::{
    automap_stage, contract_stage, corrections_stage, generator_stage, verify_stage,
};
use neura_core::application::scheduler::ReportScheduler;
use neura_core::ports::process::ProcessTracker;

#[derive(Parser)]
#[command(name = "neura")]
#[command(about = "Template-driven report generation pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Project directory holding the optional neura.yaml
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 📄 Ingest a reference PDF and build the draft template (stage 1)
    Verify {
        template_id: String,
        /// Path to the uploaded reference PDF
        #[arg(long)]
        pdf: PathBuf,
        #[arg(long, default_value = "pdf")]
        kind: String,
    },

    /// 🧭 Map template tokens to catalog columns (stage 2)
    Map {
        template_id: String,
        #[arg(long)]
        connection_id: String,
        #[arg(long, default_value = "pdf")]
        kind: String,
        /// Ignore the cached mapping and call the model again
        #[arg(long)]
        force_refresh: bool,
    },

    /// ✏️ Apply operator corrections to the mapped template (stage 3)
    Corrections {
        template_id: String,
        /// Free-form correction instructions
        #[arg(long, default_value = "")]
        instructions: String,
        #[arg(long, default_value = "pdf")]
        kind: String,
        #[arg(long)]
        force_refresh: bool,
    },

    /// 📜 Build the token -> SQL contract (stage 4)
    Contract {
        template_id: String,
        #[arg(long)]
        connection_id: String,
        #[arg(long, default_value = "pdf")]
        kind: String,
        #[arg(long, default_value = "sqlite")]
        dialect: String,
        /// Tokens the operator keys the report on (repeatable)
        #[arg(long = "key-token")]
        key_tokens: Vec<String>,
        #[arg(long, default_value = "")]
        instructions: String,
    },

    /// ⚙️ Emit the SQL pack and output schemas (stage 5)
    Generate {
        template_id: String,
        #[arg(long)]
        connection_id: String,
        #[arg(long, default_value = "pdf")]
        kind: String,
        #[arg(long, default_value = "sqlite")]
        dialect: String,
    },

    /// 🚀 Run a report once, in-process
    Run {
        template_id: String,
        #[arg(long)]
        connection_id: Option<String>,
        #[arg(long)]
        start_date: String,
        #[arg(long)]
        end_date: String,
        #[arg(long)]
        docx: bool,
        #[arg(long)]
        xlsx: bool,
        #[arg(long, default_value = "pdf")]
        kind: String,
        /// Notification recipients (repeatable)
        #[arg(long = "email")]
        email: Vec<String>,
    },

    /// 🔁 Start the worker pool + scheduler and serve queued jobs
    Worker {},

    /// 🗂  Inspect or cancel jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },

    /// ⏰ Manage report schedules
    Schedules {
        #[command(subcommand)]
        command: SchedulesCommands,
    },

    /// 🗃  Manage templates
    Templates {
        #[command(subcommand)]
        command: TemplatesCommands,
    },

    /// 🔌 Register a database connection
    Connect {
        name: String,
        #[arg(long)]
        db_path: PathBuf,
    },
}

#[derive(Subcommand)]
enum JobsCommands {
    /// List recent jobs (newest first)
    List {
        #[arg(long)]
        active_only: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Cancel a queued or running job
    Cancel {
        job_id: String,
        /// Also terminate tracked child processes
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum TemplatesCommands {
    List,
    /// Delete a template's directory and state record
    Delete {
        template_id: String,
        #[arg(long, default_value = "pdf")]
        kind: String,
    },
}

#[derive(Subcommand)]
enum SchedulesCommands {
    List,
    Create {
        template_id: String,
        #[arg(long)]
        connection_id: Option<String>,
        /// UTC window start (RFC 3339)
        #[arg(long)]
        start_date: String,
        /// UTC window end (RFC 3339)
        #[arg(long)]
        end_date: String,
        #[arg(long, default_value_t = 1440)]
        interval_minutes: i64,
        #[arg(long, default_value = "daily")]
        frequency: String,
        #[arg(long)]
        docx: bool,
        #[arg(long)]
        xlsx: bool,
        #[arg(long = "email")]
        email: Vec<String>,
    },
    Delete {
        schedule_id: String,
    },
    Pause {
        schedule_id: String,
    },
    Resume {
        schedule_id: String,
    },
}

fn build_services(project_dir: &PathBuf) -> anyhow::Result<(Services, Arc<ProcessTracker>)> {
    let config = Arc::new(AppConfig::load(project_dir)?);
    let state = Arc::new(StateStore::open(&config.state_dir)?);
    let processes = Arc::new(ProcessTracker::default());

    let chat: Arc<dyn neura_core::ports::llm::ChatModel> = match &config.openai_api_key {
        Some(key) => Arc::new(OpenAiChatModel::new(key.clone(), config.openai_model.clone())),
        None if config.allow_missing_openai => Arc::new(DisabledChatModel),
        None => anyhow::bail!(
            "OPENAI_API_KEY is not set (set NEURA_ALLOW_MISSING_OPENAI=1 to run without the LLM)"
        ),
    };

    let browser_bin =
        std::env::var("NEURA_BROWSER_BIN").unwrap_or_else(|_| "chromium".to_string());
    let soffice_bin = std::env::var("NEURA_SOFFICE_BIN").unwrap_or_else(|_| "soffice".to_string());
    let browser = Arc::new(HeadlessBrowser::new(browser_bin, processes.clone()));
    let office = Arc::new(LibreOfficeConverter::new(soffice_bin, processes.clone()));

    let mailer: Arc<dyn neura_core::ports::mailer::Mailer> = match config.smtp.clone() {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp)),
        None => Arc::new(DisabledMailer),
    };

    let schema_cache = Arc::new(SchemaCache::new(
        config.schema_cache_ttl,
        config.schema_cache_max_entries,
    ));

    let services = Services {
        config,
        state,
        chat,
        page_renderer: browser,
        rasterizer: Arc::new(PopplerRasterizer::new(processes.clone())),
        docx: office.clone(),
        xlsx: office,
        mailer,
        schema_cache,
    };
    Ok((services, processes))
}

fn parse_kind(raw: &str) -> anyhow::Result<TemplateKind> {
    raw.parse::<TemplateKind>().map_err(|e| anyhow::anyhow!("{e}"))
}

fn parse_utc(raw: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    if let Ok(value) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(value.with_timezone(&chrono::Utc));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow::anyhow!("invalid date: {raw}"))?;
        return Ok(chrono::Utc.from_utc_datetime(&midnight));
    }
    anyhow::bail!("could not parse '{raw}' as RFC 3339 or YYYY-MM-DD")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG=debug neura run ... for the details
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let (services, processes) = build_services(&cli.project_dir)?;

    match cli.command {
        Commands::Verify { template_id, pdf, kind } => {
            let kind = parse_kind(&kind)?;
            let bytes = std::fs::read(&pdf)?;
            println!("📄 Verifying template '{template_id}' from {}...", pdf.display());
            let outcome = verify_stage(&services, &template_id, kind, &bytes, None).await?;
            println!(
                "✨ Draft ready: SSIM={:.4} after {} fix pass(es)",
                outcome.ssim, outcome.fix_passes
            );
        }

        Commands::Map { template_id, connection_id, kind, force_refresh } => {
            let kind = parse_kind(&kind)?;
            println!("🧭 Auto-mapping '{template_id}' against connection {connection_id}...");
            let outcome =
                automap_stage(&services, &template_id, &connection_id, kind, None, force_refresh)
                    .await?;
            println!(
                "✨ Mapped {} tokens ({} constants inlined){}",
                outcome.mapping.len(),
                outcome.constant_replacements.len(),
                if outcome.cached { " [cached]" } else { "" }
            );
        }

        Commands::Corrections { template_id, instructions, kind, force_refresh } => {
            let kind = parse_kind(&kind)?;
            let outcome = corrections_stage(
                &services,
                &template_id,
                kind,
                &instructions,
                None,
                force_refresh,
            )
            .await?;
            println!(
                "✨ Corrections applied{}\n{}",
                if outcome.cached { " [cached]" } else { "" },
                outcome.page_summary
            );
        }

        Commands::Contract {
            template_id,
            connection_id,
            kind,
            dialect,
            key_tokens,
            instructions,
        } => {
            let kind = parse_kind(&kind)?;
            let outcome = contract_stage(
                &services,
                &template_id,
                &connection_id,
                kind,
                &dialect,
                &key_tokens,
                &instructions,
                None,
                None,
            )
            .await?;
            println!(
                "✨ Contract built: {} bindings, {} key token(s)",
                outcome.contract.mapping.len(),
                outcome.key_tokens.len()
            );
        }

        Commands::Generate { template_id, connection_id, kind, dialect } => {
            let kind = parse_kind(&kind)?;
            let assets =
                generator_stage(&services, &template_id, &connection_id, kind, &dialect, None)
                    .await?;
            println!(
                "✨ SQL pack ready ({} dialect): {} required / {} optional params",
                assets.dialect,
                assets.params.required.len(),
                assets.params.optional.len()
            );
        }

        Commands::Run {
            template_id,
            connection_id,
            start_date,
            end_date,
            docx,
            xlsx,
            kind,
            email,
        } => {
            let kind = parse_kind(&kind)?;
            let payload = RunPayload {
                template_id,
                connection_id,
                start_date,
                end_date,
                batch_ids: None,
                key_values: None,
                docx,
                xlsx,
                email_recipients: if email.is_empty() { None } else { Some(email) },
                email_subject: None,
                email_message: None,
                schedule_id: None,
                schedule_name: None,
            };
            let steps = build_job_steps(&payload, kind);
            let tracker =
                JobRunTracker::new(services.state.clone(), String::new(), None, &steps);
            let result =
                orchestrator::run_report_with_email(&services, &payload, kind, None, &tracker)
                    .await?;
            println!("✨ Report complete:\n{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Worker {} => {
            let engine = JobEngine::start(services.clone(), processes);
            let recovered = recover_report_jobs(&services, &engine, 50)?;
            if recovered > 0 {
                println!("♻️  Recovered {recovered} interrupted job(s)");
            }
            let scheduler = Arc::new(ReportScheduler::new(services.clone(), engine));
            println!("🟢 Worker pool and scheduler running. Ctrl-C to stop.");
            tokio::select! {
                _ = scheduler.run() => {},
                _ = tokio::signal::ctrl_c() => {
                    println!("👋 Shutting down");
                }
            }
        }

        Commands::Jobs { command } => match command {
            JobsCommands::List { active_only, limit } => {
                let jobs = services.state.list_jobs(&JobFilter {
                    statuses: vec![],
                    types: vec![],
                    limit,
                    active_only,
                });
                for job in jobs {
                    println!(
                        "{}  {:<10} {:>5.1}%  {}  {}",
                        job.id,
                        job.status.as_str(),
                        job.progress,
                        job.template_id.as_deref().unwrap_or("-"),
                        job.error.as_deref().unwrap_or("")
                    );
                }
            }
            JobsCommands::Cancel { job_id, force } => {
                // Without a live engine the store transition still applies;
                // the worker observes it at its next poll.
                let job = services
                    .state
                    .get_job(&job_id)
                    .ok_or_else(|| anyhow::anyhow!("job not found: {job_id}"))?;
                if job.status.is_terminal() {
                    println!("Job {job_id} already {}", job.status.as_str());
                } else {
                    services.state.record_job_completion(
                        &job_id,
                        JobStatus::Cancelled,
                        Some(if force { "Force-cancelled by user" } else { "Cancelled by user" }),
                        None,
                    )?;
                    println!("🛑 Job {job_id} cancelled");
                }
            }
        },

        Commands::Schedules { command } => match command {
            SchedulesCommands::List => {
                for schedule in services.state.list_schedules() {
                    println!(
                        "{}  {:<20} every {:>5}m  active={}  next={}",
                        schedule.id,
                        schedule.name,
                        schedule.interval_minutes,
                        schedule.active,
                        schedule
                            .next_run_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".into())
                    );
                }
            }
            SchedulesCommands::Create {
                template_id,
                connection_id,
                start_date,
                end_date,
                interval_minutes,
                frequency,
                docx,
                xlsx,
                email,
            } => {
                let template = services
                    .state
                    .get_template_record(&template_id)
                    .ok_or_else(|| anyhow::anyhow!("template not found: {template_id}"))?;
                let start = parse_utc(&start_date)?;
                let end = parse_utc(&end_date)?;
                let schedule = services.state.create_schedule(ScheduleCreate {
                    name: None,
                    template_id,
                    template_name: template.name,
                    template_kind: template.kind.as_str().to_string(),
                    connection_id,
                    connection_name: None,
                    start_date: start,
                    end_date: end,
                    key_values: Default::default(),
                    batch_ids: vec![],
                    docx,
                    xlsx,
                    email_recipients: email,
                    email_subject: None,
                    email_message: None,
                    frequency,
                    interval_minutes,
                    next_run_at: Some(start),
                    first_run_at: Some(start),
                    active: true,
                });
                println!("⏰ Schedule created: {}", schedule?.id);
            }
            SchedulesCommands::Delete { schedule_id } => {
                if services.state.delete_schedule(&schedule_id)? {
                    println!("🗑  Schedule {schedule_id} deleted");
                } else {
                    println!("Schedule {schedule_id} not found");
                }
            }
            SchedulesCommands::Pause { schedule_id } => {
                services.state.set_schedule_active(&schedule_id, false)?;
                println!("⏸  Schedule {schedule_id} paused");
            }
            SchedulesCommands::Resume { schedule_id } => {
                services.state.set_schedule_active(&schedule_id, true)?;
                println!("▶️  Schedule {schedule_id} resumed");
            }
        },

        Commands::Templates { command } => match command {
            TemplatesCommands::List => {
                for template in services.state.list_templates() {
                    println!(
                        "{}  {:<30} {:<6} {}",
                        template.id,
                        template.name,
                        template.kind.as_str(),
                        template.status.as_str()
                    );
                }
            }
            TemplatesCommands::Delete { template_id, kind } => {
                let kind = parse_kind(&kind)?;
                if neura_core::application::templates::delete_template(
                    &services.config,
                    &services.state,
                    &template_id,
                    kind,
                    None,
                )? {
                    println!("🗑  Template {template_id} deleted");
                } else {
                    println!("Template {template_id} not found");
                }
            }
        },

        Commands::Connect { name, db_path } => {
            let started = std::time::Instant::now();
            let db_path = db_path.canonicalize()?;
            // A quick introspection doubles as the connection test.
            let schema = neura_core::infrastructure::introspect::introspect_sqlite(&db_path, false)?;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            let view = services.state.upsert_connection(ConnectionUpsert {
                conn_id: None,
                name: name.clone(),
                db_type: "sqlite".into(),
                database_path: db_path.display().to_string(),
                secret_payload: Some(serde_json::json!({
                    "url": format!("sqlite:///{}", db_path.display()),
                })),
                status: Some("ok".into()),
                latency_ms: Some(latency_ms),
                tags: vec![],
            })?;
            println!(
                "🔌 Connection '{name}' registered ({} tables, {:.1} ms): {}",
                schema.tables.len(),
                latency_ms,
                view.id
            );
        }
    }

    Ok(())
}
