// neura-core/src/infrastructure/config.rs

// Layered configuration: optional `neura.yaml` in the project directory as
// the base, environment variables on top. Env always wins.

use crate::infrastructure::error::InfrastructureError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const CONFIG_CANDIDATES: [&str; 2] = ["neura.yaml", "neura_project_conf.yaml"];

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub upload_root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub openai_model: Option<String>,
    pub job_max_workers: Option<usize>,
    pub scheduler_poll_seconds: Option<u64>,
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_from")]
    pub from: String,
}

fn default_from() -> String {
    "reports@neurareport.local".to_string()
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub upload_root: PathBuf,
    pub state_dir: PathBuf,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub allow_missing_openai: bool,
    pub job_max_workers: usize,
    pub max_verify_pdf_bytes: Option<u64>,
    pub pdf_dpi: u32,
    pub max_fix_passes: u32,
    pub verify_fix_html_enabled: bool,
    pub photocopy_target_ssim: f64,
    pub photocopy_fix_accept_patch_only: bool,
    pub pdf2docx_timeout: Duration,
    pub schema_cache_ttl: Duration,
    pub schema_cache_max_entries: usize,
    pub default_db_path: Option<PathBuf>,
    pub scheduler_poll_seconds: u64,
    pub smtp: Option<SmtpConfig>,
}

impl AppConfig {
    /// Load `neura.yaml` (when present) then apply environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self, InfrastructureError> {
        let file = load_file_config(project_dir)?;
        Ok(Self::from_parts(file))
    }

    /// Environment-only configuration (no project file).
    pub fn from_env() -> Self {
        Self::from_parts(FileConfig::default())
    }

    fn from_parts(file: FileConfig) -> Self {
        let upload_root = env_path("UPLOAD_ROOT")
            .or(file.upload_root)
            .unwrap_or_else(|| PathBuf::from("uploads"));
        let state_dir = env_path("NEURA_STATE_DIR")
            .or(file.state_dir)
            .unwrap_or_else(|| PathBuf::from("state"));
        let default_workers = num_cpus::get();
        AppConfig {
            upload_root,
            state_dir,
            openai_api_key: env_string("OPENAI_API_KEY"),
            openai_model: env_string("OPENAI_MODEL")
                .or(file.openai_model)
                .unwrap_or_else(|| "gpt-5".to_string()),
            allow_missing_openai: env_flag("NEURA_ALLOW_MISSING_OPENAI"),
            job_max_workers: env_parse("NEURA_JOB_MAX_WORKERS")
                .or(file.job_max_workers)
                .unwrap_or(default_workers)
                .max(1),
            max_verify_pdf_bytes: env_parse("NEURA_MAX_VERIFY_PDF_BYTES"),
            pdf_dpi: env_parse("PDF_DPI").unwrap_or(400),
            max_fix_passes: env_parse("MAX_FIX_PASSES").unwrap_or(1),
            verify_fix_html_enabled: env_string("VERIFY_FIX_HTML_ENABLED")
                .map(|v| v != "0")
                .unwrap_or(true),
            photocopy_target_ssim: env_parse("PHOTOCOPY_TARGET_SSIM").unwrap_or(0.985),
            photocopy_fix_accept_patch_only: env_flag("PHOTOCOPY_FIX_ACCEPT_PATCH_ONLY"),
            pdf2docx_timeout: Duration::from_secs(env_parse("NEURA_PDF2DOCX_TIMEOUT").unwrap_or(120)),
            schema_cache_ttl: Duration::from_secs(env_parse("NR_SCHEMA_CACHE_TTL_SECONDS").unwrap_or(30)),
            schema_cache_max_entries: env_parse::<usize>("NR_SCHEMA_CACHE_MAX_ENTRIES")
                .unwrap_or(32)
                .max(5),
            default_db_path: env_path("NR_DEFAULT_DB").or_else(|| env_path("DB_PATH")),
            scheduler_poll_seconds: env_parse("NEURA_SCHEDULER_POLL_SECONDS")
                .or(file.scheduler_poll_seconds)
                .unwrap_or(60)
                .max(5),
            smtp: file.smtp,
        }
    }

    /// Uploads base directory for one template kind.
    pub fn upload_root_for(&self, kind: crate::domain::TemplateKind) -> PathBuf {
        self.upload_root.join(kind.as_str())
    }
}

fn load_file_config(project_dir: &Path) -> Result<FileConfig, InfrastructureError> {
    for candidate in CONFIG_CANDIDATES {
        let path = project_dir.join(candidate);
        if path.exists() {
            info!(path = ?path, "Loading project configuration");
            let content = std::fs::read_to_string(&path)?;
            return Ok(serde_yaml::from_str(&content)?);
        }
    }
    Ok(FileConfig::default())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_flag(name: &str) -> bool {
    matches!(env_string(name).as_deref(), Some("1") | Some("true") | Some("yes"))
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_string(name).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file_or_env() {
        let config = AppConfig::from_parts(FileConfig::default());
        assert_eq!(config.pdf_dpi, 400);
        assert_eq!(config.max_fix_passes, 1);
        assert!(config.job_max_workers >= 1);
        assert_eq!(config.pdf2docx_timeout, Duration::from_secs(120));
        assert_eq!(config.schema_cache_max_entries, 32);
        assert!(config.scheduler_poll_seconds >= 5);
    }

    #[test]
    fn test_file_config_feeds_defaults() {
        let file: FileConfig = serde_yaml::from_str(
            "upload_root: /srv/uploads\njob_max_workers: 3\nscheduler_poll_seconds: 2\n",
        )
        .unwrap();
        let config = AppConfig::from_parts(file);
        assert_eq!(config.upload_root, PathBuf::from("/srv/uploads"));
        assert_eq!(config.job_max_workers, 3);
        // Poll floor is 5 seconds.
        assert_eq!(config.scheduler_poll_seconds, 5);
    }

    #[test]
    fn test_upload_root_per_kind() {
        let mut config = AppConfig::from_parts(FileConfig::default());
        config.upload_root = PathBuf::from("/srv/uploads");
        assert_eq!(
            config.upload_root_for(crate::domain::TemplateKind::Excel),
            PathBuf::from("/srv/uploads/excel")
        );
    }
}
