// neura-core/src/application/templates.rs

// Template directory resolution and artifact URL mapping. Every caller goes
// through here so the path-traversal defense has a single owner.

use crate::domain::error::DomainError;
use crate::domain::template::{TemplateKind, normalize_template_id};
use crate::error::NeuraError;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::fs::resolve_under_root;
use std::path::{Path, PathBuf};

// Canonical artifact names inside a template directory.
pub const SOURCE_PDF: &str = "source.pdf";
pub const REFERENCE_PNG: &str = "reference_p1.png";
pub const TEMPLATE_HTML: &str = "template_p1.html";
pub const RENDER_PNG: &str = "render_p1.png";
pub const SCHEMA_EXT_JSON: &str = "schema_ext.json";
pub const MAPPING_STEP3_JSON: &str = "mapping_step3.json";
pub const MAPPING_PDF_LABELS_JSON: &str = "mapping_pdf_labels.json";
pub const MAPPING_KEYS_JSON: &str = "mapping_keys.json";
pub const CONSTANT_REPLACEMENTS_JSON: &str = "constant_replacements.json";
pub const CONTRACT_JSON: &str = "contract.json";
pub const OVERVIEW_MD: &str = "overview.md";
pub const STEP5_REQUIREMENTS_JSON: &str = "step5_requirements.json";
pub const PAGE_SUMMARY_TXT: &str = "page_summary.txt";
pub const STAGE_3_5_JSON: &str = "stage_3_5.json";
pub const REPORT_FINAL_HTML: &str = "report_final.html";
pub const GENERATOR_DIR: &str = "generator";
pub const GENERATOR_ASSETS_JSON: &str = "generator/generator_assets.json";
pub const OUTPUT_SCHEMAS_JSON: &str = "generator/output_schemas.json";
pub const SQL_PACK_SQL: &str = "generator/sql_pack.sql";

/// Resolve `<uploads-root>/<kind>/<template_id>`, normalizing the id and
/// refusing anything that escapes the uploads root.
pub fn template_dir(
    config: &AppConfig,
    template_id: &str,
    kind: TemplateKind,
    must_exist: bool,
    create: bool,
) -> Result<PathBuf, NeuraError> {
    let tid = normalize_template_id(template_id)?;
    let base = config.upload_root_for(kind);
    let dir = resolve_under_root(&config.upload_root, &base.join(&tid))?;
    if must_exist && !dir.exists() {
        return Err(NeuraError::Domain(DomainError::NotFound {
            entity: "template",
            id: tid,
        }));
    }
    if create {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Delete a template atomically: the directory is removed under the
/// template lock, then the state record (with its saved charts and the
/// last-used pointer half) goes in one store write.
pub fn delete_template(
    config: &AppConfig,
    state: &crate::infrastructure::state::StateStore,
    template_id: &str,
    kind: TemplateKind,
    correlation_id: Option<&str>,
) -> Result<bool, NeuraError> {
    let tdir = template_dir(config, template_id, kind, false, false)?;
    if tdir.exists() {
        let lock = crate::infrastructure::lock::acquire_template_lock(
            &tdir,
            "template_delete",
            correlation_id,
        )?;
        std::fs::remove_dir_all(&tdir)?;
        drop(lock);
    }
    state.delete_template(template_id)
}

/// Map an artifact path under the uploads root to its served URL
/// (`/uploads/<kind>/<id>/<file>`); paths outside the root yield None.
pub fn artifact_url(config: &AppConfig, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(&config.upload_root).ok()?;
    let mut url = String::from("/uploads");
    for component in relative.components() {
        url.push('/');
        url.push_str(&component.as_os_str().to_string_lossy());
    }
    Some(url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::infrastructure::config::AppConfig;

    fn config(root: &Path) -> AppConfig {
        let mut config = AppConfig::from_env();
        config.upload_root = root.to_path_buf();
        config
    }

    #[test]
    fn test_template_dir_created_under_kind() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let tdir = template_dir(&config, "monthly-report", TemplateKind::Pdf, false, true).unwrap();
        assert!(tdir.ends_with("pdf/monthly-report"));
        assert!(tdir.exists());
    }

    #[test]
    fn test_template_dir_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert!(template_dir(&config, "../../etc", TemplateKind::Pdf, false, false).is_err());
    }

    #[test]
    fn test_template_dir_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let err = template_dir(&config, "ghost-template", TemplateKind::Pdf, true, false).unwrap_err();
        assert!(matches!(err, NeuraError::Domain(DomainError::NotFound { .. })));
    }

    #[test]
    fn test_delete_template_removes_dir_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let state =
            crate::infrastructure::state::StateStore::open(&dir.path().join("state")).unwrap();
        state
            .upsert_template("doomed-template", crate::infrastructure::state::TemplateUpsert {
                name: "Doomed".into(),
                ..Default::default()
            })
            .unwrap();
        let tdir = template_dir(&config, "doomed-template", TemplateKind::Pdf, false, true).unwrap();
        std::fs::write(tdir.join("contract.json"), b"{}").unwrap();

        assert!(delete_template(&config, &state, "doomed-template", TemplateKind::Pdf, None).unwrap());
        assert!(!tdir.exists());
        assert!(state.get_template_record("doomed-template").is_none());

        // Deleting again reports absence.
        assert!(!delete_template(&config, &state, "doomed-template", TemplateKind::Pdf, None).unwrap());
    }

    #[test]
    fn test_artifact_url_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let tdir = template_dir(&config, "monthly-report", TemplateKind::Excel, false, true).unwrap();
        let url = artifact_url(&config, &tdir.join("filled_17.pdf")).unwrap();
        assert_eq!(url, "/uploads/excel/monthly-report/filled_17.pdf");
        assert!(artifact_url(&config, Path::new("/etc/passwd")).is_none());
    }
}
