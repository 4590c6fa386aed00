// neura-core/src/application/pipeline/corrections.rs

// Stage 3 — Corrections. Free-form operator instructions are applied by the
// LLM, but the template's structure is frozen: repeat markers, <tbody>
// counts, per-tbody row prototypes and data-region attributes must survive
// unchanged, and no sample literal may leak into the final HTML.

use crate::application::Services;
use crate::application::pipeline::cache::{CorrectionsKeyInputs, corrections_cache_key, text_sha256};
use crate::application::pipeline::prompts::{self, PROMPT_VERSION_CORRECTIONS};
use crate::application::templates::{
    MAPPING_STEP3_JSON, PAGE_SUMMARY_TXT, REPORT_FINAL_HTML, SCHEMA_EXT_JSON, STAGE_3_5_JSON,
    TEMPLATE_HTML, artifact_url, template_dir,
};
use crate::domain::error::DomainError;
use crate::domain::template::{TemplateKind, TemplateStatus};
use crate::domain::tokens;
use crate::error::NeuraError;
use crate::infrastructure::artifacts::write_artifact_manifest;
use crate::infrastructure::fs::{read_json_opt, write_json_atomic, write_text_atomic};
use crate::infrastructure::llm::openai::strip_code_fences;
use crate::infrastructure::lock::acquire_template_lock;
use crate::infrastructure::state::TemplateUpsert;
use crate::ports::llm::{ChatModel, ChatRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

pub const CORRECTIONS_MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectionsOutcome {
    pub final_template_html: String,
    pub page_summary: String,
    pub cache_key: String,
    pub cached: bool,
}

#[derive(Debug, Deserialize)]
struct CorrectionsPayload {
    final_template_html: String,
    page_summary: String,
}

fn validation_error(message: impl Into<String>) -> NeuraError {
    NeuraError::Domain(DomainError::CorrectionsValidation(message.into()))
}

/// DOM invariants between the pre- and post-corrections HTML.
pub fn ensure_dom_invariants(
    original_html: &str,
    final_html: &str,
    sample_values: &BTreeMap<String, String>,
) -> Result<(), NeuraError> {
    if tokens::count_repeat_markers(original_html) != tokens::count_repeat_markers(final_html) {
        return Err(validation_error(
            "Repeat marker count changed between original and final HTML.",
        ));
    }
    if tokens::count_tbody(original_html) != tokens::count_tbody(final_html) {
        return Err(validation_error(
            "<tbody> element count changed between original and final HTML.",
        ));
    }
    if tokens::tbody_row_signature(original_html) != tokens::tbody_row_signature(final_html) {
        return Err(validation_error(
            "Row prototype count per <tbody> changed between original and final HTML.",
        ));
    }
    let original_regions = tokens::data_regions(original_html);
    let final_regions = tokens::data_regions(final_html);
    if original_regions != final_regions {
        return Err(validation_error(format!(
            "data-region attributes changed. Expected {original_regions:?}, got {final_regions:?}"
        )));
    }
    for (token, sample) in sample_values {
        let sample_text = sample.trim();
        if sample_text.is_empty() || sample_text == "NOT_VISIBLE" || sample_text == "UNREADABLE" {
            continue;
        }
        if final_html.contains(sample_text) && !original_html.contains(sample_text) {
            return Err(validation_error(format!(
                "Sample value for '{token}' leaked into the final HTML as a literal."
            )));
        }
    }

    // Tokens may only shrink; corrections never invent placeholders.
    let original_tokens = tokens::extract_tokens(original_html);
    let final_tokens = tokens::extract_tokens(final_html);
    let added: Vec<&String> = final_tokens.difference(&original_tokens).collect();
    if !added.is_empty() {
        return Err(validation_error(format!("New tokens introduced: {added:?}")));
    }
    Ok(())
}

/// LLM loop with validator feedback (2 attempts).
pub async fn run_corrections_llm(
    chat: &dyn ChatModel,
    template_html: &str,
    mapping: &serde_json::Value,
    schema: Option<&serde_json::Value>,
    sample_values: &BTreeMap<String, String>,
    user_input: &str,
    png_data_uri: Option<&str>,
    cache_key: &str,
) -> Result<CorrectionsOutcome, NeuraError> {
    let prompt = prompts::corrections_prompt(template_html, mapping, schema, user_input)?;

    let mut feedback: Option<String> = None;
    let mut last_error: Option<NeuraError> = None;

    for attempt in 1..=CORRECTIONS_MAX_ATTEMPTS {
        let mut request = ChatRequest::new(PROMPT_VERSION_CORRECTIONS)
            .with_system(prompt.system.clone())
            .with_text(prompt.user.clone())
            .json_object();
        if let Some(uri) = png_data_uri {
            request = request.with_image(uri.to_string());
        }
        if let Some(message) = &feedback {
            request = request.with_text(format!(
                "VALIDATION_FEEDBACK:\n{message}\nPlease correct the issues above and resend a compliant JSON response."
            ));
        }

        info!(attempt, cache_key, "corrections call start");
        let raw = chat.complete(&request).await?;
        let body = strip_code_fences(&raw);
        let payload: CorrectionsPayload = match serde_json::from_str(&body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(attempt, error = %err, "corrections JSON parse failed");
                let message = format!("Invalid JSON response: {err}");
                feedback = Some(message.clone());
                last_error = Some(validation_error(message));
                continue;
            }
        };

        let outcome = (|| -> Result<CorrectionsOutcome, NeuraError> {
            if payload.page_summary.trim().is_empty() {
                return Err(validation_error("page_summary must be non-empty prose."));
            }
            ensure_dom_invariants(template_html, &payload.final_template_html, sample_values)?;
            Ok(CorrectionsOutcome {
                final_template_html: payload.final_template_html,
                page_summary: payload.page_summary,
                cache_key: cache_key.to_string(),
                cached: false,
            })
        })();

        match outcome {
            Ok(outcome) => {
                info!(attempt, cache_key, "corrections call success");
                return Ok(outcome);
            }
            Err(err) => {
                warn!(attempt, error = %err, "corrections validation failed");
                feedback = Some(err.to_string());
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| validation_error("corrections exhausted attempts")))
}

#[derive(Debug, Serialize, Deserialize)]
struct StageArtifact {
    cache_key: String,
    prompt_version: String,
    page_summary: String,
}

fn load_cached(tdir: &Path, key: &str) -> Result<Option<CorrectionsOutcome>, NeuraError> {
    let artifact: Option<StageArtifact> =
        read_json_opt(&tdir.join(STAGE_3_5_JSON)).map_err(NeuraError::Infrastructure)?;
    let Some(artifact) = artifact else {
        return Ok(None);
    };
    if artifact.cache_key != key {
        return Ok(None);
    }
    let final_path = tdir.join(REPORT_FINAL_HTML);
    if !final_path.exists() {
        return Ok(None);
    }
    Ok(Some(CorrectionsOutcome {
        final_template_html: std::fs::read_to_string(&final_path)?,
        page_summary: artifact.page_summary,
        cache_key: artifact.cache_key,
        cached: true,
    }))
}

/// Stage entrypoint.
pub async fn corrections_stage(
    services: &Services,
    template_id: &str,
    kind: TemplateKind,
    user_input: &str,
    correlation_id: Option<&str>,
    force_refresh: bool,
) -> Result<CorrectionsOutcome, NeuraError> {
    let tdir = template_dir(&services.config, template_id, kind, true, false)?;
    let html_path = tdir.join(TEMPLATE_HTML);
    let template_html = std::fs::read_to_string(&html_path)?;
    let mapping: serde_json::Value = read_json_opt(&tdir.join(MAPPING_STEP3_JSON))
        .map_err(NeuraError::Infrastructure)?
        .ok_or_else(|| NeuraError::Domain(DomainError::NotFound {
            entity: "mapping",
            id: template_id.to_string(),
        }))?;
    let schema: Option<serde_json::Value> =
        read_json_opt(&tdir.join(SCHEMA_EXT_JSON)).map_err(NeuraError::Infrastructure)?;

    let sample_values: BTreeMap<String, String> = mapping
        .get("token_samples")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let key = corrections_cache_key(&CorrectionsKeyInputs {
        template_pre_sha: &text_sha256(&template_html),
        mapping_sha: &text_sha256(&mapping.to_string()),
        user_input_sha: &text_sha256(user_input),
        model: services.chat.model_name(),
        prompt_version: PROMPT_VERSION_CORRECTIONS,
    });

    if !force_refresh
        && let Some(previous) = load_cached(&tdir, &key)?
    {
        info!(template_id, cache_key = %key, "corrections cache hit");
        return Ok(previous);
    }

    let _lock = acquire_template_lock(&tdir, "corrections_preview", correlation_id)?;

    let outcome = run_corrections_llm(
        services.chat.as_ref(),
        &template_html,
        &mapping,
        schema.as_ref(),
        &sample_values,
        user_input,
        None,
        &key,
    )
    .await?;

    let final_path = tdir.join(REPORT_FINAL_HTML);
    write_text_atomic(&final_path, &outcome.final_template_html)
        .map_err(NeuraError::Infrastructure)?;
    let summary_path = tdir.join(PAGE_SUMMARY_TXT);
    write_text_atomic(&summary_path, &outcome.page_summary).map_err(NeuraError::Infrastructure)?;
    let stage_path = tdir.join(STAGE_3_5_JSON);
    write_json_atomic(
        &stage_path,
        &StageArtifact {
            cache_key: outcome.cache_key.clone(),
            prompt_version: PROMPT_VERSION_CORRECTIONS.to_string(),
            page_summary: outcome.page_summary.clone(),
        },
    )
    .map_err(NeuraError::Infrastructure)?;

    let mut files = BTreeMap::new();
    files.insert("report_final".to_string(), final_path.clone());
    files.insert("page_summary".to_string(), summary_path.clone());
    files.insert("stage_3_5".to_string(), stage_path);
    write_artifact_manifest(
        &tdir,
        "corrections_preview",
        &files,
        &[TEMPLATE_HTML.to_string(), MAPPING_STEP3_JSON.to_string()],
        correlation_id,
    )?;

    let record = services.state.get_template_record(template_id);
    // Approved templates keep their status; anything else moves forward.
    let next_status = match record.as_ref().map(|r| r.status) {
        Some(TemplateStatus::Approved) => TemplateStatus::Approved,
        _ => TemplateStatus::MappingCorrectionsPreviewed,
    };
    let mut artifacts = BTreeMap::new();
    if let Some(url) = artifact_url(&services.config, &final_path) {
        artifacts.insert("template_html_url".to_string(), url);
    }
    if let Some(url) = artifact_url(&services.config, &summary_path) {
        artifacts.insert("page_summary_url".to_string(), url);
    }
    services.state.upsert_template(template_id, TemplateUpsert {
        name: record
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| template_id.to_string()),
        status: next_status,
        artifacts,
        tags: Vec::new(),
        connection_id: record.as_ref().and_then(|r| r.last_connection_id.clone()),
        mapping_keys: None,
        kind: Some(kind),
    })?;

    Ok(outcome)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ORIGINAL: &str = concat!(
        "<div data-region=\"header\"><h1>{title}</h1></div>",
        "<!--BEGIN:BLOCK_REPEAT rows-->",
        "<table data-region=\"rows\"><tbody><tr><td>{row_amount}</td></tr></tbody></table>",
        "<!--END:BLOCK_REPEAT rows-->"
    );

    #[test]
    fn test_invariants_pass_for_css_only_change() {
        let updated = ORIGINAL.replace("<h1>", "<h1 style=\"color:#222\">");
        assert!(ensure_dom_invariants(ORIGINAL, &updated, &BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_tbody_count_change_rejected() {
        let broken = format!("{ORIGINAL}<tbody><tr><td>x</td></tr></tbody>");
        let err = ensure_dom_invariants(ORIGINAL, &broken, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("tbody"));
    }

    #[test]
    fn test_repeat_marker_change_rejected() {
        let broken = ORIGINAL.replace("<!--END:BLOCK_REPEAT rows-->", "");
        assert!(ensure_dom_invariants(ORIGINAL, &broken, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_row_prototype_change_rejected() {
        let broken = ORIGINAL.replace(
            "<tr><td>{row_amount}</td></tr>",
            "<tr><td>{row_amount}</td></tr><tr><td>{row_amount}</td></tr>",
        );
        assert!(ensure_dom_invariants(ORIGINAL, &broken, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_data_region_change_rejected() {
        let broken = ORIGINAL.replace("data-region=\"header\"", "data-region=\"banner\"");
        assert!(ensure_dom_invariants(ORIGINAL, &broken, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_sample_leak_rejected() {
        let mut samples = BTreeMap::new();
        samples.insert("row_amount".to_string(), "1234.56".to_string());
        let leaked = ORIGINAL.replace("{row_amount}", "1234.56");
        let err = ensure_dom_invariants(ORIGINAL, &leaked, &samples).unwrap_err();
        assert!(err.to_string().contains("leaked"));
    }

    #[test]
    fn test_not_visible_samples_ignored() {
        let mut samples = BTreeMap::new();
        samples.insert("title".to_string(), "NOT_VISIBLE".to_string());
        assert!(ensure_dom_invariants(ORIGINAL, ORIGINAL, &samples).is_ok());
    }
}
