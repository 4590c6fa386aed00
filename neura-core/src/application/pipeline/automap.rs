// neura-core/src/application/pipeline/automap.rs

// Stage 2 — Auto-Map. The LLM proposes token -> binding plus a literal
// sample per token; unmapped static tokens are inlined as constants. The
// validator-feedback loop retries up to MAPPING_INLINE_MAX_ATTEMPTS times,
// echoing the exact validation error back to the model.

use crate::application::Services;
use crate::application::pipeline::cache::{
    AutoMapKeyInputs, automap_cache_key, catalog_sha256, schema_sha256, text_sha256,
};
use crate::application::pipeline::prompts::{self, PROMPT_VERSION_AUTOMAP};
use crate::application::templates::{
    CONSTANT_REPLACEMENTS_JSON, MAPPING_PDF_LABELS_JSON, MAPPING_STEP3_JSON, REFERENCE_PNG,
    SCHEMA_EXT_JSON, SOURCE_PDF, TEMPLATE_HTML, artifact_url, template_dir,
};
use crate::domain::contract::{
    Binding, INPUT_SAMPLE_VALUE, REPORT_SELECTED_VALUE, UNRESOLVED_VALUE,
};
use crate::domain::error::DomainError;
use crate::domain::template::{TemplateKind, TemplateStatus};
use crate::domain::tokens;
use crate::error::NeuraError;
use crate::infrastructure::artifacts::{sha256_file, write_artifact_manifest};
use crate::infrastructure::fs::{read_json_opt, write_json_atomic, write_text_atomic};
use crate::infrastructure::llm::openai::strip_code_fences;
use crate::infrastructure::lock::acquire_template_lock;
use crate::infrastructure::state::TemplateUpsert;
use crate::ports::llm::{ChatModel, ChatRequest};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

pub const MAPPING_INLINE_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoMapOutcome {
    pub html_constants_applied: String,
    pub mapping: BTreeMap<String, String>,
    pub constant_replacements: BTreeMap<String, String>,
    pub token_samples: BTreeMap<String, String>,
    pub meta: serde_json::Map<String, serde_json::Value>,
    pub cache_key: String,
    pub cached: bool,
}

#[derive(Debug, Deserialize)]
struct AutoMapPayload {
    mapping: BTreeMap<String, String>,
    token_samples: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    meta: serde_json::Map<String, serde_json::Value>,
}

fn validation_error(message: impl Into<String>) -> NeuraError {
    NeuraError::Domain(DomainError::MappingValidation(message.into()))
}

/// Coerce report date / page tokens mapped to params.* (or "to be selected"
/// phrasing) to the literal REPORT_SELECTED, so the report generator treats
/// them as run filters instead of SQL bindings.
fn normalize_report_date_mapping(mapping: &mut BTreeMap<String, String>) {
    for (token, value) in mapping.iter_mut() {
        if !tokens::is_report_filter_token(token) {
            continue;
        }
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lowered = trimmed.to_ascii_lowercase();
        let is_param = trimmed.starts_with("params.") || trimmed.starts_with("PARAM:");
        if is_param || lowered.starts_with("to be selected") {
            *value = REPORT_SELECTED_VALUE.to_string();
        }
    }
}

fn mapping_allowlist_errors(
    mapping: &BTreeMap<String, String>,
    catalog: &BTreeSet<String>,
) -> Vec<String> {
    let mut errors = Vec::new();
    for (token, value) in mapping {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            errors.push(format!("'{token}' -> empty value"));
            continue;
        }
        if trimmed == UNRESOLVED_VALUE
            || trimmed == INPUT_SAMPLE_VALUE
            || trimmed == REPORT_SELECTED_VALUE
        {
            continue;
        }
        if let Err(reason) = Binding::classify(trimmed, catalog) {
            errors.push(format!("'{token}' -> {reason}"));
        }
    }
    errors
}

fn normalize_token_samples(
    raw: &BTreeMap<String, serde_json::Value>,
    expected: &BTreeSet<String>,
) -> Result<BTreeMap<String, String>, NeuraError> {
    let mut normalized = BTreeMap::new();
    for (key, value) in raw {
        let token = key.trim();
        if token.is_empty() {
            return Err(validation_error("token_samples keys must be non-empty token names"));
        }
        let text = match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if text.trim().is_empty() {
            return Err(validation_error(format!(
                "token_samples['{token}'] must be a non-empty literal string \
                 (use NOT_VISIBLE/UNREADABLE when necessary)"
            )));
        }
        normalized.insert(token.to_string(), text);
    }

    let provided: BTreeSet<String> = normalized.keys().cloned().collect();
    let missing: Vec<&String> = expected.difference(&provided).collect();
    if !missing.is_empty() {
        return Err(validation_error(format!(
            "token_samples missing entries for tokens: {missing:?}"
        )));
    }
    let extras: Vec<&String> = provided.difference(expected).collect();
    if !extras.is_empty() {
        return Err(validation_error(format!(
            "token_samples contains unknown tokens: {extras:?}"
        )));
    }
    Ok(normalized)
}

/// Validate the computed constant set before inlining: row tokens, schema
/// dynamic tokens and date-like tokens may never be treated as constants.
fn validate_constant_set(
    constants: &BTreeMap<String, String>,
    schema: Option<&serde_json::Value>,
) -> Result<(), NeuraError> {
    let mut schema_dynamic: BTreeSet<String> = BTreeSet::new();
    if let Some(schema) = schema {
        for key in ["row_tokens", "totals"] {
            if let Some(values) = schema.get(key).and_then(|v| v.as_array()) {
                schema_dynamic.extend(
                    values
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty()),
                );
            }
        }
    }
    for token in constants.keys() {
        if tokens::is_row_token(token) {
            return Err(validation_error(format!(
                "Token '{token}' is a row-level placeholder and cannot be treated as a constant"
            )));
        }
        if schema_dynamic.contains(token) {
            return Err(validation_error(format!(
                "Token '{token}' is defined as dynamic in the schema"
            )));
        }
        if tokens::is_date_like(token) {
            return Err(validation_error(format!(
                "Date-like token '{token}' cannot be treated as a constant"
            )));
        }
    }
    Ok(())
}

fn apply_constants(html: &str, constants: &BTreeMap<String, String>) -> String {
    let mut updated = html.to_string();
    for (token, value) in constants {
        updated = tokens::replace_token(&updated, token, value);
    }
    updated
}

/// One validated Auto-Map pass over a raw LLM payload. Pure: no IO.
fn validate_payload(
    payload: AutoMapPayload,
    template_html: &str,
    catalog: &BTreeSet<String>,
    schema: Option<&serde_json::Value>,
    cache_key: &str,
) -> Result<AutoMapOutcome, NeuraError> {
    let mut mapping = payload.mapping;
    normalize_report_date_mapping(&mut mapping);

    let allowlist_errors = mapping_allowlist_errors(&mapping, catalog);
    if !allowlist_errors.is_empty() {
        return Err(validation_error(format!(
            "Mapping values outside allow-list: {}",
            allowlist_errors.join(", ")
        )));
    }

    let original_tokens = tokens::extract_tokens(template_html);
    let token_samples = normalize_token_samples(&payload.token_samples, &original_tokens)?;

    // A mapped token that does not exist in the HTML is a silent rename; the
    // model must re-emit with the template's own tokens.
    let unknown_mapped: Vec<&String> = mapping
        .keys()
        .filter(|token| !original_tokens.contains(*token))
        .collect();
    if !unknown_mapped.is_empty() {
        return Err(validation_error(format!(
            "mapping contains tokens absent from the template: {unknown_mapped:?}"
        )));
    }

    // Row-prefixed tokens are dynamic by construction, never constants.
    let constants: BTreeMap<String, String> = original_tokens
        .iter()
        .filter(|token| !mapping.contains_key(*token) && !tokens::is_row_token(token))
        .filter_map(|token| token_samples.get(token).map(|v| (token.clone(), v.clone())))
        .collect();
    validate_constant_set(&constants, schema)?;

    let html_constants_applied = apply_constants(template_html, &constants);
    let updated_tokens = tokens::extract_tokens(&html_constants_applied);

    let added: Vec<&String> = updated_tokens.difference(&original_tokens).collect();
    if !added.is_empty() {
        return Err(validation_error(format!("New tokens introduced: {added:?}")));
    }
    let removed: BTreeSet<String> = original_tokens
        .difference(&updated_tokens)
        .cloned()
        .collect();
    let constant_set: BTreeSet<String> = constants.keys().cloned().collect();
    if removed != constant_set {
        return Err(validation_error(format!(
            "Token removal mismatch. Expected removal {constant_set:?}, observed {removed:?}"
        )));
    }

    // Filter meta lists down to surviving tokens.
    let mut meta = payload.meta;
    if let Some(unresolved) = meta.get_mut("unresolved").and_then(|v| v.as_array_mut()) {
        unresolved.retain(|v| {
            v.as_str().map(|s| updated_tokens.contains(s)).unwrap_or(false)
        });
    }
    if let Some(hints) = meta.get_mut("hints").and_then(|v| v.as_object_mut()) {
        let keep: Vec<String> = hints
            .keys()
            .filter(|k| mapping.contains_key(*k))
            .cloned()
            .collect();
        hints.retain(|k, _| keep.contains(k));
    }
    if let Some(confidence) = meta.get_mut("confidence").and_then(|v| v.as_object_mut()) {
        let keep: Vec<String> = confidence
            .keys()
            .filter(|k| mapping.contains_key(*k))
            .cloned()
            .collect();
        confidence.retain(|k, _| keep.contains(k));
    }

    Ok(AutoMapOutcome {
        html_constants_applied,
        mapping,
        constant_replacements: constants,
        token_samples,
        meta,
        cache_key: cache_key.to_string(),
        cached: false,
    })
}

/// LLM loop with validator feedback. Pure with respect to the filesystem.
pub async fn run_automap_llm(
    chat: &dyn ChatModel,
    template_html: &str,
    catalog: &[String],
    schema: Option<&serde_json::Value>,
    png_data_uri: Option<&str>,
    cache_key: &str,
) -> Result<AutoMapOutcome, NeuraError> {
    let catalog_set: BTreeSet<String> = catalog.iter().map(|s| s.trim().to_string()).collect();
    let prompt = prompts::automap_prompt(template_html, catalog, schema)?;

    let mut feedback: Option<String> = None;
    let mut last_error: Option<NeuraError> = None;

    for attempt in 1..=MAPPING_INLINE_MAX_ATTEMPTS {
        let mut request = ChatRequest::new(PROMPT_VERSION_AUTOMAP)
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

        info!(attempt, cache_key, "automap call start");
        let raw = chat.complete(&request).await?;
        let body = strip_code_fences(&raw);

        let payload: AutoMapPayload = match serde_json::from_str(&body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(attempt, error = %err, "automap JSON parse failed");
                let message = format!("Invalid JSON response: {err}");
                feedback = Some(message.clone());
                last_error = Some(validation_error(message));
                continue;
            }
        };

        match validate_payload(payload, template_html, &catalog_set, schema, cache_key) {
            Ok(outcome) => {
                info!(attempt, cache_key, "automap call success");
                return Ok(outcome);
            }
            Err(err) => {
                warn!(attempt, error = %err, "automap validation failed");
                feedback = Some(err.to_string());
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| validation_error("auto-map exhausted attempts")))
}

fn png_data_uri(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    ))
}

/// Stage entrypoint: cache check, lock, LLM loop, artifact writes, state
/// record update.
pub async fn automap_stage(
    services: &Services,
    template_id: &str,
    connection_id: &str,
    kind: TemplateKind,
    correlation_id: Option<&str>,
    force_refresh: bool,
) -> Result<AutoMapOutcome, NeuraError> {
    let tdir = template_dir(&services.config, template_id, kind, true, false)?;
    let html_path = tdir.join(TEMPLATE_HTML);
    if !html_path.exists() {
        return Err(NeuraError::Domain(DomainError::NotFound {
            entity: "template HTML",
            id: template_id.to_string(),
        }));
    }
    let template_html = std::fs::read_to_string(&html_path)?;
    let schema: Option<serde_json::Value> =
        read_json_opt(&tdir.join(SCHEMA_EXT_JSON)).map_err(NeuraError::Infrastructure)?;

    let connection = services
        .state
        .get_connection_record(connection_id)
        .ok_or_else(|| NeuraError::Domain(DomainError::NotFound {
            entity: "connection",
            id: connection_id.to_string(),
        }))?;
    let db_path = std::path::PathBuf::from(&connection.database_path);
    let db_schema = services
        .schema_cache
        .get_or_introspect(connection_id, &db_path, false)?;
    let catalog = db_schema.catalog();

    let pdf_sha = sha256_file(&tdir.join(SOURCE_PDF)).unwrap_or_else(|_| text_sha256(""));
    let key = automap_cache_key(&AutoMapKeyInputs {
        pdf_sha: &pdf_sha,
        db_signature: &crate::infrastructure::introspect::db_signature(&db_path),
        html_sha: &text_sha256(&template_html),
        prompt_version: PROMPT_VERSION_AUTOMAP,
        catalog_sha: &catalog_sha256(&catalog),
        schema_sha: &schema_sha256(schema.as_ref()),
    });

    // Cached short-circuit: same key and the prior outputs still on disk.
    if !force_refresh
        && let Some(previous) = load_cached_outcome(&tdir, &key)?
    {
        info!(template_id, cache_key = %key, "automap cache hit");
        return Ok(previous);
    }

    let _lock = acquire_template_lock(&tdir, "mapping_preview", correlation_id)?;

    let png_uri = png_data_uri(&tdir.join(REFERENCE_PNG));
    let outcome = run_automap_llm(
        services.chat.as_ref(),
        &template_html,
        &catalog,
        schema.as_ref(),
        png_uri.as_deref(),
        &key,
    )
    .await?;

    persist_outcome(services, &tdir, template_id, connection_id, kind, &outcome, correlation_id)?;
    Ok(outcome)
}

#[derive(Debug, Serialize, Deserialize)]
struct MappingArtifact {
    cache_key: String,
    prompt_version: String,
    mapping: BTreeMap<String, String>,
    token_samples: BTreeMap<String, String>,
    meta: serde_json::Map<String, serde_json::Value>,
}

fn load_cached_outcome(tdir: &Path, key: &str) -> Result<Option<AutoMapOutcome>, NeuraError> {
    let artifact: Option<MappingArtifact> =
        read_json_opt(&tdir.join(MAPPING_STEP3_JSON)).map_err(NeuraError::Infrastructure)?;
    let Some(artifact) = artifact else {
        return Ok(None);
    };
    if artifact.cache_key != key {
        return Ok(None);
    }
    let html_path = tdir.join(TEMPLATE_HTML);
    let constants: Option<BTreeMap<String, String>> =
        read_json_opt(&tdir.join(CONSTANT_REPLACEMENTS_JSON)).map_err(NeuraError::Infrastructure)?;
    let html = std::fs::read_to_string(&html_path)?;
    Ok(Some(AutoMapOutcome {
        html_constants_applied: html,
        mapping: artifact.mapping,
        constant_replacements: constants.unwrap_or_default(),
        token_samples: artifact.token_samples,
        meta: artifact.meta,
        cache_key: artifact.cache_key,
        cached: true,
    }))
}

fn persist_outcome(
    services: &Services,
    tdir: &Path,
    template_id: &str,
    connection_id: &str,
    kind: TemplateKind,
    outcome: &AutoMapOutcome,
    correlation_id: Option<&str>,
) -> Result<(), NeuraError> {
    let html_path = tdir.join(TEMPLATE_HTML);
    write_text_atomic(&html_path, &outcome.html_constants_applied)
        .map_err(NeuraError::Infrastructure)?;
    let mapping_path = tdir.join(MAPPING_STEP3_JSON);
    write_json_atomic(
        &mapping_path,
        &MappingArtifact {
            cache_key: outcome.cache_key.clone(),
            prompt_version: PROMPT_VERSION_AUTOMAP.to_string(),
            mapping: outcome.mapping.clone(),
            token_samples: outcome.token_samples.clone(),
            meta: outcome.meta.clone(),
        },
    )
    .map_err(NeuraError::Infrastructure)?;
    let constants_path = tdir.join(CONSTANT_REPLACEMENTS_JSON);
    write_json_atomic(&constants_path, &outcome.constant_replacements)
        .map_err(NeuraError::Infrastructure)?;
    // The literal values read off the reference page, per token.
    let labels_path = tdir.join(MAPPING_PDF_LABELS_JSON);
    write_json_atomic(&labels_path, &outcome.token_samples).map_err(NeuraError::Infrastructure)?;

    let mut files = BTreeMap::new();
    files.insert("template_html".to_string(), html_path.clone());
    files.insert("mapping_step3".to_string(), mapping_path);
    files.insert("constant_replacements".to_string(), constants_path);
    files.insert("mapping_pdf_labels".to_string(), labels_path);
    write_artifact_manifest(
        tdir,
        "mapping_preview",
        &files,
        &[SCHEMA_EXT_JSON.to_string()],
        correlation_id,
    )?;

    let record = services.state.get_template_record(template_id);
    let mut artifacts = BTreeMap::new();
    if let Some(url) = artifact_url(&services.config, &html_path) {
        artifacts.insert("template_html_url".to_string(), url);
    }
    services.state.upsert_template(template_id, TemplateUpsert {
        name: record
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| template_id.to_string()),
        status: TemplateStatus::MappingPreviewed,
        artifacts,
        tags: Vec::new(),
        connection_id: Some(connection_id.to_string()),
        mapping_keys: None,
        kind: Some(kind),
    })?;
    Ok(())
}
