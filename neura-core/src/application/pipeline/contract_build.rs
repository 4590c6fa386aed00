// neura-core/src/application/pipeline/contract_build.rs

// Stage 4 — Contract build. The LLM turns the final template, the mapping
// and the catalog into a typed contract plus the step-5 requirements. The
// contract validator runs here AND at every later load boundary.

use crate::application::Services;
use crate::application::pipeline::prompts::{
    self, ContractPromptInputs, PROMPT_VERSION_CONTRACT,
};
use crate::application::templates::{
    CONTRACT_JSON, MAPPING_KEYS_JSON, MAPPING_STEP3_JSON, OVERVIEW_MD, PAGE_SUMMARY_TXT,
    REPORT_FINAL_HTML, SCHEMA_EXT_JSON, STEP5_REQUIREMENTS_JSON, TEMPLATE_HTML, template_dir,
};
use crate::domain::contract::{Contract, validate_contract};
use crate::domain::error::DomainError;
use crate::domain::template::{TemplateKind, TemplateStatus};
use crate::error::NeuraError;
use crate::infrastructure::artifacts::write_artifact_manifest;
use crate::infrastructure::fs::{read_json_opt, write_json_atomic, write_text_atomic};
use crate::infrastructure::llm::openai::strip_code_fences;
use crate::infrastructure::lock::acquire_template_lock;
use crate::infrastructure::state::TemplateUpsert;
use crate::ports::llm::{ChatModel, ChatRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

pub const CONTRACT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractOutcome {
    pub contract: Contract,
    pub overview_md: String,
    pub step5_requirements: serde_json::Value,
    pub key_tokens: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ContractPayload {
    overview_md: String,
    step5_requirements: serde_json::Value,
    contract: Contract,
    #[serde(default)]
    validation: ContractValidationReport,
}

#[derive(Debug, Default, Deserialize)]
struct ContractValidationReport {
    #[serde(default)]
    unknown_tokens: Vec<String>,
    #[serde(default)]
    unknown_columns: Vec<String>,
}

fn validation_error(message: impl Into<String>) -> NeuraError {
    NeuraError::Domain(DomainError::ContractValidation(message.into()))
}

fn check_payload(
    payload: &ContractPayload,
    catalog: &BTreeSet<String>,
    schema_tokens: &BTreeSet<String>,
    key_tokens: &[String],
) -> Result<(), NeuraError> {
    if !payload.validation.unknown_tokens.is_empty() {
        return Err(validation_error(format!(
            "validation.unknown_tokens must be empty at acceptance: {:?}",
            payload.validation.unknown_tokens
        )));
    }
    if !payload.validation.unknown_columns.is_empty() {
        return Err(validation_error(format!(
            "validation.unknown_columns must be empty at acceptance: {:?}",
            payload.validation.unknown_columns
        )));
    }

    validate_contract(&payload.contract, catalog)?;

    // The contract must fully cover the schema tokens, not just its own.
    let mapped: BTreeSet<String> = payload.contract.mapping.keys().cloned().collect();
    let missing: Vec<&String> = schema_tokens.difference(&mapped).collect();
    if !missing.is_empty() {
        return Err(validation_error(format!(
            "contract leaves schema tokens unmapped: {missing:?}"
        )));
    }

    // Key tokens must be declared as required parameters and mapped.
    let required_params: BTreeSet<String> = payload
        .step5_requirements
        .pointer("/parameters/required")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    for token in key_tokens {
        if !required_params.contains(token) {
            return Err(validation_error(format!(
                "key token '{token}' missing from step5_requirements.parameters.required"
            )));
        }
        if !payload.contract.mapping.contains_key(token) {
            return Err(validation_error(format!(
                "key token '{token}' missing from contract mapping"
            )));
        }
    }
    Ok(())
}

/// LLM loop with validator feedback.
pub async fn run_contract_llm(
    chat: &dyn ChatModel,
    inputs: &ContractPromptInputs<'_>,
    schema_tokens: &BTreeSet<String>,
) -> Result<ContractOutcome, NeuraError> {
    let catalog_set: BTreeSet<String> = inputs.catalog.iter().cloned().collect();
    let prompt = prompts::contract_prompt(inputs)?;

    let mut feedback: Option<String> = None;
    let mut last_error: Option<NeuraError> = None;

    for attempt in 1..=CONTRACT_MAX_ATTEMPTS {
        let mut request = ChatRequest::new(PROMPT_VERSION_CONTRACT)
            .with_system(prompt.system.clone())
            .with_text(prompt.user.clone())
            .json_object();
        if let Some(message) = &feedback {
            request = request.with_text(format!(
                "VALIDATION_FEEDBACK:\n{message}\nPlease correct the issues above and resend a compliant JSON response."
            ));
        }

        info!(attempt, "contract call start");
        let raw = chat.complete(&request).await?;
        let body = strip_code_fences(&raw);
        let payload: ContractPayload = match serde_json::from_str(&body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(attempt, error = %err, "contract JSON parse failed");
                let message = format!("Invalid JSON response: {err}");
                feedback = Some(message.clone());
                last_error = Some(validation_error(message));
                continue;
            }
        };

        match check_payload(&payload, &catalog_set, schema_tokens, inputs.key_tokens) {
            Ok(()) => {
                info!(attempt, "contract call success");
                return Ok(ContractOutcome {
                    contract: payload.contract,
                    overview_md: payload.overview_md,
                    step5_requirements: payload.step5_requirements,
                    key_tokens: inputs.key_tokens.to_vec(),
                });
            }
            Err(err) => {
                warn!(attempt, error = %err, "contract validation failed");
                feedback = Some(err.to_string());
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| validation_error("contract build exhausted attempts")))
}

fn schema_token_set(schema: Option<&serde_json::Value>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if let Some(schema) = schema {
        for key in ["scalars", "row_tokens", "totals"] {
            match schema.get(key) {
                Some(serde_json::Value::Array(values)) => {
                    out.extend(
                        values
                            .iter()
                            .filter_map(|v| v.as_str())
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty()),
                    );
                }
                Some(serde_json::Value::Object(map)) => {
                    out.extend(map.keys().cloned());
                }
                _ => {}
            }
        }
    }
    out
}

/// Stage entrypoint.
pub async fn contract_stage(
    services: &Services,
    template_id: &str,
    connection_id: &str,
    kind: TemplateKind,
    dialect: &str,
    key_tokens: &[String],
    user_input: &str,
    mapping_override: Option<&serde_json::Value>,
    correlation_id: Option<&str>,
) -> Result<ContractOutcome, NeuraError> {
    let tdir = template_dir(&services.config, template_id, kind, true, false)?;
    let final_html_path = tdir.join(REPORT_FINAL_HTML);
    let html_path = if final_html_path.exists() {
        final_html_path
    } else {
        tdir.join(TEMPLATE_HTML)
    };
    let final_html = std::fs::read_to_string(&html_path)?;
    let page_summary = std::fs::read_to_string(tdir.join(PAGE_SUMMARY_TXT)).unwrap_or_default();
    let mapping: serde_json::Value = read_json_opt(&tdir.join(MAPPING_STEP3_JSON))
        .map_err(NeuraError::Infrastructure)?
        .ok_or_else(|| NeuraError::Domain(DomainError::NotFound {
            entity: "mapping",
            id: template_id.to_string(),
        }))?;
    let schema: Option<serde_json::Value> =
        read_json_opt(&tdir.join(SCHEMA_EXT_JSON)).map_err(NeuraError::Infrastructure)?;

    let connection = services
        .state
        .get_connection_record(connection_id)
        .ok_or_else(|| NeuraError::Domain(DomainError::NotFound {
            entity: "connection",
            id: connection_id.to_string(),
        }))?;
    let db_schema = services.schema_cache.get_or_introspect(
        connection_id,
        std::path::Path::new(&connection.database_path),
        false,
    )?;
    let catalog = db_schema.catalog();
    let schema_tokens = schema_token_set(schema.as_ref());

    let _lock = acquire_template_lock(&tdir, "contract_build", correlation_id)?;

    let inputs = ContractPromptInputs {
        final_html: &final_html,
        page_summary: &page_summary,
        schema: schema.as_ref(),
        mapping: &mapping,
        mapping_override,
        user_input,
        catalog: &catalog,
        dialect,
        key_tokens,
    };
    let outcome = run_contract_llm(services.chat.as_ref(), &inputs, &schema_tokens).await?;

    let contract_path = tdir.join(CONTRACT_JSON);
    write_json_atomic(&contract_path, &outcome.contract).map_err(NeuraError::Infrastructure)?;
    let overview_path = tdir.join(OVERVIEW_MD);
    write_text_atomic(&overview_path, &outcome.overview_md).map_err(NeuraError::Infrastructure)?;
    let step5_path = tdir.join(STEP5_REQUIREMENTS_JSON);
    write_json_atomic(&step5_path, &outcome.step5_requirements)
        .map_err(NeuraError::Infrastructure)?;
    let keys_path = tdir.join(MAPPING_KEYS_JSON);
    write_json_atomic(&keys_path, &outcome.key_tokens).map_err(NeuraError::Infrastructure)?;

    let mut files = BTreeMap::new();
    files.insert("contract".to_string(), contract_path);
    files.insert("overview".to_string(), overview_path);
    files.insert("step5_requirements".to_string(), step5_path);
    files.insert("mapping_keys".to_string(), keys_path);
    write_artifact_manifest(
        &tdir,
        "contract_build",
        &files,
        &[MAPPING_STEP3_JSON.to_string(), SCHEMA_EXT_JSON.to_string()],
        correlation_id,
    )?;

    let record = services.state.get_template_record(template_id);
    services.state.upsert_template(template_id, TemplateUpsert {
        name: record
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| template_id.to_string()),
        status: record
            .as_ref()
            .map(|r| r.status)
            .unwrap_or(TemplateStatus::Pending),
        artifacts: BTreeMap::new(),
        tags: Vec::new(),
        connection_id: Some(connection_id.to_string()),
        mapping_keys: Some(outcome.key_tokens.clone()),
        kind: Some(kind),
    })?;

    Ok(outcome)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedChat {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn complete(&self, _request: &ChatRequest) -> Result<String, NeuraError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| NeuraError::InternalError("exhausted".into()))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn good_payload() -> String {
        serde_json::json!({
            "overview_md": "## Report",
            "step5_requirements": {"parameters": {"required": ["customer_no"], "optional": []}},
            "contract": {
                "tokens": {"scalars": ["customer"], "row_tokens": ["row_amount"], "totals": ["total_amount"]},
                "mapping": {
                    "customer": "customers.name",
                    "customer_no": "PARAM:customer_no",
                    "row_amount": "readings.amount",
                    "total_amount": "SUM(readings.amount)"
                },
                "join": {"parent_table": "customers", "parent_key": "id", "child_table": "readings", "child_key": "customer_id"},
                "date_columns": {"readings": "reading_date"},
                "filters": {"required": ["customer_no"], "optional": []},
                "order_by": {"rows": ["ROWID"]},
                "row_order": ["ROWID"]
            },
            "validation": {"unknown_tokens": [], "unknown_columns": []}
        })
        .to_string()
    }

    fn inputs<'a>(
        catalog: &'a [String],
        mapping: &'a serde_json::Value,
        key_tokens: &'a [String],
    ) -> ContractPromptInputs<'a> {
        ContractPromptInputs {
            final_html: "<p>{customer}</p>",
            page_summary: "summary",
            schema: None,
            mapping,
            mapping_override: None,
            user_input: "",
            catalog,
            dialect: "sqlite",
            key_tokens,
        }
    }

    fn catalog() -> Vec<String> {
        vec![
            "customers.id".into(),
            "customers.name".into(),
            "readings.amount".into(),
            "readings.customer_id".into(),
            "readings.reading_date".into(),
        ]
    }

    #[tokio::test]
    async fn test_contract_accepted_with_key_tokens() {
        let chat = ScriptedChat { responses: Mutex::new(vec![good_payload()]) };
        let catalog = catalog();
        let mapping = serde_json::json!({});
        let key_tokens = vec!["customer_no".to_string()];
        let outcome = run_contract_llm(&chat, &inputs(&catalog, &mapping, &key_tokens), &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(outcome.contract.mapping.len(), 4);
        assert_eq!(outcome.key_tokens, key_tokens);
    }

    #[tokio::test]
    async fn test_unknown_columns_rejected() {
        let mut bad: serde_json::Value = serde_json::from_str(&good_payload()).unwrap();
        bad["validation"]["unknown_columns"] = serde_json::json!(["ledger.mystery"]);
        let chat = ScriptedChat {
            responses: Mutex::new(vec![bad.to_string(), bad.to_string(), bad.to_string()]),
        };
        let catalog = catalog();
        let mapping = serde_json::json!({});
        let err = run_contract_llm(&chat, &inputs(&catalog, &mapping, &[]), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown_columns"));
    }

    #[tokio::test]
    async fn test_key_token_must_be_required_param() {
        let mut payload: serde_json::Value = serde_json::from_str(&good_payload()).unwrap();
        payload["step5_requirements"]["parameters"]["required"] = serde_json::json!([]);
        let text = payload.to_string();
        let chat = ScriptedChat {
            responses: Mutex::new(vec![text.clone(), text.clone(), text]),
        };
        let catalog = catalog();
        let mapping = serde_json::json!({});
        let key_tokens = vec!["customer_no".to_string()];
        let err = run_contract_llm(&chat, &inputs(&catalog, &mapping, &key_tokens), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("customer_no"));
    }

    #[tokio::test]
    async fn test_schema_tokens_must_be_covered() {
        let chat = ScriptedChat { responses: Mutex::new(vec![good_payload(), good_payload(), good_payload()]) };
        let catalog = catalog();
        let mapping = serde_json::json!({});
        let mut schema_tokens = BTreeSet::new();
        schema_tokens.insert("unmapped_schema_token".to_string());
        let err = run_contract_llm(&chat, &inputs(&catalog, &mapping, &[]), &schema_tokens)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unmapped_schema_token"));
    }
}
