// neura-core/src/application/pipeline/generator.rs

// Stage 5 — Generator assets. The LLM emits the three SQL entrypoints
// (header / rows / totals), the output schemas whose column order matches
// the contract token order, and the parameter lists. Acceptance requires an
// empty needs_user_fix list and invalid=false.

use crate::application::Services;
use crate::application::pipeline::prompts::{self, PROMPT_VERSION_GENERATOR};
use crate::application::templates::{
    CONTRACT_JSON, GENERATOR_ASSETS_JSON, GENERATOR_DIR, OUTPUT_SCHEMAS_JSON, SQL_PACK_SQL,
    template_dir,
};
use crate::domain::contract::{Contract, validate_contract};
use crate::domain::error::DomainError;
use crate::domain::template::{GeneratorMeta, TemplateKind, TemplateStatus};
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

pub const GENERATOR_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlEntrypoints {
    pub header: String,
    pub rows: String,
    pub totals: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParamLists {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorAssets {
    pub sql: SqlEntrypoints,
    /// dataset -> ordered column list; order mirrors the contract tokens.
    pub output_schemas: BTreeMap<String, Vec<String>>,
    pub params: ParamLists,
    pub contract: Contract,
    #[serde(default)]
    pub needs_user_fix: Vec<String>,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub dialect: String,
}

fn validation_error(message: impl Into<String>) -> NeuraError {
    NeuraError::Domain(DomainError::GeneratorValidation(message.into()))
}

fn check_assets(assets: &GeneratorAssets, catalog: &BTreeSet<String>) -> Result<(), NeuraError> {
    if assets.invalid {
        return Err(validation_error("generator marked the assets invalid"));
    }
    if !assets.needs_user_fix.is_empty() {
        return Err(validation_error(format!(
            "needs_user_fix entries present: {:?}",
            assets.needs_user_fix
        )));
    }
    for (name, sql) in [
        ("header", &assets.sql.header),
        ("rows", &assets.sql.rows),
        ("totals", &assets.sql.totals),
    ] {
        if sql.trim().is_empty() {
            return Err(validation_error(format!("sql.{name} is empty")));
        }
    }
    if !assets.sql.rows.to_ascii_uppercase().contains("ORDER BY") {
        return Err(validation_error("sql.rows must ORDER BY the contract's stable columns"));
    }

    validate_contract(&assets.contract, catalog)?;

    // output_schemas column order must mirror the contract token order.
    let expectations: [(&str, &[String]); 3] = [
        ("header", &assets.contract.tokens.scalars),
        ("rows", &assets.contract.tokens.row_tokens),
        ("totals", &assets.contract.tokens.totals),
    ];
    for (dataset, expected) in expectations {
        let Some(schema) = assets.output_schemas.get(dataset) else {
            return Err(validation_error(format!("output_schemas.{dataset} is missing")));
        };
        let expected_in_schema: Vec<&String> =
            expected.iter().filter(|token| schema.contains(token)).collect();
        let schema_filtered: Vec<&String> =
            schema.iter().filter(|col| expected.contains(col)).collect();
        if expected_in_schema != schema_filtered {
            return Err(validation_error(format!(
                "output_schemas.{dataset} column order does not match the contract token order"
            )));
        }
    }

    // UNION_ALL reshapes produce one SELECT per source column, not a CASE ladder.
    for rule in &assets.contract.reshape_rules {
        if rule.kind.as_deref().map(str::to_ascii_uppercase) == Some("UNION_ALL".to_string()) {
            let select_count = assets
                .sql
                .rows
                .to_ascii_uppercase()
                .matches("SELECT")
                .count();
            if select_count < rule.source_columns.len().max(1) {
                return Err(validation_error(format!(
                    "UNION_ALL reshape '{}' must emit one SELECT per source column",
                    rule.purpose
                )));
            }
        }
    }
    Ok(())
}

/// LLM loop with validator feedback.
pub async fn run_generator_llm(
    chat: &dyn ChatModel,
    contract: &Contract,
    catalog: &[String],
    dialect: &str,
) -> Result<GeneratorAssets, NeuraError> {
    let catalog_set: BTreeSet<String> = catalog.iter().cloned().collect();
    let contract_json = serde_json::to_value(contract)?;
    let prompt = prompts::generator_prompt(&contract_json, catalog, dialect)?;

    let mut feedback: Option<String> = None;
    let mut last_error: Option<NeuraError> = None;

    for attempt in 1..=GENERATOR_MAX_ATTEMPTS {
        let mut request = ChatRequest::new(PROMPT_VERSION_GENERATOR)
            .with_system(prompt.system.clone())
            .with_text(prompt.user.clone())
            .json_object();
        if let Some(message) = &feedback {
            request = request.with_text(format!(
                "VALIDATION_FEEDBACK:\n{message}\nPlease correct the issues above and resend a compliant JSON response."
            ));
        }

        info!(attempt, dialect, "generator call start");
        let raw = chat.complete(&request).await?;
        let body = strip_code_fences(&raw);
        let mut assets: GeneratorAssets = match serde_json::from_str(&body) {
            Ok(assets) => assets,
            Err(err) => {
                warn!(attempt, error = %err, "generator JSON parse failed");
                let message = format!("Invalid JSON response: {err}");
                feedback = Some(message.clone());
                last_error = Some(validation_error(message));
                continue;
            }
        };
        assets.dialect = dialect.to_string();

        match check_assets(&assets, &catalog_set) {
            Ok(()) => {
                info!(attempt, "generator call success");
                return Ok(assets);
            }
            Err(err) => {
                warn!(attempt, error = %err, "generator validation failed");
                feedback = Some(err.to_string());
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| validation_error("generator exhausted attempts")))
}

/// Stage entrypoint.
pub async fn generator_stage(
    services: &Services,
    template_id: &str,
    connection_id: &str,
    kind: TemplateKind,
    dialect: &str,
    correlation_id: Option<&str>,
) -> Result<GeneratorAssets, NeuraError> {
    let tdir = template_dir(&services.config, template_id, kind, true, false)?;
    let contract: Contract = read_json_opt(&tdir.join(CONTRACT_JSON))
        .map_err(NeuraError::Infrastructure)?
        .ok_or_else(|| NeuraError::Domain(DomainError::NotFound {
            entity: "contract",
            id: template_id.to_string(),
        }))?;

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

    let _lock = acquire_template_lock(&tdir, "generator_assets_v1", correlation_id)?;

    let assets =
        run_generator_llm(services.chat.as_ref(), &contract, &catalog, dialect).await?;

    std::fs::create_dir_all(tdir.join(GENERATOR_DIR))?;
    let assets_path = tdir.join(GENERATOR_ASSETS_JSON);
    write_json_atomic(&assets_path, &assets).map_err(NeuraError::Infrastructure)?;
    let schemas_path = tdir.join(OUTPUT_SCHEMAS_JSON);
    write_json_atomic(&schemas_path, &assets.output_schemas).map_err(NeuraError::Infrastructure)?;
    let sql_pack = format!(
        "-- header\n{};\n\n-- rows\n{};\n\n-- totals\n{};\n",
        assets.sql.header.trim_end_matches(';'),
        assets.sql.rows.trim_end_matches(';'),
        assets.sql.totals.trim_end_matches(';')
    );
    let sql_path = tdir.join(SQL_PACK_SQL);
    write_text_atomic(&sql_path, &sql_pack).map_err(NeuraError::Infrastructure)?;

    let mut files = BTreeMap::new();
    files.insert("generator_assets".to_string(), assets_path);
    files.insert("output_schemas".to_string(), schemas_path);
    files.insert("sql_pack".to_string(), sql_path);
    write_artifact_manifest(
        &tdir,
        "generator_assets",
        &files,
        &[CONTRACT_JSON.to_string()],
        correlation_id,
    )?;

    let record = services.state.get_template_record(template_id);
    services.state.upsert_template(template_id, TemplateUpsert {
        name: record
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| template_id.to_string()),
        status: TemplateStatus::Approved,
        artifacts: BTreeMap::new(),
        tags: Vec::new(),
        connection_id: Some(connection_id.to_string()),
        mapping_keys: None,
        kind: Some(kind),
    })?;
    services.state.update_template_generator(template_id, GeneratorMeta {
        dialect: Some(dialect.to_string()),
        params: Some(serde_json::to_value(&assets.params)?),
        invalid: assets.invalid,
        needs_user_fix: assets.needs_user_fix.clone(),
        summary: None,
        dry_run: None,
        cached: Some(false),
        updated_at: None,
    })?;

    Ok(assets)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::contract::JoinSpec;

    fn catalog_set() -> BTreeSet<String> {
        [
            "customers.id",
            "customers.name",
            "readings.amount",
            "readings.customer_id",
            "readings.reading_date",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn contract() -> Contract {
        let mut contract = Contract::default();
        contract.tokens.scalars = vec!["customer".into(), "report_no".into()];
        contract.tokens.row_tokens = vec!["row_amount".into()];
        contract.tokens.totals = vec!["total_amount".into()];
        contract.mapping.insert("customer".into(), "customers.name".into());
        contract.mapping.insert("report_no".into(), "PARAM:report_no".into());
        contract.mapping.insert("row_amount".into(), "readings.amount".into());
        contract.mapping.insert("total_amount".into(), "SUM(readings.amount)".into());
        contract.join = JoinSpec {
            parent_table: "customers".into(),
            parent_key: "id".into(),
            child_table: "readings".into(),
            child_key: "customer_id".into(),
        };
        contract
    }

    fn assets() -> GeneratorAssets {
        let mut output_schemas = BTreeMap::new();
        output_schemas.insert("header".to_string(), vec!["customer".to_string(), "report_no".to_string()]);
        output_schemas.insert("rows".to_string(), vec!["row_amount".to_string()]);
        output_schemas.insert("totals".to_string(), vec!["total_amount".to_string()]);
        GeneratorAssets {
            sql: SqlEntrypoints {
                header: "SELECT name AS customer, :report_no AS report_no FROM customers LIMIT 1".into(),
                rows: "SELECT amount AS row_amount FROM readings ORDER BY rowid".into(),
                totals: "SELECT SUM(amount) AS total_amount FROM readings".into(),
            },
            output_schemas,
            params: ParamLists { required: vec!["report_no".into()], optional: vec![] },
            contract: contract(),
            needs_user_fix: vec![],
            invalid: false,
            dialect: "sqlite".into(),
        }
    }

    #[test]
    fn test_valid_assets_accepted() {
        assert!(check_assets(&assets(), &catalog_set()).is_ok());
    }

    #[test]
    fn test_invalid_flag_rejected() {
        let mut bad = assets();
        bad.invalid = true;
        assert!(check_assets(&bad, &catalog_set()).is_err());
    }

    #[test]
    fn test_needs_user_fix_rejected() {
        let mut bad = assets();
        bad.needs_user_fix.push("fix the join".into());
        assert!(check_assets(&bad, &catalog_set()).is_err());
    }

    #[test]
    fn test_rows_without_order_by_rejected() {
        let mut bad = assets();
        bad.sql.rows = "SELECT amount AS row_amount FROM readings".into();
        let err = check_assets(&bad, &catalog_set()).unwrap_err();
        assert!(err.to_string().contains("ORDER BY"));
    }

    #[test]
    fn test_output_schema_order_must_match_contract() {
        let mut bad = assets();
        bad.output_schemas.insert(
            "header".to_string(),
            vec!["report_no".to_string(), "customer".to_string()],
        );
        let err = check_assets(&bad, &catalog_set()).unwrap_err();
        assert!(err.to_string().contains("column order"));
    }

    #[test]
    fn test_union_all_reshape_needs_selects() {
        let mut bad = assets();
        bad.contract.reshape_rules.push(crate::domain::contract::ReshapeRule {
            purpose: "unpivot monthly columns".into(),
            kind: Some("UNION_ALL".into()),
            source_columns: vec!["jan".into(), "feb".into(), "mar".into()],
            target_token: Some("row_amount".into()),
        });
        // rows has a single SELECT; three source columns demand three.
        let err = check_assets(&bad, &catalog_set()).unwrap_err();
        assert!(err.to_string().contains("UNION_ALL"));
    }
}
