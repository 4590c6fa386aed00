// neura-core/src/domain/contract.rs

// The contract is the bridge between template tokens and SQL. It is
// validated at every load boundary, not only inside the LLM loop.

use crate::domain::error::DomainError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

pub const UNRESOLVED_VALUE: &str = "UNRESOLVED";
pub const INPUT_SAMPLE_VALUE: &str = "INPUT_SAMPLE";
pub const REPORT_SELECTED_VALUE: &str = "REPORT_SELECTED";

#[allow(clippy::expect_used)]
static PARAM_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(PARAM:|params\.)[A-Za-z_][A-Za-z0-9_]*$").expect("param regex")
});

#[allow(clippy::expect_used)]
static DATASET_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(header|rows|totals)\.[A-Za-z_][A-Za-z0-9_]*$").expect("dataset regex")
});

#[allow(clippy::expect_used)]
static COLUMN_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["`\[]?([A-Za-z_][A-Za-z0-9_]*)["`\]]?\.["`\[]?([A-Za-z_][A-Za-z0-9_]*)["`\]]?"#)
        .expect("column ref regex")
});

#[allow(clippy::expect_used)]
static LEGACY_WRAPPER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(DERIVED\s*:|TABLE_COLUMNS\s*\[|COLUMN_EXP\s*\[)").expect("legacy regex")
});

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContractTokens {
    #[serde(default)]
    pub scalars: Vec<String>,
    #[serde(default)]
    pub row_tokens: Vec<String>,
    #[serde(default)]
    pub totals: Vec<String>,
}

impl ContractTokens {
    pub fn all(&self) -> BTreeSet<String> {
        self.scalars
            .iter()
            .chain(self.row_tokens.iter())
            .chain(self.totals.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JoinSpec {
    #[serde(default)]
    pub parent_table: String,
    #[serde(default)]
    pub parent_key: String,
    #[serde(default)]
    pub child_table: String,
    #[serde(default)]
    pub child_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterSpec {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReshapeRule {
    #[serde(default)]
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub source_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrderBySpec {
    #[serde(default)]
    pub rows: Vec<String>,
}

fn default_row_order() -> Vec<String> {
    vec!["ROWID".to_string()]
}

fn default_order_by() -> OrderBySpec {
    OrderBySpec { rows: default_row_order() }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contract {
    #[serde(default)]
    pub tokens: ContractTokens,
    /// token -> binding (catalog column, PARAM:<name>, DATASET.COLUMN or
    /// a SQL expression over catalog columns only).
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub join: JoinSpec,
    /// table -> date column used by the report window filter.
    #[serde(default)]
    pub date_columns: BTreeMap<String, String>,
    #[serde(default)]
    pub filters: FilterSpec,
    #[serde(default)]
    pub reshape_rules: Vec<ReshapeRule>,
    #[serde(default)]
    pub row_computed: BTreeMap<String, String>,
    #[serde(default)]
    pub totals_math: BTreeMap<String, String>,
    /// token -> formatter spec, e.g. `percent(2)` or `date(YYYY-MM-DD)`.
    #[serde(default)]
    pub formatters: BTreeMap<String, String>,
    #[serde(default = "default_order_by")]
    pub order_by: OrderBySpec,
    #[serde(default = "default_row_order")]
    pub row_order: Vec<String>,
    #[serde(default)]
    pub unresolved: Vec<String>,
}

impl Default for Contract {
    fn default() -> Self {
        Self {
            tokens: ContractTokens::default(),
            mapping: BTreeMap::new(),
            join: JoinSpec::default(),
            date_columns: BTreeMap::new(),
            filters: FilterSpec::default(),
            reshape_rules: Vec::new(),
            row_computed: BTreeMap::new(),
            totals_math: BTreeMap::new(),
            formatters: BTreeMap::new(),
            order_by: OrderBySpec { rows: default_row_order() },
            row_order: default_row_order(),
            unresolved: Vec::new(),
        }
    }
}

/// The four shapes a binding value may take after acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    CatalogColumn(String),
    Param(String),
    Dataset { dataset: String, column: String },
    SqlExpression(String),
}

impl Binding {
    /// Classify a raw mapping value against the catalog allow-list.
    pub fn classify(value: &str, catalog: &BTreeSet<String>) -> Result<Binding, String> {
        let normalized = value.trim();
        if normalized.is_empty() {
            return Err("binding value is empty".to_string());
        }
        if LEGACY_WRAPPER_RE.is_match(normalized) {
            return Err("uses legacy wrapper (DERIVED/TABLE_COLUMNS/COLUMN_EXP)".to_string());
        }
        if catalog.contains(normalized) {
            return Ok(Binding::CatalogColumn(normalized.to_string()));
        }
        if PARAM_REF_RE.is_match(normalized) {
            let name = normalized
                .trim_start_matches("PARAM:")
                .trim_start_matches("params.")
                .to_string();
            return Ok(Binding::Param(name));
        }
        if DATASET_REF_RE.is_match(normalized) {
            let mut parts = normalized.splitn(2, '.');
            let dataset = parts.next().unwrap_or_default().to_string();
            let column = parts.next().unwrap_or_default().to_string();
            // Dataset names collide with catalog table names; the catalog
            // check above already won for real columns.
            return Ok(Binding::Dataset { dataset, column });
        }

        // Last resort: a SQL expression. Every table.column identifier must
        // belong to the catalog, and the expression must parse.
        let referenced: Vec<String> = COLUMN_REF_RE
            .captures_iter(normalized)
            .map(|caps| format!("{}.{}", &caps[1], &caps[2]))
            .collect();
        let outside: Vec<String> = referenced
            .iter()
            .filter(|col| !catalog.contains(col.as_str()))
            .cloned()
            .collect();
        if !outside.is_empty() {
            return Err(format!("references columns outside catalog: {outside:?}"));
        }
        if !is_sql_expression(normalized) {
            return Err(
                "value is not a catalog column, params reference, or recognizable SQL expression"
                    .to_string(),
            );
        }
        Ok(Binding::SqlExpression(normalized.to_string()))
    }
}

/// True when the value parses as a scalar SQL expression.
pub fn is_sql_expression(value: &str) -> bool {
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    let probe = format!("SELECT {value}");
    Parser::parse_sql(&GenericDialect {}, &probe).is_ok()
}

/// Structural + allow-list validation, run at every load boundary.
pub fn validate_contract(contract: &Contract, catalog: &BTreeSet<String>) -> Result<(), DomainError> {
    let tokens = contract.tokens.all();
    if tokens.is_empty() {
        return Err(DomainError::ContractValidation(
            "contract declares no tokens".to_string(),
        ));
    }

    let mapped: BTreeSet<String> = contract.mapping.keys().cloned().collect();
    let missing: Vec<String> = tokens.difference(&mapped).cloned().collect();
    if !missing.is_empty() {
        return Err(DomainError::ContractValidation(format!(
            "tokens missing from mapping: {missing:?}"
        )));
    }

    let mut errors = Vec::new();
    for (token, value) in &contract.mapping {
        let trimmed = value.trim();
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
    if !errors.is_empty() {
        return Err(DomainError::ContractValidation(format!(
            "mapping values outside allow-list: {}",
            errors.join(", ")
        )));
    }

    for (label, value) in [
        ("join.parent_table", &contract.join.parent_table),
        ("join.parent_key", &contract.join.parent_key),
        ("join.child_table", &contract.join.child_table),
        ("join.child_key", &contract.join.child_key),
    ] {
        if value.trim().is_empty() {
            return Err(DomainError::ContractValidation(format!("{label} is empty")));
        }
    }

    for (idx, rule) in contract.reshape_rules.iter().enumerate() {
        if rule.purpose.trim().is_empty() {
            return Err(DomainError::ContractValidation(format!(
                "reshape_rules[{idx}] has an empty purpose"
            )));
        }
    }

    if contract.order_by.rows.is_empty() {
        return Err(DomainError::ContractValidation(
            "order_by.rows must not be empty (default [\"ROWID\"])".to_string(),
        ));
    }
    if contract.row_order.is_empty() {
        return Err(DomainError::ContractValidation(
            "row_order must not be empty (default [\"ROWID\"])".to_string(),
        ));
    }

    if !contract.unresolved.is_empty() {
        return Err(DomainError::ContractValidation(format!(
            "unresolved tokens remain: {:?}",
            contract.unresolved
        )));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn catalog() -> BTreeSet<String> {
        ["reports.report_date", "reports.amount", "customers.name"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn base_contract() -> Contract {
        let mut contract = Contract::default();
        contract.tokens.scalars = vec!["customer".into()];
        contract.tokens.row_tokens = vec!["row_amount".into()];
        contract.tokens.totals = vec!["total_amount".into()];
        contract.mapping.insert("customer".into(), "customers.name".into());
        contract.mapping.insert("row_amount".into(), "reports.amount".into());
        contract
            .mapping
            .insert("total_amount".into(), "SUM(reports.amount)".into());
        contract.join = JoinSpec {
            parent_table: "customers".into(),
            parent_key: "id".into(),
            child_table: "reports".into(),
            child_key: "customer_id".into(),
        };
        contract
    }

    #[test]
    fn test_valid_contract_passes() {
        let contract = base_contract();
        assert!(validate_contract(&contract, &catalog()).is_ok());
    }

    #[test]
    fn test_unmapped_token_rejected() {
        let mut contract = base_contract();
        contract.tokens.scalars.push("report_title".into());
        let err = validate_contract(&contract, &catalog()).unwrap_err();
        assert!(err.to_string().contains("report_title"));
    }

    #[test]
    fn test_binding_classification() {
        let cat = catalog();
        assert_eq!(
            Binding::classify("customers.name", &cat).unwrap(),
            Binding::CatalogColumn("customers.name".into())
        );
        assert_eq!(
            Binding::classify("PARAM:from_date", &cat).unwrap(),
            Binding::Param("from_date".into())
        );
        assert_eq!(
            Binding::classify("params.batch_id", &cat).unwrap(),
            Binding::Param("batch_id".into())
        );
        assert_eq!(
            Binding::classify("header.report_no", &cat).unwrap(),
            Binding::Dataset { dataset: "header".into(), column: "report_no".into() }
        );
        assert!(matches!(
            Binding::classify("ROUND(reports.amount, 2)", &cat).unwrap(),
            Binding::SqlExpression(_)
        ));
    }

    #[test]
    fn test_binding_outside_catalog_rejected() {
        let err = Binding::classify("SUM(ledger.amount)", &catalog()).unwrap_err();
        assert!(err.contains("outside catalog"));
    }

    #[test]
    fn test_legacy_wrapper_rejected() {
        let err = Binding::classify("DERIVED: reports.amount", &catalog()).unwrap_err();
        assert!(err.contains("legacy wrapper"));
    }

    #[test]
    fn test_empty_join_rejected() {
        let mut contract = base_contract();
        contract.join.child_key = String::new();
        let err = validate_contract(&contract, &catalog()).unwrap_err();
        assert!(err.to_string().contains("join.child_key"));
    }

    #[test]
    fn test_unresolved_rejected_at_acceptance() {
        let mut contract = base_contract();
        contract.unresolved.push("mystery_token".into());
        assert!(validate_contract(&contract, &catalog()).is_err());
    }

    #[test]
    fn test_reshape_rule_needs_purpose() {
        let mut contract = base_contract();
        contract.reshape_rules.push(ReshapeRule::default());
        assert!(validate_contract(&contract, &catalog()).is_err());
    }

    #[test]
    fn test_default_row_order() {
        let contract = Contract::default();
        assert_eq!(contract.row_order, vec!["ROWID"]);
        assert_eq!(contract.order_by.rows, vec!["ROWID"]);
    }
}
