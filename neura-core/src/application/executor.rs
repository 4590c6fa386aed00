// neura-core/src/application/executor.rs

// Contract-driven SQL execution: bind parameters, run the three entrypoints
// sequentially over one engine snapshot, and project the results onto
// tokens. Scalar projection is position-then-name with the generator's
// output_schemas as the authority. Formatters only touch rendered values;
// the stored values stay raw.

use crate::application::pipeline::generator::GeneratorAssets;
use crate::domain::error::DomainError;
use crate::error::NeuraError;
use crate::ports::connector::{AnalyticConnector, QueryResult};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, info};

#[allow(clippy::expect_used)]
static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^:]):([A-Za-z_][A-Za-z0-9_]*)").expect("param regex")
});

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportData {
    pub scalars: BTreeMap<String, Value>,
    pub rows: Vec<BTreeMap<String, Value>>,
    pub totals: BTreeMap<String, Value>,
}

/// Render a JSON value as a SQL literal. Strings are quoted with doubled
/// single quotes; null stays NULL so optional-filter guards work.
fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Substitute `:name` placeholders with literals. Required parameters must
/// be present and non-null; optional parameters default to NULL so the
/// generated `(:param IS NULL OR expr = :param)` guards disable themselves.
pub fn bind_parameters(
    sql: &str,
    params: &BTreeMap<String, Value>,
    required: &[String],
    optional: &[String],
) -> Result<String, NeuraError> {
    for name in required {
        match params.get(name) {
            Some(Value::Null) | None => {
                return Err(NeuraError::Domain(DomainError::MissingParameter(name.clone())));
            }
            Some(_) => {}
        }
    }

    let bound = PARAM_RE.replace_all(sql, |caps: &regex::Captures<'_>| {
        let prefix = &caps[1];
        let name = &caps[2];
        let value = params.get(name).cloned().unwrap_or(Value::Null);
        if value.is_null() && !optional.contains(&name.to_string()) && !required.contains(&name.to_string()) {
            // Unknown placeholder: leave it for the engine to reject.
            return format!("{prefix}:{name}");
        }
        format!("{prefix}{}", sql_literal(&value))
    });
    Ok(bound.into_owned())
}

/// Position-then-name projection of one result row onto a token list.
fn project_row(result: &QueryResult, row_idx: usize, tokens: &[String]) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    let row = match result.rows.get(row_idx) {
        Some(row) => row,
        None => return out,
    };
    for (pos, token) in tokens.iter().enumerate() {
        let value = if pos < row.len() && result.columns.get(pos).is_some() {
            // Positional wins when the projection width covers the token.
            row.get(pos).cloned()
        } else {
            result.value(row_idx, token).cloned()
        };
        out.insert(token.clone(), value.unwrap_or(Value::Null));
    }
    out
}

/// Execute header, rows and totals sequentially against one connector
/// snapshot. Cancellation is polled by the caller between entrypoints.
pub async fn execute_entrypoints(
    connector: &dyn AnalyticConnector,
    assets: &GeneratorAssets,
    params: &BTreeMap<String, Value>,
    mut cancel_check: impl FnMut() -> Result<(), NeuraError>,
) -> Result<ReportData, NeuraError> {
    let required = &assets.params.required;
    let optional = &assets.params.optional;

    cancel_check()?;
    let header_sql = bind_parameters(&assets.sql.header, params, required, optional)?;
    debug!(sql = %header_sql, "executing header");
    let header = connector.query(&header_sql).await?;
    if header.len() != 1 {
        return Err(NeuraError::InternalError(format!(
            "header query must return exactly one row, got {}",
            header.len()
        )));
    }
    let header_tokens = assets
        .output_schemas
        .get("header")
        .cloned()
        .unwrap_or_else(|| assets.contract.tokens.scalars.clone());
    let scalars = project_row(&header, 0, &header_tokens);

    cancel_check()?;
    let rows_sql = bind_parameters(&assets.sql.rows, params, required, optional)?;
    debug!(sql = %rows_sql, "executing rows");
    let rows_result = connector.query(&rows_sql).await?;
    let row_tokens = assets
        .output_schemas
        .get("rows")
        .cloned()
        .unwrap_or_else(|| assets.contract.tokens.row_tokens.clone());
    let rows: Vec<BTreeMap<String, Value>> = (0..rows_result.len())
        .map(|idx| project_row(&rows_result, idx, &row_tokens))
        .collect();

    cancel_check()?;
    let totals_sql = bind_parameters(&assets.sql.totals, params, required, optional)?;
    debug!(sql = %totals_sql, "executing totals");
    let totals_result = connector.query(&totals_sql).await?;
    if totals_result.len() != 1 {
        return Err(NeuraError::InternalError(format!(
            "totals query must return exactly one row, got {}",
            totals_result.len()
        )));
    }
    let totals_tokens = assets
        .output_schemas
        .get("totals")
        .cloned()
        .unwrap_or_else(|| assets.contract.tokens.totals.clone());
    let totals = project_row(&totals_result, 0, &totals_tokens);

    info!(
        rows = rows.len(),
        scalars = scalars.len(),
        totals = totals.len(),
        "report data assembled"
    );
    Ok(ReportData { scalars, rows, totals })
}

// ---------------------------------------------------------------------
// formatters
// ---------------------------------------------------------------------

#[allow(clippy::expect_used)]
static FORMATTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z_]+)(?:\(([^)]*)\))?$").expect("formatter regex")
});

/// Apply a formatter spec (`percent(2)`, `date(YYYY-MM-DD)`, `number(0)`,
/// `upper`, `lower`) to a raw value for rendering. Unknown specs and
/// unparseable inputs fall back to the plain string form.
pub fn format_value(spec: Option<&str>, value: &Value) -> String {
    let plain = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let Some(spec) = spec else {
        return plain;
    };
    let Some(caps) = FORMATTER_RE.captures(spec.trim()) else {
        return plain;
    };
    let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let arg = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");

    match name {
        "percent" => {
            let digits: usize = arg.parse().unwrap_or(2);
            match value.as_f64().or_else(|| plain.parse().ok()) {
                Some(number) => format!("{number:.digits$}%"),
                None => plain,
            }
        }
        "number" => {
            let digits: usize = arg.parse().unwrap_or(2);
            match value.as_f64().or_else(|| plain.parse().ok()) {
                Some(number) => format!("{number:.digits$}"),
                None => plain,
            }
        }
        "date" => format_date(&plain, arg),
        "upper" => plain.to_uppercase(),
        "lower" => plain.to_lowercase(),
        _ => plain,
    }
}

fn format_date(raw: &str, pattern: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let parsed = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .map(|dt| dt.date())
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%d/%m/%Y"));
    let Ok(date) = parsed else {
        return raw.to_string();
    };
    let strftime = pattern
        .replace("YYYY", "%Y")
        .replace("MM", "%m")
        .replace("DD", "%d");
    date.format(&strftime).to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::application::pipeline::generator::{ParamLists, SqlEntrypoints};
    use crate::domain::contract::Contract;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedConnector {
        results: Mutex<Vec<QueryResult>>,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AnalyticConnector for ScriptedConnector {
        async fn execute(&self, _query: &str) -> Result<(), NeuraError> {
            Ok(())
        }

        async fn query(&self, query: &str) -> Result<QueryResult, NeuraError> {
            self.queries.lock().unwrap().push(query.to_string());
            self.results
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| NeuraError::InternalError("no scripted result".into()))
        }

        async fn fetch_columns(
            &self,
            _table_name: &str,
        ) -> Result<Vec<crate::ports::connector::ColumnSchema>, NeuraError> {
            Ok(vec![])
        }

        async fn register_sqlite(
            &self,
            _db_path: &std::path::Path,
        ) -> Result<Vec<String>, NeuraError> {
            Ok(vec![])
        }

        fn engine_name(&self) -> &str {
            "scripted"
        }
    }

    fn assets() -> GeneratorAssets {
        let mut contract = Contract::default();
        contract.tokens.scalars = vec!["customer".into()];
        contract.tokens.row_tokens = vec!["row_amount".into(), "row_date".into()];
        contract.tokens.totals = vec!["total_amount".into()];
        let mut output_schemas = BTreeMap::new();
        output_schemas.insert("header".into(), vec!["customer".into()]);
        output_schemas.insert("rows".into(), vec!["row_amount".into(), "row_date".into()]);
        output_schemas.insert("totals".into(), vec!["total_amount".into()]);
        GeneratorAssets {
            sql: SqlEntrypoints {
                header: "SELECT name FROM customers WHERE id = :customer_id".into(),
                rows: "SELECT amount, reading_date FROM readings WHERE (:batch IS NULL OR batch = :batch) ORDER BY rowid".into(),
                totals: "SELECT SUM(amount) FROM readings".into(),
            },
            output_schemas,
            params: ParamLists {
                required: vec!["customer_id".into()],
                optional: vec!["batch".into()],
            },
            contract,
            needs_user_fix: vec![],
            invalid: false,
            dialect: "sqlite".into(),
        }
    }

    fn scripted(header: QueryResult, rows: QueryResult, totals: QueryResult) -> ScriptedConnector {
        // Results pop back-to-front.
        ScriptedConnector {
            results: Mutex::new(vec![totals, rows, header]),
            queries: Mutex::new(Vec::new()),
        }
    }

    fn result(columns: &[&str], rows: Vec<Vec<Value>>) -> QueryResult {
        QueryResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn test_bind_parameters_required_and_optional() {
        let mut params = BTreeMap::new();
        params.insert("customer_id".to_string(), serde_json::json!(7));
        let sql = bind_parameters(
            "SELECT * FROM t WHERE id = :customer_id AND (:batch IS NULL OR batch = :batch)",
            &params,
            &["customer_id".to_string()],
            &["batch".to_string()],
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE id = 7 AND (NULL IS NULL OR batch = NULL)");
    }

    #[test]
    fn test_bind_parameters_missing_required() {
        let err = bind_parameters(
            "SELECT :customer_id",
            &BTreeMap::new(),
            &["customer_id".to_string()],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, NeuraError::Domain(DomainError::MissingParameter(_))));
    }

    #[test]
    fn test_bind_parameters_escapes_strings() {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), serde_json::json!("O'Brien"));
        let sql = bind_parameters("SELECT :name", &params, &[], &["name".to_string()]).unwrap();
        assert_eq!(sql, "SELECT 'O''Brien'");
    }

    #[tokio::test]
    async fn test_execute_projects_position_then_name() {
        // Header projects by position even though the column alias differs.
        let connector = scripted(
            result(&["name"], vec![vec![serde_json::json!("Alice")]]),
            result(
                &["amount", "reading_date"],
                vec![
                    vec![serde_json::json!(10.0), serde_json::json!("2024-01-05")],
                    vec![serde_json::json!(20.0), serde_json::json!("2024-01-09")],
                ],
            ),
            result(&["sum"], vec![vec![serde_json::json!(30.0)]]),
        );
        let mut params = BTreeMap::new();
        params.insert("customer_id".to_string(), serde_json::json!(1));
        let data = execute_entrypoints(&connector, &assets(), &params, || Ok(()))
            .await
            .unwrap();
        assert_eq!(data.scalars.get("customer"), Some(&serde_json::json!("Alice")));
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[1].get("row_date"), Some(&serde_json::json!("2024-01-09")));
        assert_eq!(data.totals.get("total_amount"), Some(&serde_json::json!(30.0)));
    }

    #[tokio::test]
    async fn test_header_must_return_one_row() {
        let connector = scripted(
            result(&["name"], vec![]),
            result(&["amount", "reading_date"], vec![]),
            result(&["sum"], vec![vec![Value::Null]]),
        );
        let mut params = BTreeMap::new();
        params.insert("customer_id".to_string(), serde_json::json!(1));
        let err = execute_entrypoints(&connector, &assets(), &params, || Ok(()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exactly one row"));
    }

    #[tokio::test]
    async fn test_zero_rows_is_not_an_error() {
        let connector = scripted(
            result(&["name"], vec![vec![serde_json::json!("Alice")]]),
            result(&["amount", "reading_date"], vec![]),
            result(&["sum"], vec![vec![Value::Null]]),
        );
        let mut params = BTreeMap::new();
        params.insert("customer_id".to_string(), serde_json::json!(1));
        let data = execute_entrypoints(&connector, &assets(), &params, || Ok(()))
            .await
            .unwrap();
        assert!(data.rows.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_poll_aborts_between_selects() {
        let connector = scripted(
            result(&["name"], vec![vec![serde_json::json!("Alice")]]),
            result(&["amount", "reading_date"], vec![]),
            result(&["sum"], vec![vec![Value::Null]]),
        );
        let mut params = BTreeMap::new();
        params.insert("customer_id".to_string(), serde_json::json!(1));
        let mut polls = 0;
        let err = execute_entrypoints(&connector, &assets(), &params, || {
            polls += 1;
            if polls >= 2 {
                Err(NeuraError::Domain(DomainError::JobCancelled))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, NeuraError::Domain(DomainError::JobCancelled)));
        // Only the header ran.
        assert_eq!(connector.queries.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_format_value_percent_and_date() {
        assert_eq!(format_value(Some("percent(2)"), &serde_json::json!(12.3456)), "12.35%");
        assert_eq!(format_value(Some("number(0)"), &serde_json::json!(12.6)), "13");
        assert_eq!(
            format_value(Some("date(YYYY-MM-DD)"), &serde_json::json!("2024-01-05 10:30:00")),
            "2024-01-05"
        );
        assert_eq!(
            format_value(Some("date(DD/MM/YYYY)"), &serde_json::json!("2024-01-05")),
            "05/01/2024"
        );
        assert_eq!(format_value(Some("upper"), &serde_json::json!("abc")), "ABC");
        assert_eq!(format_value(None, &serde_json::json!(5)), "5");
        assert_eq!(format_value(Some("mystery(9)"), &serde_json::json!("x")), "x");
    }
}
