// neura-core/src/application/render.rs

// Deterministic token substitution into the template HTML. Header and
// totals tokens substitute once; row tokens substitute per row dict into a
// cloned copy of the row prototype. Page tokens become placeholder spans
// filled by the PDF renderer.

use crate::application::executor::{ReportData, format_value};
use crate::domain::contract::Contract;
use crate::domain::tokens;
use crate::error::NeuraError;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::warn;

pub const PAGE_NUMBER_SPAN: &str = "<span class=\"nr-page-number\"></span>";
pub const PAGE_COUNT_SPAN: &str = "<span class=\"nr-page-count\"></span>";

#[allow(clippy::expect_used)]
static REPEAT_REGION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<!--\s*BEGIN:BLOCK_REPEAT[^>]*-->(.*?)<!--\s*END:BLOCK_REPEAT[^>]*-->")
        .expect("repeat region regex")
});

#[allow(clippy::expect_used)]
static TR_PROTOTYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<tr\b[^>]*>.*?</tr>").expect("tr prototype regex")
});

#[allow(clippy::expect_used)]
static TBODY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)(<tbody\b[^>]*>)(.*?)(</tbody>)").expect("tbody regex")
});

/// The run-scoped values that fill REPORT_SELECTED tokens.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub start_date: String,
    pub end_date: String,
    pub key_values: BTreeMap<String, Value>,
}

fn is_page_count_token(token: &str) -> bool {
    let lowered = token.to_ascii_lowercase();
    lowered.contains("count") || lowered.contains("total")
}

fn report_selected_value(token: &str, ctx: &RunContext) -> Option<String> {
    if let Some(value) = ctx.key_values.get(token) {
        return Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    let parts: Vec<String> = token
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    let has = |word: &str| parts.iter().any(|p| p == word);
    if has("page") || has("sheet") {
        return Some(
            if is_page_count_token(token) { PAGE_COUNT_SPAN } else { PAGE_NUMBER_SPAN }.to_string(),
        );
    }
    if has("from") || has("start") || has("begin") {
        return Some(ctx.start_date.clone());
    }
    if has("to") || has("end") || has("thru") || has("through") {
        return Some(ctx.end_date.clone());
    }
    None
}

fn formatted(contract: &Contract, token: &str, value: &Value) -> String {
    format_value(contract.formatters.get(token).map(String::as_str), value)
}

fn fill_scalars(
    mut html: String,
    contract: &Contract,
    data: &ReportData,
    ctx: &RunContext,
) -> String {
    for (token, value) in data.scalars.iter().chain(data.totals.iter()) {
        html = tokens::replace_token(&html, token, &formatted(contract, token, value));
    }
    // REPORT_SELECTED tokens come from the run window, the key values or the
    // pagination spans, never from SQL.
    for (token, binding) in &contract.mapping {
        if binding != crate::domain::contract::REPORT_SELECTED_VALUE {
            continue;
        }
        if let Some(value) = report_selected_value(token, ctx) {
            html = tokens::replace_token(&html, token, &value);
        }
    }
    html
}

fn fill_row(prototype: &str, contract: &Contract, row: &BTreeMap<String, Value>) -> String {
    let mut filled = prototype.to_string();
    for (token, value) in row {
        filled = tokens::replace_token(&filled, token, &formatted(contract, token, value));
    }
    filled
}

/// Expand the row prototype inside a tbody body. Zero rows drop the
/// prototype entirely; the surrounding table chrome stays.
fn expand_tbody_body(body: &str, contract: &Contract, rows: &[BTreeMap<String, Value>]) -> String {
    let Some(proto_match) = TR_PROTOTYPE_RE.find(body) else {
        return body.to_string();
    };
    let prototype = proto_match.as_str();
    if !tokens::extract_tokens(prototype).iter().any(|t| tokens::is_row_token(t)) {
        return body.to_string();
    }
    let expanded: String = rows
        .iter()
        .map(|row| fill_row(prototype, contract, row))
        .collect::<Vec<_>>()
        .join("\n");
    body.replacen(prototype, &expanded, 1)
}

fn expand_rows(html: &str, contract: &Contract, rows: &[BTreeMap<String, Value>]) -> String {
    let mut expanded_any = false;
    let with_regions = REPEAT_REGION_RE
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let region = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let region_expanded = TBODY_RE
                .replace_all(region, |tb: &regex::Captures<'_>| {
                    format!("{}{}{}", &tb[1], expand_tbody_body(&tb[2], contract, rows), &tb[3])
                })
                .into_owned();
            if region_expanded != region {
                expanded_any = true;
            }
            region_expanded
        })
        .into_owned();
    if expanded_any {
        return with_regions;
    }
    // No marked region matched (or markers absent): fall back to the first
    // tbody carrying row tokens.
    TBODY_RE
        .replace(html, |tb: &regex::Captures<'_>| {
            format!("{}{}{}", &tb[1], expand_tbody_body(&tb[2], contract, rows), &tb[3])
        })
        .into_owned()
}

/// Fill the template with assembled report data.
pub fn render_report_html(
    template_html: &str,
    contract: &Contract,
    data: &ReportData,
    ctx: &RunContext,
) -> Result<String, NeuraError> {
    if tokens::has_mixed_spellings(template_html) {
        warn!("template mixes {{token}} and {{{{ token }}}} placeholder spellings");
    }
    let html = expand_rows(template_html, contract, &data.rows);
    Ok(fill_scalars(html, contract, data, ctx))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::domain::contract::REPORT_SELECTED_VALUE;

    fn contract() -> Contract {
        let mut contract = Contract::default();
        contract.tokens.scalars = vec!["customer".into()];
        contract.tokens.row_tokens = vec!["row_amount".into()];
        contract.tokens.totals = vec!["total_amount".into()];
        contract.mapping.insert("customer".into(), "customers.name".into());
        contract.mapping.insert("row_amount".into(), "readings.amount".into());
        contract.mapping.insert("total_amount".into(), "SUM(readings.amount)".into());
        contract.mapping.insert("from_date".into(), REPORT_SELECTED_VALUE.into());
        contract.mapping.insert("page_info".into(), REPORT_SELECTED_VALUE.into());
        contract.formatters.insert("row_amount".into(), "number(2)".into());
        contract
    }

    const TEMPLATE: &str = concat!(
        "<h1>{customer}</h1><p>From {from_date}</p><p>Page {page_info}</p>",
        "<!--BEGIN:BLOCK_REPEAT rows-->",
        "<table><tbody><tr><td>{row_amount}</td></tr></tbody></table>",
        "<!--END:BLOCK_REPEAT rows-->",
        "<p>Total: {total_amount}</p>"
    );

    fn data(rows: Vec<f64>) -> ReportData {
        let mut data = ReportData::default();
        data.scalars.insert("customer".into(), serde_json::json!("Alice"));
        data.totals.insert(
            "total_amount".into(),
            serde_json::json!(rows.iter().sum::<f64>()),
        );
        data.rows = rows
            .into_iter()
            .map(|amount| {
                let mut row = BTreeMap::new();
                row.insert("row_amount".to_string(), serde_json::json!(amount));
                row
            })
            .collect();
        data
    }

    fn ctx() -> RunContext {
        RunContext {
            start_date: "2024-01-01".into(),
            end_date: "2024-01-31".into(),
            key_values: BTreeMap::new(),
        }
    }

    #[test]
    fn test_rows_expand_per_row_dict() {
        let html = render_report_html(TEMPLATE, &contract(), &data(vec![10.0, 20.5]), &ctx()).unwrap();
        assert!(html.contains("<td>10.00</td>"));
        assert!(html.contains("<td>20.50</td>"));
        assert_eq!(html.matches("<tr>").count(), 2);
        assert!(!html.contains("{row_amount}"));
    }

    #[test]
    fn test_zero_rows_drop_prototype() {
        let html = render_report_html(TEMPLATE, &contract(), &data(vec![]), &ctx()).unwrap();
        assert!(!html.contains("{row_amount}"));
        assert!(html.contains("<tbody>"));
        assert_eq!(html.matches("<tr>").count(), 0);
    }

    #[test]
    fn test_scalars_and_totals_substitute_once() {
        let html = render_report_html(TEMPLATE, &contract(), &data(vec![1.0]), &ctx()).unwrap();
        assert!(html.contains("<h1>Alice</h1>"));
        assert!(html.contains("Total: 1"));
    }

    #[test]
    fn test_report_selected_fills_window_and_page_spans() {
        let html = render_report_html(TEMPLATE, &contract(), &data(vec![1.0]), &ctx()).unwrap();
        assert!(html.contains("From 2024-01-01"));
        assert!(html.contains(PAGE_NUMBER_SPAN));
    }

    #[test]
    fn test_key_values_win_over_heuristics() {
        let mut run_ctx = ctx();
        run_ctx
            .key_values
            .insert("from_date".to_string(), serde_json::json!("OVERRIDDEN"));
        let html = render_report_html(TEMPLATE, &contract(), &data(vec![1.0]), &run_ctx).unwrap();
        assert!(html.contains("From OVERRIDDEN"));
    }

    #[test]
    fn test_double_brace_spelling_supported() {
        let template = "<p>{{ customer }}</p>";
        let html = render_report_html(template, &contract(), &data(vec![]), &ctx()).unwrap();
        assert_eq!(html, "<p>Alice</p>");
    }
}
