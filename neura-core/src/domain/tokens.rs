// neura-core/src/domain/tokens.rs

// Token grammar shared by the pipeline stages and the renderer.
// Placeholders come in two spellings: `{token}` and `{{ token }}`.
// Row regions are wrapped between BLOCK_REPEAT comment markers and carry
// exactly one `<tbody><tr>` prototype each.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("token regex")
});

#[allow(clippy::expect_used)]
static REPEAT_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<!--\s*(BEGIN:BLOCK_REPEAT|END:BLOCK_REPEAT)[^>]*-->").expect("marker regex")
});

#[allow(clippy::expect_used)]
static TBODY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<tbody\b").expect("tbody regex")
});

#[allow(clippy::expect_used)]
static TBODY_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)(<tbody\b[^>]*>)(.*?)(</tbody>)").expect("tbody block regex")
});

#[allow(clippy::expect_used)]
static TR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<tr\b").expect("tr regex")
});

#[allow(clippy::expect_used)]
static DATA_REGION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)data-region\s*=\s*["']([^"']+)["']"#).expect("data-region regex")
});

#[allow(clippy::expect_used)]
static DATE_LIKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(date|time|month|year)").expect("date-like regex")
});

/// Extract the set of placeholder tokens present in an HTML document.
/// Both spellings are recognised; the set is deterministic (sorted).
pub fn extract_tokens(html: &str) -> BTreeSet<String> {
    TOKEN_RE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// True when the template mixes `{token}` and `{{ token }}` spellings.
pub fn has_mixed_spellings(html: &str) -> bool {
    let mut braced = false;
    let mut double = false;
    for caps in TOKEN_RE.captures_iter(html) {
        if caps.get(1).is_some() {
            double = true;
        } else {
            braced = true;
        }
        if braced && double {
            return true;
        }
    }
    false
}

/// Replace every occurrence of a single token (both spellings) with a literal.
pub fn replace_token(html: &str, token: &str, value: &str) -> String {
    let escaped = regex::escape(token);
    let mut updated = html.to_string();
    for pattern in [
        format!(r"\{{\{{\s*{escaped}\s*\}}\}}"),
        format!(r"\{{{escaped}\}}"),
    ] {
        if let Ok(re) = Regex::new(&pattern) {
            updated = re.replace_all(&updated, value).into_owned();
        }
    }
    updated
}

pub fn count_repeat_markers(html: &str) -> usize {
    REPEAT_MARKER_RE.find_iter(html).count()
}

pub fn count_tbody(html: &str) -> usize {
    TBODY_RE.find_iter(html).count()
}

/// Per-`<tbody>` row-prototype counts, in document order.
pub fn tbody_row_signature(html: &str) -> Vec<usize> {
    TBODY_BLOCK_RE
        .captures_iter(html)
        .map(|caps| TR_RE.find_iter(caps.get(2).map(|m| m.as_str()).unwrap_or("")).count())
        .collect()
}

pub fn data_regions(html: &str) -> BTreeSet<String> {
    DATA_REGION_RE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Row-level placeholders are dynamic by construction and never constants.
pub fn is_row_token(token: &str) -> bool {
    token.to_ascii_lowercase().starts_with("row_")
}

/// Date-like tokens are never inlined as constants.
pub fn is_date_like(token: &str) -> bool {
    DATE_LIKE_RE.is_match(token)
}

const REPORT_DATE_PREFIXES: &[&str] = &[
    "from", "to", "start", "end", "begin", "finish", "through", "thru",
];
const REPORT_DATE_KEYWORDS: &[&str] = &[
    "date", "dt", "day", "period", "range", "time", "timestamp", "window", "month", "year",
];
const REPORT_SELECTED_EXACT: &[&str] = &[
    "page_info",
    "page_number",
    "page_no",
    "page_num",
    "page_count",
    "page_total",
    "page_total_count",
];
const REPORT_SELECTED_KEYWORDS: &[&str] = &["page", "sheet"];
const REPORT_SELECTED_SUFFIXES: &[&str] = &["info", "number", "no", "num", "count", "label", "total"];

fn normalized_token_parts(token: &str) -> Vec<String> {
    let lowered = token.to_ascii_lowercase();
    let mut parts = Vec::new();
    let mut current = String::new();
    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() {
            current.push(ch);
        } else if !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Heuristic for tokens that the report generator fills from the selected
/// date window or pagination, never from the database: `from_date`,
/// `page_info`, `period_to`, `sheet_no`...
pub fn is_report_filter_token(token: &str) -> bool {
    let parts = normalized_token_parts(token);
    if parts.is_empty() {
        return false;
    }
    let lowered = token.to_ascii_lowercase();
    if REPORT_SELECTED_EXACT.contains(&lowered.as_str()) {
        return true;
    }
    let has = |set: &[&str], part: &str| set.contains(&part);
    if parts.iter().any(|p| has(REPORT_SELECTED_KEYWORDS, p))
        && parts.iter().any(|p| has(REPORT_SELECTED_SUFFIXES, p))
    {
        return true;
    }

    let has_prefix = parts.iter().any(|p| has(REPORT_DATE_PREFIXES, p));
    let has_keyword = parts.iter().any(|p| has(REPORT_DATE_KEYWORDS, p));
    if has_prefix && has_keyword {
        return true;
    }

    // allow tokens like date_from or period_to
    if has(REPORT_DATE_KEYWORDS, &parts[0])
        && parts[1..].iter().any(|p| has(REPORT_DATE_PREFIXES, p))
    {
        return true;
    }
    if has(REPORT_DATE_KEYWORDS, &parts[parts.len() - 1])
        && parts[..parts.len() - 1]
            .iter()
            .any(|p| has(REPORT_DATE_PREFIXES, p))
    {
        return true;
    }

    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tokens_both_spellings() {
        let html = "<h1>{report_title}</h1><p>{{ report_date }}</p><td>{row_amount}</td>";
        let tokens = extract_tokens(html);
        assert_eq!(
            tokens.iter().cloned().collect::<Vec<_>>(),
            vec!["report_date", "report_title", "row_amount"]
        );
    }

    #[test]
    fn test_mixed_spellings_detection() {
        assert!(has_mixed_spellings("{a} and {{ b }}"));
        assert!(!has_mixed_spellings("{a} and {b}"));
        assert!(!has_mixed_spellings("{{ a }} only"));
    }

    #[test]
    fn test_replace_token_both_spellings() {
        let html = "<p>{title}</p><p>{{ title }}</p>";
        let out = replace_token(html, "title", "Consumption Report");
        assert_eq!(out, "<p>Consumption Report</p><p>Consumption Report</p>");
    }

    #[test]
    fn test_replace_token_leaves_others() {
        let html = "<p>{title}</p><p>{subtitle}</p>";
        let out = replace_token(html, "title", "X");
        assert!(out.contains("{subtitle}"));
    }

    #[test]
    fn test_tbody_row_signature() {
        let html = "<table><tbody><tr></tr><tr></tr></tbody></table><tbody><tr></tr></tbody>";
        assert_eq!(tbody_row_signature(html), vec![2, 1]);
    }

    #[test]
    fn test_repeat_markers_counted() {
        let html = "<!--BEGIN:BLOCK_REPEAT rows--><tr></tr><!--END:BLOCK_REPEAT rows-->";
        assert_eq!(count_repeat_markers(html), 2);
    }

    #[test]
    fn test_data_regions() {
        let html = r#"<div data-region="header"></div><div data-region="rows"></div>"#;
        let regions = data_regions(html);
        assert!(regions.contains("header"));
        assert!(regions.contains("rows"));
    }

    #[test]
    fn test_report_filter_tokens() {
        for token in ["from_date", "to_date", "page_info", "date_from", "period_to", "sheet_no"] {
            assert!(is_report_filter_token(token), "{token} should be a report filter");
        }
        for token in ["customer_name", "total_amount", "row_quantity"] {
            assert!(!is_report_filter_token(token), "{token} should not be a report filter");
        }
    }

    #[test]
    fn test_date_like_never_constant() {
        assert!(is_date_like("report_date"));
        assert!(is_date_like("billing_month"));
        assert!(!is_date_like("report_title"));
    }
}
