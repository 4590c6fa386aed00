// neura-core/src/domain/template.rs

use crate::domain::error::DomainError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static TEMPLATE_ID_SAFE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_-]{2,180}$").expect("template id regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Pdf,
    Excel,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::Pdf => "pdf",
            TemplateKind::Excel => "excel",
        }
    }
}

impl std::str::FromStr for TemplateKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" | "" => Ok(TemplateKind::Pdf),
            "excel" => Ok(TemplateKind::Excel),
            other => Err(DomainError::Validation(format!(
                "Unsupported template kind: {other}"
            ))),
        }
    }
}

impl Default for TemplateKind {
    fn default() -> Self {
        TemplateKind::Pdf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    #[default]
    Draft,
    MappingPreviewed,
    MappingCorrectionsPreviewed,
    Approved,
    Pending,
}

impl TemplateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Draft => "draft",
            TemplateStatus::MappingPreviewed => "mapping_previewed",
            TemplateStatus::MappingCorrectionsPreviewed => "mapping_corrections_previewed",
            TemplateStatus::Approved => "approved",
            TemplateStatus::Pending => "pending",
        }
    }
}

/// Generator metadata recorded by the last generator-assets stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeneratorMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub needs_user_fix: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: String,
    pub name: String,
    pub status: TemplateStatus,
    #[serde(default)]
    pub kind: TemplateKind,
    /// Artifact name -> served URL; empty values are dropped on upsert.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mapping_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<GeneratorMeta>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalize a raw template id into its canonical safe form.
///
/// Accepts lowercase slugs matching the safe pattern, or UUIDs (normalized
/// to hyphenated lowercase). Path separators are stripped to their last
/// segment before validation, which closes the traversal vector.
pub fn normalize_template_id(raw: &str) -> Result<String, DomainError> {
    let trimmed = raw.trim();
    let candidate = trimmed
        .replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if candidate.is_empty() || candidate == "." || candidate == ".." {
        return Err(DomainError::InvalidTemplateId(raw.to_string()));
    }
    let lowered = candidate.to_ascii_lowercase();
    if TEMPLATE_ID_SAFE_RE.is_match(&lowered) {
        return Ok(lowered);
    }
    uuid::Uuid::parse_str(&candidate)
        .map(|u| u.to_string())
        .map_err(|_| DomainError::InvalidTemplateId(raw.to_string()))
}

/// Dedup while preserving first-seen order, dropping blanks.
pub fn normalize_string_list<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for raw in values {
        let text = raw.as_ref().trim().to_string();
        if text.is_empty() || !seen.insert(text.clone()) {
            continue;
        }
        out.push(text);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_template_id_slug() {
        assert_eq!(normalize_template_id("monthly-report_01").unwrap(), "monthly-report_01");
        assert_eq!(normalize_template_id("  Monthly-Report  ").unwrap(), "monthly-report");
    }

    #[test]
    fn test_normalize_template_id_uuid() {
        let id = "6F9619FF-8B86-D011-B42D-00C04FC964FF";
        assert_eq!(
            normalize_template_id(id).unwrap(),
            "6f9619ff-8b86-d011-b42d-00c04fc964ff"
        );
    }

    #[test]
    fn test_normalize_template_id_strips_path() {
        assert_eq!(normalize_template_id("a/b/my-template").unwrap(), "my-template");
        assert_eq!(normalize_template_id(r"c:\evil\my-template").unwrap(), "my-template");
    }

    #[test]
    fn test_normalize_template_id_rejects_traversal() {
        assert!(normalize_template_id("..").is_err());
        assert!(normalize_template_id("").is_err());
        assert!(normalize_template_id("ab").is_err());
        assert!(normalize_template_id("UPPER!").is_err());
    }

    #[test]
    fn test_normalize_string_list_dedup_order() {
        let out = normalize_string_list(["b", " a ", "b", "", "c", "a"]);
        assert_eq!(out, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_kind_parse() {
        use std::str::FromStr;
        assert_eq!(TemplateKind::from_str("pdf").unwrap(), TemplateKind::Pdf);
        assert_eq!(TemplateKind::from_str("EXCEL").unwrap(), TemplateKind::Excel);
        assert!(TemplateKind::from_str("csv").is_err());
    }
}
