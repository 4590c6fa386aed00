// neura-core/src/application/pipeline/cache.rs

// Deterministic cache keys. A stage short-circuits its LLM call when the
// sha256 over its declared inputs matches the previously persisted key and
// the manifest checksums still hold.

use crate::infrastructure::artifacts::sha256_hex;

pub fn text_sha256(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// sha256 over sorted unique catalog lines.
pub fn catalog_sha256<I, S>(catalog: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut lines: Vec<String> = catalog
        .into_iter()
        .map(|line| line.as_ref().trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    lines.sort();
    lines.dedup();
    sha256_hex(lines.join("\n").as_bytes())
}

/// sha256 over the canonical JSON (sorted keys) of the schema; null input
/// hashes the literal string "null".
pub fn schema_sha256(schema: Option<&serde_json::Value>) -> String {
    match schema {
        // serde_json maps are ordered by key, so to_string is canonical.
        Some(value) => sha256_hex(value.to_string().as_bytes()),
        None => sha256_hex(b"null"),
    }
}

pub fn prompt_sha256(system: &str, user: &str) -> String {
    sha256_hex(format!("{}\n---\n{}", system.trim(), user.trim()).as_bytes())
}

/// Auto-Map cache key (normative inputs).
pub struct AutoMapKeyInputs<'a> {
    pub pdf_sha: &'a str,
    pub db_signature: &'a str,
    pub html_sha: &'a str,
    pub prompt_version: &'a str,
    pub catalog_sha: &'a str,
    pub schema_sha: &'a str,
}

pub fn automap_cache_key(inputs: &AutoMapKeyInputs<'_>) -> String {
    sha256_hex(
        format!(
            "{}|{}|{}|{}|{}|{}",
            inputs.pdf_sha,
            inputs.db_signature,
            inputs.html_sha,
            inputs.prompt_version,
            inputs.catalog_sha,
            inputs.schema_sha
        )
        .as_bytes(),
    )
}

/// Corrections cache key (normative inputs).
pub struct CorrectionsKeyInputs<'a> {
    pub template_pre_sha: &'a str,
    pub mapping_sha: &'a str,
    pub user_input_sha: &'a str,
    pub model: &'a str,
    pub prompt_version: &'a str,
}

pub fn corrections_cache_key(inputs: &CorrectionsKeyInputs<'_>) -> String {
    sha256_hex(
        format!(
            "{}|{}|{}|{}|{}",
            inputs.template_pre_sha,
            inputs.mapping_sha,
            inputs.user_input_sha,
            inputs.model,
            inputs.prompt_version
        )
        .as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_sha_order_independent() {
        let a = catalog_sha256(["b.col", "a.col", "a.col", " c.col "]);
        let b = catalog_sha256(["c.col", "a.col", "b.col"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_schema_sha_null_sentinel() {
        assert_eq!(schema_sha256(None), text_sha256("null"));
        let value = serde_json::json!({"scalars": ["a"]});
        assert_ne!(schema_sha256(Some(&value)), schema_sha256(None));
    }

    #[test]
    fn test_schema_sha_key_order_canonical() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap_or_default();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap_or_default();
        assert_eq!(schema_sha256(Some(&a)), schema_sha256(Some(&b)));
    }

    #[test]
    fn test_automap_key_sensitive_to_each_input() {
        let base = AutoMapKeyInputs {
            pdf_sha: "p",
            db_signature: "d",
            html_sha: "h",
            prompt_version: "v4",
            catalog_sha: "c",
            schema_sha: "s",
        };
        let key = automap_cache_key(&base);
        let changed = AutoMapKeyInputs { html_sha: "h2", ..base };
        assert_ne!(key, automap_cache_key(&changed));
    }
}
