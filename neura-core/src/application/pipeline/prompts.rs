// neura-core/src/application/pipeline/prompts.rs

// Prompt builders for the five pipeline stages. Each renders a minijinja
// template with the stage inputs; the sha of the rendered prompt feeds the
// stage's cache key and logs.

use crate::error::NeuraError;
use crate::infrastructure::error::InfrastructureError;
use minijinja::{Environment, context};

pub const PROMPT_VERSION_SCHEMA: &str = "template_schema_page_v2";
pub const PROMPT_VERSION_INITIAL_HTML: &str = "template_initial_html_v2";
pub const PROMPT_VERSION_FIX: &str = "template_fix_html_v2";
pub const PROMPT_VERSION_AUTOMAP: &str = "mapping_inline_v4";
pub const PROMPT_VERSION_CORRECTIONS: &str = "corrections_v3_5";
pub const PROMPT_VERSION_CONTRACT: &str = "contract_v4";
pub const PROMPT_VERSION_GENERATOR: &str = "generator_assets_v5";

#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

fn render(template: &str, ctx: minijinja::Value) -> Result<String, NeuraError> {
    let env = Environment::new();
    env.render_str(template, ctx)
        .map_err(|e| NeuraError::Infrastructure(InfrastructureError::Template(e)))
}

const SCHEMA_SYSTEM: &str = "You read a scanned report page and emit a strict JSON object \
describing its placeholder schema. Respond with JSON only.";

const SCHEMA_USER: &str = r#"Study the attached page image and emit:
{"scalars": {"<token>": "<label>"}, "row_tokens": ["row_<token>", ...], "totals": ["<token>", ...], "notes": "<free text>"}

Rules:
- Tokens are snake_case identifiers for every value that changes between runs.
- Values repeated per table row use the row_ prefix.
- Totals are the aggregate line under the table.
- Page number / date-window captions are scalars too.
LAYOUT_HINTS:
{{ hints }}"#;

const INITIAL_HTML_SYSTEM: &str = "You convert a scanned report page into a standalone HTML \
photocopy. Output only the HTML document.";

const INITIAL_HTML_USER: &str = r#"Produce one full standalone HTML document reproducing the attached
page as closely as possible (fonts, borders, column widths, spacing).

Rules:
- Every dynamic value becomes a {token} placeholder from the schema below.
- Wrap each repeating row region between <!--BEGIN:BLOCK_REPEAT rows--> and
  <!--END:BLOCK_REPEAT rows--> markers with exactly one <tbody><tr> prototype inside.
- Mark logical regions with data-region attributes (header, rows, totals).
- Inline all CSS in one <style> block; no external resources.
SCHEMA:
{{ schema }}
LAYOUT_HINTS:
{{ hints }}"#;

const FIX_SYSTEM: &str = "You compare a reference page against a rendered HTML photocopy and \
repair the differences with the smallest possible change.";

const FIX_USER: &str = r#"The current render scores SSIM={{ ssim }} against the reference
(first image = reference, second image = current render).

Respond with exactly one of:
1. <!--BEGIN_CSS_PATCH--> ... <!--END_CSS_PATCH--> containing only the CSS rules to merge
   into the existing <style> block (preferred), or
2. <!--BEGIN_HTML--> ... <!--END_HTML--> containing the full corrected document.

Never add or remove {token} placeholders or repeat markers.
SCHEMA:
{{ schema }}
CURRENT_HTML:
{{ html }}"#;

const AUTOMAP_SYSTEM: &str = "You map report template tokens to database columns. You only use \
identifiers from the provided catalog. Respond with a single JSON object.";

const AUTOMAP_USER: &str = r#"TEMPLATE_HTML:
{{ html }}

CATALOG (the only table.column identifiers that exist):
{{ catalog }}

SCHEMA:
{{ schema }}

Emit {"mapping": {...}, "token_samples": {...}, "meta": {...}} where:
- mapping values are catalog columns, SQL expressions over catalog columns,
  params.<name> references, or the literals UNRESOLVED / INPUT_SAMPLE / REPORT_SELECTED.
- Tokens filled from the user's selected date window or pagination map to REPORT_SELECTED.
- token_samples lists, for EVERY placeholder in the template, the literal value visible
  on the reference page (NOT_VISIBLE or UNREADABLE when unreadable). Never empty strings.
- Leave a token out of mapping only when its printed value is a constant of the layout.
- meta may carry unresolved, ambiguous, hints and confidence maps."#;

const CORRECTIONS_SYSTEM: &str = "You apply the operator's correction instructions to a mapped \
report template without breaking its structure. Respond with a single JSON object.";

const CORRECTIONS_USER: &str = r#"CURRENT_TEMPLATE_HTML:
{{ html }}

MAPPING:
{{ mapping }}

SCHEMA:
{{ schema }}

OPERATOR_INSTRUCTIONS:
{{ user_input }}

Emit {"final_template_html": "...", "page_summary": "..."}.
Hard rules:
- Repeat markers, <tbody> count, rows-per-<tbody> and data-region attributes are frozen.
- Never inline sample values as literals.
- page_summary is non-empty prose describing the business content of the page,
  the constants that were inlined, and any still-unresolved data."#;

const CONTRACT_SYSTEM: &str = "You turn a mapped report template into an execution contract that \
binds every token to SQL. Respond with a single JSON object.";

const CONTRACT_USER: &str = r#"FINAL_TEMPLATE_HTML:
{{ html }}

PAGE_SUMMARY:
{{ page_summary }}

SCHEMA:
{{ schema }}

AUTO_MAP:
{{ mapping }}

MAPPING_OVERRIDE:
{{ mapping_override }}

USER_INSTRUCTIONS:
{{ user_input }}

CATALOG:
{{ catalog }}

DIALECT: {{ dialect }}
KEY_TOKENS: {{ key_tokens }}

Emit {"overview_md": "...", "step5_requirements": {...}, "contract": {...}, "validation": {...}}.
Hard rules:
- contract.mapping covers every schema token; unknown tokens/columns are forbidden and
  must be reported (empty) in validation.unknown_tokens / validation.unknown_columns.
- contract.join names parent/child table+key; order_by.rows and row_order default to ["ROWID"].
- Every KEY_TOKEN appears in step5_requirements.parameters.required and in contract.mapping
  (typically as PARAM:<name>)."#;

const GENERATOR_SYSTEM: &str = "You write the final SQL pack for a report contract. Respond with \
a single JSON object.";

const GENERATOR_USER: &str = r#"CONTRACT:
{{ contract }}

CATALOG:
{{ catalog }}

DIALECT: {{ dialect }}

Emit {"sql": {"header": "...", "rows": "...", "totals": "..."},
      "output_schemas": {"header": [...], "rows": [...], "totals": [...]},
      "params": {"required": [...], "optional": [...]},
      "contract": {...echo...},
      "needs_user_fix": [], "invalid": false}.
Hard rules:
- header returns exactly one row; rows ORDER BY the contract's stable columns;
  totals applies the same required filters as rows.
- output_schemas column order matches the contract token order per dataset.
- Optional params guard their filters with (:param IS NULL OR expr = :param).
- UNION_ALL reshape rules emit one SELECT per source column, never a CASE ladder."#;

pub fn schema_prompt(hints: &serde_json::Value) -> Result<Prompt, NeuraError> {
    Ok(Prompt {
        system: SCHEMA_SYSTEM.to_string(),
        user: render(SCHEMA_USER, context! { hints => hints.to_string() })?,
    })
}

pub fn initial_html_prompt(
    schema: &serde_json::Value,
    hints: &serde_json::Value,
) -> Result<Prompt, NeuraError> {
    Ok(Prompt {
        system: INITIAL_HTML_SYSTEM.to_string(),
        user: render(
            INITIAL_HTML_USER,
            context! { schema => schema.to_string(), hints => hints.to_string() },
        )?,
    })
}

pub fn fix_prompt(
    schema: &serde_json::Value,
    current_html: &str,
    ssim: f64,
) -> Result<Prompt, NeuraError> {
    Ok(Prompt {
        system: FIX_SYSTEM.to_string(),
        user: render(
            FIX_USER,
            context! {
                schema => schema.to_string(),
                html => current_html,
                ssim => format!("{ssim:.4}"),
            },
        )?,
    })
}

pub fn automap_prompt(
    template_html: &str,
    catalog: &[String],
    schema: Option<&serde_json::Value>,
) -> Result<Prompt, NeuraError> {
    Ok(Prompt {
        system: AUTOMAP_SYSTEM.to_string(),
        user: render(
            AUTOMAP_USER,
            context! {
                html => template_html,
                catalog => catalog.join("\n"),
                schema => schema.map(|s| s.to_string()).unwrap_or_else(|| "null".to_string()),
            },
        )?,
    })
}

pub fn corrections_prompt(
    template_html: &str,
    mapping: &serde_json::Value,
    schema: Option<&serde_json::Value>,
    user_input: &str,
) -> Result<Prompt, NeuraError> {
    Ok(Prompt {
        system: CORRECTIONS_SYSTEM.to_string(),
        user: render(
            CORRECTIONS_USER,
            context! {
                html => template_html,
                mapping => mapping.to_string(),
                schema => schema.map(|s| s.to_string()).unwrap_or_else(|| "null".to_string()),
                user_input => user_input,
            },
        )?,
    })
}

pub struct ContractPromptInputs<'a> {
    pub final_html: &'a str,
    pub page_summary: &'a str,
    pub schema: Option<&'a serde_json::Value>,
    pub mapping: &'a serde_json::Value,
    pub mapping_override: Option<&'a serde_json::Value>,
    pub user_input: &'a str,
    pub catalog: &'a [String],
    pub dialect: &'a str,
    pub key_tokens: &'a [String],
}

pub fn contract_prompt(inputs: &ContractPromptInputs<'_>) -> Result<Prompt, NeuraError> {
    Ok(Prompt {
        system: CONTRACT_SYSTEM.to_string(),
        user: render(
            CONTRACT_USER,
            context! {
                html => inputs.final_html,
                page_summary => inputs.page_summary,
                schema => inputs.schema.map(|s| s.to_string()).unwrap_or_else(|| "null".to_string()),
                mapping => inputs.mapping.to_string(),
                mapping_override => inputs
                    .mapping_override
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "null".to_string()),
                user_input => inputs.user_input,
                catalog => inputs.catalog.join("\n"),
                dialect => inputs.dialect,
                key_tokens => inputs.key_tokens.join(", "),
            },
        )?,
    })
}

pub fn generator_prompt(
    contract: &serde_json::Value,
    catalog: &[String],
    dialect: &str,
) -> Result<Prompt, NeuraError> {
    Ok(Prompt {
        system: GENERATOR_SYSTEM.to_string(),
        user: render(
            GENERATOR_USER,
            context! {
                contract => contract.to_string(),
                catalog => catalog.join("\n"),
                dialect => dialect,
            },
        )?,
    })
}
