// neura-core/src/application/pipeline/verify.rs

// Stage 1 — Verify. Rasterize the first page of the upload, ask the LLM for
// a placeholder schema and an HTML photocopy, render the photocopy and
// compare it to the reference. Below the SSIM target, at most
// MAX_FIX_PASSES fix calls may respond with either a full HTML block or a
// CSS patch that is merged into the existing <style>.

use crate::application::Services;
use crate::application::pipeline::prompts::{
    self, PROMPT_VERSION_INITIAL_HTML, PROMPT_VERSION_SCHEMA,
};
use crate::application::templates::{
    REFERENCE_PNG, RENDER_PNG, SCHEMA_EXT_JSON, SOURCE_PDF, TEMPLATE_HTML, artifact_url,
    template_dir,
};
use crate::domain::error::DomainError;
use crate::domain::template::{TemplateKind, TemplateStatus};
use crate::error::NeuraError;
use crate::infrastructure::artifacts::write_artifact_manifest;
use crate::infrastructure::fs::{write_json_atomic, write_text_atomic};
use crate::infrastructure::imaging::compare_images;
use crate::infrastructure::llm::openai::strip_code_fences;
use crate::infrastructure::lock::acquire_template_lock;
use crate::infrastructure::state::TemplateUpsert;
use crate::ports::llm::{ChatModel, ChatRequest};
use crate::ports::render::{A4_VIEWPORT_400DPI, PageRenderer, PdfRasterizer};
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{info, warn};

#[allow(clippy::expect_used)]
static CSS_PATCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<!--BEGIN_CSS_PATCH-->([\s\S]*?)<!--END_CSS_PATCH-->").expect("css patch regex")
});

#[allow(clippy::expect_used)]
static HTML_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<!--BEGIN_HTML-->([\s\S]*?)<!--END_HTML-->").expect("html block regex")
});

#[allow(clippy::expect_used)]
static STYLE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)(<style\b[^>]*>)(.*?)(</style>)").expect("style block regex")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub template_id: String,
    pub schema: serde_json::Value,
    pub ssim: f64,
    pub fix_passes: u32,
    pub artifacts: BTreeMap<String, String>,
}

/// Merge a CSS rule block into the document's existing <style> element, or
/// append a new one when none exists.
pub fn merge_css_into_html(html: &str, css_rules: &str) -> String {
    let rules = css_rules.trim();
    if rules.is_empty() {
        return html.to_string();
    }
    if STYLE_BLOCK_RE.is_match(html) {
        let mut first = true;
        return STYLE_BLOCK_RE
            .replace_all(html, |caps: &regex::Captures<'_>| {
                if first {
                    first = false;
                    format!("{}{}\n{}\n{}", &caps[1], &caps[2], rules, &caps[3])
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned();
    }
    match html.find("</head>") {
        Some(pos) => {
            let mut out = html.to_string();
            out.insert_str(pos, &format!("<style>\n{rules}\n</style>"));
            out
        }
        None => format!("<style>\n{rules}\n</style>{html}"),
    }
}

/// Merge an LLM fix response into the current HTML: CSS patches merge into
/// the <style>, full HTML blocks replace the document, anything else is
/// taken as the full document.
pub fn apply_fix_response(html_before: &str, llm_output: &str) -> String {
    let output = llm_output.trim();
    if let Some(caps) = CSS_PATCH_RE.captures(output) {
        let patch_body = caps.get(1).map(|m| m.as_str()).unwrap_or("").trim();
        let css_rules = STYLE_BLOCK_RE
            .captures(patch_body)
            .and_then(|c| c.get(2))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| patch_body.to_string());
        return merge_css_into_html(html_before, &css_rules);
    }
    if let Some(caps) = HTML_BLOCK_RE.captures(output) {
        return caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    }
    output.to_string()
}

pub fn has_css_patch(output: &str) -> bool {
    CSS_PATCH_RE.is_match(output)
}

pub fn has_html_block(output: &str) -> bool {
    HTML_BLOCK_RE.is_match(output)
}

fn png_data_uri(path: &Path) -> Result<String, NeuraError> {
    let bytes = std::fs::read(path)?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    ))
}

async fn request_schema(
    services: &Services,
    reference_png: &Path,
) -> Result<serde_json::Value, NeuraError> {
    let prompt = prompts::schema_prompt(&serde_json::json!({}))?;
    let request = ChatRequest::new(PROMPT_VERSION_SCHEMA)
        .with_system(prompt.system)
        .with_text(prompt.user)
        .with_image(png_data_uri(reference_png)?)
        .json_object();
    let raw = services.chat.complete(&request).await?;
    let body = strip_code_fences(&raw);
    serde_json::from_str(&body).map_err(|err| {
        NeuraError::Domain(DomainError::Validation(format!(
            "schema extraction returned invalid JSON: {err}"
        )))
    })
}

async fn request_initial_html(
    services: &Services,
    schema: &serde_json::Value,
    reference_png: &Path,
) -> Result<String, NeuraError> {
    let prompt = prompts::initial_html_prompt(schema, &serde_json::json!({}))?;
    let request = ChatRequest::new(PROMPT_VERSION_INITIAL_HTML)
        .with_system(prompt.system)
        .with_text(prompt.user)
        .with_image(png_data_uri(reference_png)?);
    let raw = services.chat.complete(&request).await?;
    Ok(strip_code_fences(&raw))
}

async fn request_fix(
    services: &Services,
    schema: &serde_json::Value,
    reference_png: &Path,
    render_png: &Path,
    current_html: &str,
    ssim: f64,
) -> Result<String, NeuraError> {
    let prompt = prompts::fix_prompt(schema, current_html, ssim)?;
    // Patch-only mode gives the model a second chance to respond with a
    // patch before a full-HTML response is accepted anyway.
    let max_attempts: u32 = if services.config.photocopy_fix_accept_patch_only { 2 } else { 1 };
    let mut last_output = String::new();
    for attempt in 1..=max_attempts {
        let request = ChatRequest::new(prompts::PROMPT_VERSION_FIX)
            .with_system(prompt.system.clone())
            .with_text(prompt.user.clone())
            .with_image(png_data_uri(reference_png)?)
            .with_image(png_data_uri(render_png)?);
        last_output = strip_code_fences(&services.chat.complete(&request).await?);
        let patch = has_css_patch(&last_output);
        let html = has_html_block(&last_output);
        if services.config.photocopy_fix_accept_patch_only && !patch && html && attempt < max_attempts {
            warn!(attempt, "fix pass returned full HTML where a CSS patch was required, retrying");
            continue;
        }
        if services.config.photocopy_fix_accept_patch_only && !patch && html {
            warn!(attempt, "accepting full-HTML fix as fallback");
        }
        break;
    }
    Ok(apply_fix_response(current_html, &last_output))
}

/// Stage entrypoint: ingest an uploaded PDF and produce the draft template.
pub async fn verify_stage(
    services: &Services,
    template_id: &str,
    kind: TemplateKind,
    pdf_bytes: &[u8],
    correlation_id: Option<&str>,
) -> Result<VerifyOutcome, NeuraError> {
    if let Some(limit) = services.config.max_verify_pdf_bytes
        && pdf_bytes.len() as u64 > limit
    {
        return Err(NeuraError::Domain(DomainError::Validation(format!(
            "upload exceeds NEURA_MAX_VERIFY_PDF_BYTES ({} > {limit})",
            pdf_bytes.len()
        ))));
    }

    let tdir = template_dir(&services.config, template_id, kind, false, true)?;
    let _lock = acquire_template_lock(&tdir, "template_verify", correlation_id)?;

    let pdf_path = tdir.join(SOURCE_PDF);
    crate::infrastructure::fs::atomic_write(&pdf_path, pdf_bytes)
        .map_err(NeuraError::Infrastructure)?;

    let reference_png = tdir.join(REFERENCE_PNG);
    services
        .rasterizer
        .rasterize_page(&pdf_path, 0, services.config.pdf_dpi, &reference_png)
        .await?;
    info!(template_id, dpi = services.config.pdf_dpi, "reference page rasterized");

    let schema = request_schema(services, &reference_png).await?;
    let mut html = request_initial_html(services, &schema, &reference_png).await?;

    let html_path = tdir.join(TEMPLATE_HTML);
    write_text_atomic(&html_path, &html).map_err(NeuraError::Infrastructure)?;

    let render_png = tdir.join(RENDER_PNG);
    services
        .page_renderer
        .html_to_png(&html_path, &render_png, A4_VIEWPORT_400DPI)
        .await?;
    let mut ssim = compare_images(&reference_png, &render_png)?;
    info!(template_id, ssim, "initial photocopy scored");

    let mut fix_passes = 0;
    if services.config.verify_fix_html_enabled {
        while ssim < services.config.photocopy_target_ssim
            && fix_passes < services.config.max_fix_passes
        {
            fix_passes += 1;
            html = request_fix(services, &schema, &reference_png, &render_png, &html, ssim).await?;
            write_text_atomic(&html_path, &html).map_err(NeuraError::Infrastructure)?;
            services
                .page_renderer
                .html_to_png(&html_path, &render_png, A4_VIEWPORT_400DPI)
                .await?;
            ssim = compare_images(&reference_png, &render_png)?;
            info!(template_id, ssim, fix_passes, "fix pass scored");
        }
    }

    let schema_path = tdir.join(SCHEMA_EXT_JSON);
    write_json_atomic(&schema_path, &schema).map_err(NeuraError::Infrastructure)?;

    let mut files = BTreeMap::new();
    files.insert("source_pdf".to_string(), pdf_path);
    files.insert("reference_png".to_string(), reference_png);
    files.insert("template_html".to_string(), html_path.clone());
    files.insert("render_png".to_string(), render_png);
    files.insert("schema_ext".to_string(), schema_path.clone());
    write_artifact_manifest(&tdir, "template_verify", &files, &[], correlation_id)?;

    let mut artifacts = BTreeMap::new();
    for (name, path) in [
        ("template_html_url", &html_path),
        ("schema_url", &schema_path),
    ] {
        if let Some(url) = artifact_url(&services.config, path) {
            artifacts.insert(name.to_string(), url);
        }
    }
    services.state.upsert_template(template_id, TemplateUpsert {
        name: template_id.to_string(),
        status: TemplateStatus::Draft,
        artifacts: artifacts.clone(),
        tags: Vec::new(),
        connection_id: None,
        mapping_keys: None,
        kind: Some(kind),
    })?;

    Ok(VerifyOutcome {
        template_id: template_id.to_string(),
        schema,
        ssim,
        fix_passes,
        artifacts,
    })
}
