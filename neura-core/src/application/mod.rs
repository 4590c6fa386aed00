// neura-core/src/application/mod.rs

pub mod executor;
pub mod jobs;
pub mod orchestrator;
pub mod pipeline;
pub mod render;
pub mod scheduler;
pub mod templates;

use crate::infrastructure::config::AppConfig;
use crate::infrastructure::introspect::SchemaCache;
use crate::infrastructure::state::StateStore;
use crate::ports::llm::ChatModel;
use crate::ports::mailer::Mailer;
use crate::ports::render::{DocxConverter, PageRenderer, PdfRasterizer, XlsxExporter};
use std::sync::Arc;

/// Dependency bundle injected at the composition root (the CLI). Pipeline
/// stages and the orchestrator only ever see ports, never concrete adapters.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<AppConfig>,
    pub state: Arc<StateStore>,
    pub chat: Arc<dyn ChatModel>,
    pub page_renderer: Arc<dyn PageRenderer>,
    pub rasterizer: Arc<dyn PdfRasterizer>,
    pub docx: Arc<dyn DocxConverter>,
    pub xlsx: Arc<dyn XlsxExporter>,
    pub mailer: Arc<dyn Mailer>,
    pub schema_cache: Arc<SchemaCache>,
}
