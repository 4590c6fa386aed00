// neura-core/src/ports/render.rs

// Binary render collaborators. The renderer itself only does deterministic
// token substitution; everything that needs a browser, a rasterizer or an
// office converter goes through these ports.

use crate::error::NeuraError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct PdfOptions {
    pub landscape: bool,
    /// Print scale, valid range (0.1, 2.0].
    pub scale: f64,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self { landscape: false, scale: 1.0 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// A4 at 400 DPI, the reference viewport for photocopy comparison.
pub const A4_VIEWPORT_400DPI: Viewport = Viewport { width: 3308, height: 4677 };

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn html_to_png(
        &self,
        html_path: &Path,
        out_png: &Path,
        viewport: Viewport,
    ) -> Result<(), NeuraError>;

    async fn html_to_pdf(
        &self,
        html_path: &Path,
        out_pdf: &Path,
        options: PdfOptions,
    ) -> Result<(), NeuraError>;
}

#[async_trait]
pub trait PdfRasterizer: Send + Sync {
    /// Render one page (0-based) of a PDF to PNG at the given dpi.
    async fn rasterize_page(
        &self,
        pdf_path: &Path,
        page: usize,
        dpi: u32,
        out_png: &Path,
    ) -> Result<(), NeuraError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocxHints {
    pub landscape: bool,
    pub font_scale: Option<f64>,
}

#[async_trait]
pub trait DocxConverter: Send + Sync {
    /// pdf -> docx, hard-limited by `timeout`. Errors and timeouts let the
    /// caller fall back to the HTML path.
    async fn pdf_to_docx(
        &self,
        pdf_path: &Path,
        out_docx: &Path,
        timeout: Duration,
    ) -> Result<(), NeuraError>;

    /// html -> docx via structured-table export.
    async fn html_to_docx(
        &self,
        html_path: &Path,
        out_docx: &Path,
        hints: DocxHints,
    ) -> Result<(), NeuraError>;
}

#[async_trait]
pub trait XlsxExporter: Send + Sync {
    /// html -> xlsx preserving the first data table.
    async fn html_to_xlsx(&self, html_path: &Path, out_xlsx: &Path) -> Result<(), NeuraError>;
}
