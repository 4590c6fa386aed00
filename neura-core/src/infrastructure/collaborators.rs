// neura-core/src/infrastructure/collaborators.rs

// Subprocess-backed implementations of the binary render collaborators:
// a headless Chromium for HTML -> PNG/PDF, poppler's pdftoppm for PDF
// rasterization and LibreOffice for the office conversions. Every spawned
// child registers its PID with the process tracker so forced job
// cancellation can terminate the tree.

use crate::error::NeuraError;
use crate::infrastructure::error::InfrastructureError;
use crate::ports::process::ProcessTracker;
use crate::ports::render::{
    DocxConverter, DocxHints, PageRenderer, PdfOptions, PdfRasterizer, Viewport, XlsxExporter,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

async fn run_tracked(
    mut command: Command,
    tracker: &ProcessTracker,
    timeout: Option<Duration>,
    what: &str,
) -> Result<(), NeuraError> {
    command.kill_on_drop(true);
    let mut child = command
        .spawn()
        .map_err(|e| InfrastructureError::Io(e))
        .map_err(NeuraError::Infrastructure)?;
    let pid = child.id();
    if let Some(pid) = pid {
        tracker.track_for_current_job(pid);
    }
    debug!(what, pid, "collaborator subprocess spawned");

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(what, timeout_s = limit.as_secs(), "collaborator timed out, killing");
                let _ = child.kill().await;
                if let Some(pid) = pid {
                    tracker.untrack(pid);
                }
                return Err(NeuraError::InternalError(format!(
                    "{what} timed out after {}s",
                    limit.as_secs()
                )));
            }
        },
        None => child.wait().await,
    };
    if let Some(pid) = pid {
        tracker.untrack(pid);
    }
    let status = status.map_err(|e| NeuraError::Infrastructure(InfrastructureError::Io(e)))?;
    if !status.success() {
        return Err(NeuraError::InternalError(format!(
            "{what} exited with status {status}"
        )));
    }
    Ok(())
}

/// Headless Chromium renderer (HTML file -> PNG screenshot / PDF print).
pub struct HeadlessBrowser {
    binary: String,
    tracker: Arc<ProcessTracker>,
}

impl HeadlessBrowser {
    pub fn new(binary: impl Into<String>, tracker: Arc<ProcessTracker>) -> Self {
        Self { binary: binary.into(), tracker }
    }
}

#[async_trait]
impl PageRenderer for HeadlessBrowser {
    async fn html_to_png(
        &self,
        html_path: &Path,
        out_png: &Path,
        viewport: Viewport,
    ) -> Result<(), NeuraError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--hide-scrollbars")
            .arg(format!("--window-size={},{}", viewport.width, viewport.height))
            .arg(format!("--screenshot={}", out_png.display()))
            .arg(file_url(html_path));
        run_tracked(command, &self.tracker, None, "html->png").await
    }

    async fn html_to_pdf(
        &self,
        html_path: &Path,
        out_pdf: &Path,
        options: PdfOptions,
    ) -> Result<(), NeuraError> {
        if !(options.scale > 0.1 && options.scale <= 2.0) {
            return Err(NeuraError::InternalError(format!(
                "pdf scale out of range: {}",
                options.scale
            )));
        }
        let mut command = Command::new(&self.binary);
        command
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-pdf-header-footer")
            .arg(format!("--print-to-pdf={}", out_pdf.display()));
        if options.landscape {
            command.arg("--landscape");
        }
        command.arg(file_url(html_path));
        run_tracked(command, &self.tracker, None, "html->pdf").await
    }
}

/// poppler-utils rasterizer (PDF page -> PNG at a given dpi).
pub struct PopplerRasterizer {
    tracker: Arc<ProcessTracker>,
}

impl PopplerRasterizer {
    pub fn new(tracker: Arc<ProcessTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl PdfRasterizer for PopplerRasterizer {
    async fn rasterize_page(
        &self,
        pdf_path: &Path,
        page: usize,
        dpi: u32,
        out_png: &Path,
    ) -> Result<(), NeuraError> {
        let page_no = page + 1;
        let prefix = out_png.with_extension("");
        let mut command = Command::new("pdftoppm");
        command
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(page_no.to_string())
            .arg("-l")
            .arg(page_no.to_string())
            .arg("-singlefile")
            .arg(pdf_path)
            .arg(&prefix);
        run_tracked(command, &self.tracker, None, "pdf->png").await?;
        // pdftoppm emits <prefix>.png.
        let produced = prefix.with_extension("png");
        if produced != out_png && produced.exists() {
            std::fs::rename(&produced, out_png)?;
        }
        Ok(())
    }
}

/// LibreOffice conversions for the office formats.
pub struct LibreOfficeConverter {
    binary: String,
    tracker: Arc<ProcessTracker>,
}

impl LibreOfficeConverter {
    pub fn new(binary: impl Into<String>, tracker: Arc<ProcessTracker>) -> Self {
        Self { binary: binary.into(), tracker }
    }

    async fn convert(
        &self,
        input: &Path,
        target_ext: &str,
        out_path: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), NeuraError> {
        let out_dir = out_path
            .parent()
            .ok_or_else(|| NeuraError::InternalError("conversion target has no parent".into()))?;
        let mut command = Command::new(&self.binary);
        command
            .arg("--headless")
            .arg("--convert-to")
            .arg(target_ext)
            .arg("--outdir")
            .arg(out_dir)
            .arg(input);
        run_tracked(command, &self.tracker, timeout, &format!("convert->{target_ext}")).await?;

        // soffice names the output after the input stem.
        let produced = out_dir
            .join(input.file_stem().unwrap_or_default())
            .with_extension(target_ext);
        if produced != out_path {
            if !produced.exists() {
                return Err(NeuraError::InternalError(format!(
                    "converter produced no {target_ext} output"
                )));
            }
            std::fs::rename(&produced, out_path)?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocxConverter for LibreOfficeConverter {
    async fn pdf_to_docx(
        &self,
        pdf_path: &Path,
        out_docx: &Path,
        timeout: Duration,
    ) -> Result<(), NeuraError> {
        self.convert(pdf_path, "docx", out_docx, Some(timeout)).await
    }

    async fn html_to_docx(
        &self,
        html_path: &Path,
        out_docx: &Path,
        _hints: DocxHints,
    ) -> Result<(), NeuraError> {
        self.convert(html_path, "docx", out_docx, None).await
    }
}

#[async_trait]
impl XlsxExporter for LibreOfficeConverter {
    async fn html_to_xlsx(&self, html_path: &Path, out_xlsx: &Path) -> Result<(), NeuraError> {
        self.convert(html_path, "xlsx", out_xlsx, None).await
    }
}
