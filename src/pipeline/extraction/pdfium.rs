//! PDF access via Google PDFium.
//!
//! `PdfiumTextLayer` reads positioned text segments; `PdfiumRenderer`
//! rasterises pages for OCR of scanned invoices. Neither holds a `Pdfium`
//! handle (the upstream type is `!Send`): every call binds the library and
//! opens the document through `open_document`.

use std::io::Cursor;
use std::path::PathBuf;

use image::ImageOutputFormat;
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use super::types::{PdfPageRenderer, PdfRuns, PdfTextLayer, TextRun};
use super::ExtractionError;

pub const PDFIUM_PATH_ENV: &str = "PDFIUM_DYNAMIC_LIB_PATH";

/// Longest side of a rendered page, in pixels.
const MAX_RENDER_SIDE_PX: u32 = 4096;

const POINTS_PER_INCH: f32 = 72.0;

/// Directories next to the executable where a bundled PDFium may live.
fn bundled_library_dirs() -> Vec<PathBuf> {
    let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
    else {
        return vec![];
    };
    vec![
        exe_dir.join("pdfium").join("lib"),
        exe_dir.join("..").join("lib"),
        exe_dir,
    ]
}

/// Bind PDFium: `PDFIUM_DYNAMIC_LIB_PATH`, then bundled locations, then the
/// system library path.
fn load_pdfium() -> Result<Pdfium, ExtractionError> {
    if let Ok(path) = std::env::var(PDFIUM_PATH_ENV) {
        return Pdfium::bind_to_library(&path)
            .map(Pdfium::new)
            .map_err(|e| ExtractionError::PdfParsing(format!("Cannot load PDFium from {path}: {e}")));
    }

    let bundled = bundled_library_dirs().into_iter().find_map(|dir| {
        let lib = Pdfium::pdfium_platform_library_name_at_path(dir.to_string_lossy().as_ref());
        Pdfium::bind_to_library(lib).ok().inspect(|_| {
            debug!(dir = %dir.display(), "Using bundled PDFium");
        })
    });
    if let Some(bindings) = bundled {
        return Ok(Pdfium::new(bindings));
    }

    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| {
            ExtractionError::PdfParsing(format!(
                "PDFium not found (set {PDFIUM_PATH_ENV} or install it): {e}"
            ))
        })
}

/// Bind PDFium, open `pdf_bytes` and hand the document to `f`.
fn open_document<T>(
    pdf_bytes: &[u8],
    f: impl FnOnce(&PdfDocument<'_>) -> Result<T, ExtractionError>,
) -> Result<T, ExtractionError> {
    let pdfium = load_pdfium()?;
    let document = pdfium.load_pdf_from_byte_slice(pdf_bytes, None).map_err(|e| {
        let message = e.to_string();
        let lower = message.to_lowercase();
        if lower.contains("password") || lower.contains("encrypt") {
            ExtractionError::PdfEncrypted
        } else {
            ExtractionError::PdfParsing(format!("Cannot open PDF: {message}"))
        }
    })?;
    f(&document)
}

fn page_index(page_number: usize) -> Result<u16, ExtractionError> {
    u16::try_from(page_number).map_err(|_| ExtractionError::PdfPage {
        page: page_number + 1,
        reason: "page index beyond PDFium's u16 range".into(),
    })
}

// ═══════════════════════════════════════════════════════════
// Text layer
// ═══════════════════════════════════════════════════════════

/// `PdfTextLayer` over PDFium text segments. Each segment becomes one
/// `TextRun` at its bottom edge.
pub struct PdfiumTextLayer;

fn page_runs(pages: &PdfPages, page_number: usize) -> Result<Vec<TextRun>, ExtractionError> {
    let failed = |reason: String| ExtractionError::PdfPage {
        page: page_number + 1,
        reason,
    };
    let page = pages
        .get(page_index(page_number)?)
        .map_err(|e| failed(e.to_string()))?;
    let text = page.text().map_err(|e| failed(e.to_string()))?;

    Ok(text
        .segments()
        .iter()
        .map(|segment| TextRun {
            text: segment.text(),
            y: segment.bounds().bottom.value,
        })
        .collect())
}

impl PdfTextLayer for PdfiumTextLayer {
    fn read_runs(&self, pdf_bytes: &[u8], max_pages: usize) -> Result<PdfRuns, ExtractionError> {
        open_document(pdf_bytes, |document| {
            let pages = document.pages();
            let page_count = pages.len() as usize;
            let runs: Vec<_> = (0..page_count.min(max_pages))
                .map(|n| page_runs(pages, n))
                .collect();
            debug!(page_count, pages_read = runs.len(), "Read PDF text segments");
            Ok(PdfRuns {
                page_count,
                pages: runs,
            })
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Page rendering
// ═══════════════════════════════════════════════════════════

/// Renders PDF pages to PNG for OCR.
pub struct PdfiumRenderer;

impl PdfiumRenderer {
    /// Fails when the PDFium library cannot be bound.
    pub fn new() -> Result<Self, ExtractionError> {
        load_pdfium().map(|_| Self)
    }
}

/// Pixel size of a page rendered at `dpi`, scaled down uniformly so the
/// longer side fits `MAX_RENDER_SIDE_PX`. Never below 1x1.
fn render_size(width_pt: f32, height_pt: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let (w, h) = ((width_pt * scale).max(1.0), (height_pt * scale).max(1.0));
    let shrink = (MAX_RENDER_SIDE_PX as f32 / w.max(h)).min(1.0);
    let fit = |side: f32| ((side * shrink).round() as u32).clamp(1, MAX_RENDER_SIDE_PX);
    (fit(w), fit(h))
}

fn encode_png(image: &image::DynamicImage) -> Result<Vec<u8>, ExtractionError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

impl PdfPageRenderer for PdfiumRenderer {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        open_document(pdf_bytes, |document| Ok(document.pages().len() as usize))
    }

    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_number: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, ExtractionError> {
        let failed = |reason: String| ExtractionError::PdfRendering {
            page: page_number + 1,
            reason,
        };

        open_document(pdf_bytes, |document| {
            let pages = document.pages();
            let page = pages
                .get(page_index(page_number)?)
                .map_err(|e| failed(e.to_string()))?;

            let (width, height) = render_size(page.width().value, page.height().value, dpi);
            if width == MAX_RENDER_SIDE_PX || height == MAX_RENDER_SIDE_PX {
                warn!(page = page_number + 1, width, height, "Large page rendered at reduced size");
            }

            let bitmap = page
                .render_with_config(
                    &PdfRenderConfig::new()
                        .set_target_width(width as i32)
                        .set_maximum_height(height as i32),
                )
                .map_err(|e| failed(e.to_string()))?;

            let png = encode_png(&bitmap.as_image())?;
            debug!(page = page_number + 1, width, height, bytes = png.len(), "Rendered page for OCR");
            Ok(png)
        })
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Renders a 2x2 PNG per page in range and counts renders.
#[cfg(test)]
pub struct MockPdfPageRenderer {
    page_count: usize,
    renders: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockPdfPageRenderer {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            renders: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl PdfPageRenderer for MockPdfPageRenderer {
    fn page_count(&self, _pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        Ok(self.page_count)
    }

    fn render_page(
        &self,
        _pdf_bytes: &[u8],
        page_number: usize,
        _dpi: u32,
    ) -> Result<Vec<u8>, ExtractionError> {
        if page_number >= self.page_count {
            return Err(ExtractionError::PdfRendering {
                page: page_number + 1,
                reason: "out of range".into(),
            });
        }
        self.renders.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        encode_png(&image::DynamicImage::new_rgb8(2, 2))
    }
}
