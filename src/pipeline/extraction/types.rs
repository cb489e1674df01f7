use serde::{Deserialize, Serialize};

use super::ExtractionError;
use crate::models::{AttachmentMeta, DocumentKind};

/// A file the user attached to a message. Immutable once built.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub raw_bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(name: &str, mime_type: &str, raw_bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes: raw_bytes.len() as u64,
            raw_bytes,
        }
    }

    /// Read a file from disk; the MIME type is guessed from the extension.
    pub fn from_path(path: &std::path::Path) -> Result<Self, ExtractionError> {
        let raw_bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
            .to_string();
        let mime_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream");
        Ok(Self::new(&name, mime_type, raw_bytes))
    }

    pub fn meta(&self) -> AttachmentMeta {
        AttachmentMeta {
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

/// Outcome of one extraction call. `text` is never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// How the attachment was classified. Set by `DocumentExtractor::extract`.
    pub kind: DocumentKind,
    pub text: String,
    pub pages_processed: usize,
    pub pages_total: usize,
    pub truncated: bool,
    pub used_ocr: bool,
    pub ocr_confidence: Option<f32>,
    pub classified_as_invoice: bool,
}

impl ExtractionResult {
    /// Result carrying only a message (timeouts, guidance, single-page reads).
    pub fn message(text: String) -> Self {
        Self {
            kind: DocumentKind::Other,
            text,
            pages_processed: 0,
            pages_total: 0,
            truncated: false,
            used_ocr: false,
            ocr_confidence: None,
            classified_as_invoice: false,
        }
    }
}

/// One positioned run of text from a PDF page.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    /// Vertical position of the run's baseline, in PDF units.
    pub y: f32,
}

impl TextRun {
    pub fn new(text: &str, y: f32) -> Self {
        Self {
            text: text.to_string(),
            y,
        }
    }
}

/// Raw text layer read from a PDF, before layout joining.
#[derive(Debug)]
pub struct PdfRuns {
    /// Pages in the document, including those beyond the read cap.
    pub page_count: usize,
    /// Runs for each page that was read. A page-level error is isolated here.
    pub pages: Vec<Result<Vec<TextRun>, ExtractionError>>,
}

/// Raw OCR result from the engine
#[derive(Debug, Clone)]
pub struct OcrPageResult {
    pub text: String,
    /// Mean confidence, 0.0-1.0.
    pub confidence: f32,
}

/// OCR engine abstraction (allows mocking for tests)
pub trait OcrEngine {
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError>;
}

/// PDF text layer abstraction
pub trait PdfTextLayer {
    /// Load the document and read the runs of at most `max_pages` pages.
    /// Fails only when the document itself cannot be opened.
    fn read_runs(&self, pdf_bytes: &[u8], max_pages: usize) -> Result<PdfRuns, ExtractionError>;
}

/// Renders PDF pages to PNG for OCR of scanned documents.
pub trait PdfPageRenderer {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError>;

    /// Render a zero-based page to PNG bytes.
    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_number: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, ExtractionError>;
}
