use std::sync::Arc;

use super::classify::{classify_attachment, format_size};
use super::invoice::{classify_invoice, INVOICE_CHECKLIST};
use super::ocr::{
    image_guidance, scanned_pdf_guidance, scanned_pdf_text, unreadable_pdf_guidance, OcrFallback,
    UnavailableOcr,
};
use super::pdf::{extract_text_layer, needs_ocr, TextLayerOutput};
use super::pdfium::{PdfiumRenderer, PdfiumTextLayer};
use super::sanitize::sanitize_extracted_text;
use super::types::{Attachment, ExtractionResult, OcrEngine, PdfPageRenderer, PdfTextLayer};
use super::ExtractionError;
use crate::config::ExtractionConfig;
use crate::models::{AttachmentMeta, DocumentKind};

pub const PDF_TIMEOUT_MESSAGE: &str =
    "PDF processing timed out. Please try with a different PDF format.";

pub const EMPTY_TEXT_FILE: &str = "(The attached text file is empty.)";

/// User text used when an attachment is sent without a message.
pub const DEFAULT_ATTACHMENT_PROMPT: &str =
    "Please process this document and extract all relevant information.";

/// Steps of one extraction call, in order. A call never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExtractionStage {
    Classifying,
    Extracting,
    ConditionalOcr,
    Formatting,
    Done,
}

impl ExtractionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classifying => "classifying",
            Self::Extracting => "extracting",
            Self::ConditionalOcr => "conditional_ocr",
            Self::Formatting => "formatting",
            Self::Done => "done",
        }
    }
}

/// Tracks and logs stage transitions for one call.
struct StageLog<'a> {
    name: &'a str,
    current: ExtractionStage,
}

impl<'a> StageLog<'a> {
    fn new(name: &'a str) -> Self {
        tracing::debug!(file = name, stage = "classifying", "Extraction stage");
        Self {
            name,
            current: ExtractionStage::Classifying,
        }
    }

    fn enter(&mut self, next: ExtractionStage) {
        debug_assert!(next > self.current, "extraction stage moved backwards");
        tracing::debug!(
            file = self.name,
            from = self.current.as_str(),
            stage = next.as_str(),
            "Extraction stage"
        );
        self.current = next;
    }
}

/// A result plus the text actually recovered from the document, without
/// guidance or notices. The invoice heuristic reads only the latter.
struct Extracted {
    result: ExtractionResult,
    recovered: String,
}

impl Extracted {
    fn read(result: ExtractionResult) -> Self {
        let recovered = result.text.clone();
        Self { result, recovered }
    }

    /// Nothing was recovered; `text` is a message for the model.
    fn degraded(text: String) -> Self {
        Self {
            result: ExtractionResult::message(text),
            recovered: String::new(),
        }
    }
}

/// Turns attachments into text for the chat model.
/// Uses trait objects for the PDF text layer and OCR, enabling dependency injection.
pub struct DocumentExtractor {
    text_layer: Arc<dyn PdfTextLayer + Send + Sync>,
    ocr: OcrFallback,
    config: ExtractionConfig,
}

impl DocumentExtractor {
    pub fn new(
        text_layer: Arc<dyn PdfTextLayer + Send + Sync>,
        ocr_engine: Arc<dyn OcrEngine + Send + Sync>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            text_layer,
            ocr: OcrFallback::new(ocr_engine, config.clone()),
            config,
        }
    }

    /// Production extractor: PDFium for text and page rendering, Tesseract
    /// when built with the `ocr` feature.
    ///
    /// Missing native libraries are not fatal. PDFs then degrade to
    /// guidance text and OCR to its failure path.
    pub fn native(config: ExtractionConfig) -> Self {
        let extractor = Self::new(Arc::new(PdfiumTextLayer), native_ocr_engine(), config);
        match PdfiumRenderer::new() {
            Ok(renderer) => extractor.with_pdf_renderer(Arc::new(renderer)),
            Err(e) => {
                tracing::warn!(error = %e, "PDFium unavailable, scanned PDFs will not be OCR'd");
                extractor
            }
        }
    }

    /// Add a PDF page renderer for per-page OCR of scanned PDFs.
    pub fn with_pdf_renderer(mut self, renderer: Arc<dyn PdfPageRenderer + Send + Sync>) -> Self {
        self.ocr = self.ocr.with_renderer(renderer);
        self
    }

    /// Extract text from an attachment. Never fails; `text` is never empty.
    pub async fn extract(&self, attachment: &Attachment) -> ExtractionResult {
        let mut stages = StageLog::new(&attachment.name);
        let kind = classify_attachment(&attachment.mime_type, &attachment.name);

        tracing::info!(
            file = %attachment.name,
            kind = kind.as_str(),
            size = attachment.size_bytes,
            "Starting attachment extraction"
        );

        let Extracted {
            mut result,
            recovered,
        } = match kind {
            DocumentKind::Pdf => self.extract_pdf(attachment, &mut stages).await,
            DocumentKind::Image => {
                stages.enter(ExtractionStage::ConditionalOcr);
                self.extract_image(attachment).await
            }
            DocumentKind::PlainText => {
                stages.enter(ExtractionStage::Extracting);
                read_plain_text(&attachment.raw_bytes)
            }
            DocumentKind::Other => Extracted::degraded(other_file_notice(&attachment.meta())),
        };

        stages.enter(ExtractionStage::Formatting);
        debug_assert!(!result.text.trim().is_empty(), "extraction produced empty text");
        if result.text.trim().is_empty() {
            tracing::error!(file = %attachment.name, "Extraction produced empty text");
            result.text = other_file_notice(&attachment.meta());
        }
        result.kind = kind;
        result.classified_as_invoice = classify_invoice(&recovered, &attachment.name);

        stages.enter(ExtractionStage::Done);
        tracing::info!(
            file = %attachment.name,
            pages = result.pages_processed,
            truncated = result.truncated,
            used_ocr = result.used_ocr,
            invoice = result.classified_as_invoice,
            chars = result.text.len(),
            "Attachment extraction complete"
        );
        result
    }

    /// Text-only form of `extract`: total, never fails, never empty.
    pub async fn extract_text(&self, bytes: &[u8], mime_type: &str, filename: &str) -> String {
        let attachment = Attachment::new(filename, mime_type, bytes.to_vec());
        self.extract(&attachment).await.text
    }

    async fn extract_pdf(&self, attachment: &Attachment, stages: &mut StageLog<'_>) -> Extracted {
        stages.enter(ExtractionStage::Extracting);

        let layer = Arc::clone(&self.text_layer);
        let bytes = Arc::new(attachment.raw_bytes.clone());
        let config = self.config.clone();
        let task_bytes = Arc::clone(&bytes);
        let task = tokio::task::spawn_blocking(move || {
            extract_text_layer(layer.as_ref(), &task_bytes, &config)
        });

        let output: TextLayerOutput = match tokio::time::timeout(self.config.deadline, task).await {
            Err(_) => {
                tracing::warn!(
                    file = %attachment.name,
                    deadline_secs = self.config.deadline.as_secs_f32(),
                    "PDF processing timed out"
                );
                return Extracted::degraded(PDF_TIMEOUT_MESSAGE.to_string());
            }
            Ok(Err(join_err)) => {
                let e = ExtractionError::Task(join_err.to_string());
                tracing::error!(file = %attachment.name, error = %e, "PDF task failed");
                return Extracted::degraded(unreadable_pdf_guidance(&e.to_string()));
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(file = %attachment.name, error = %e, "PDF could not be loaded");
                return Extracted::degraded(unreadable_pdf_guidance(&e.to_string()));
            }
            Ok(Ok(Ok(output))) => output,
        };

        let mut result = ExtractionResult {
            kind: DocumentKind::Pdf,
            text: output.text.clone(),
            pages_processed: output.pages_processed,
            pages_total: output.pages_total,
            truncated: output.truncated,
            used_ocr: false,
            ocr_confidence: None,
            classified_as_invoice: false,
        };

        if !needs_ocr(&output, &self.config) {
            return Extracted::read(result);
        }

        stages.enter(ExtractionStage::ConditionalOcr);
        tracing::info!(
            file = %attachment.name,
            text_chars = output.chars_on_text_pages(self.config.min_page_chars),
            "Text layer too thin, falling back to OCR"
        );

        let ocr = self.ocr.clone();
        let outcome = tokio::task::spawn_blocking(move || ocr.recognize(&bytes, DocumentKind::Pdf)).await;

        let recovered = match outcome {
            Ok(outcome) if outcome.succeeded() => {
                result.text = scanned_pdf_text(&outcome.text, &output.text);
                result.used_ocr = true;
                result.ocr_confidence = outcome.confidence;
                format!("{}\n{}", outcome.text, output.text)
            }
            Ok(_) => {
                result.text = scanned_pdf_guidance(&output.text);
                output.text
            }
            Err(e) => {
                tracing::warn!(error = %e, "OCR task failed");
                result.text = scanned_pdf_guidance(&output.text);
                output.text
            }
        };
        Extracted { result, recovered }
    }

    async fn extract_image(&self, attachment: &Attachment) -> Extracted {
        let ocr = self.ocr.clone();
        let bytes = attachment.raw_bytes.clone();
        let outcome =
            tokio::task::spawn_blocking(move || ocr.recognize(&bytes, DocumentKind::Image)).await;

        match outcome {
            Ok(outcome) if outcome.succeeded() => Extracted::read(ExtractionResult {
                kind: DocumentKind::Image,
                text: outcome.text,
                pages_processed: 1,
                pages_total: 1,
                truncated: false,
                used_ocr: true,
                ocr_confidence: outcome.confidence,
                classified_as_invoice: false,
            }),
            Ok(_) => Extracted::degraded(image_guidance()),
            Err(e) => {
                tracing::warn!(error = %e, "OCR task failed");
                Extracted::degraded(image_guidance())
            }
        }
    }
}

#[cfg(feature = "ocr")]
fn native_ocr_engine() -> Arc<dyn OcrEngine + Send + Sync> {
    use super::ocr::BundledTesseract;

    let tessdata = crate::config::tessdata_dir();
    match BundledTesseract::new(&tessdata) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::warn!(error = %e, "Tesseract unavailable, OCR disabled");
            Arc::new(UnavailableOcr)
        }
    }
}

#[cfg(not(feature = "ocr"))]
fn native_ocr_engine() -> Arc<dyn OcrEngine + Send + Sync> {
    Arc::new(UnavailableOcr)
}

fn read_plain_text(bytes: &[u8]) -> Extracted {
    let text = sanitize_extracted_text(&String::from_utf8_lossy(bytes));
    if text.is_empty() {
        return Extracted::degraded(EMPTY_TEXT_FILE.to_string());
    }
    Extracted::read(ExtractionResult {
        kind: DocumentKind::PlainText,
        pages_processed: 1,
        pages_total: 1,
        ..ExtractionResult::message(text)
    })
}

/// Annotation for attachments whose content cannot be read as text.
pub fn other_file_notice(meta: &AttachmentMeta) -> String {
    let mime = if meta.mime_type.is_empty() {
        "unknown type"
    } else {
        meta.mime_type.as_str()
    };
    format!(
        "A file named \"{}\" ({}, {}) was attached. Its content could not be read as text.",
        meta.name,
        mime,
        format_size(meta.size_bytes)
    )
}

fn attachment_header(meta: &AttachmentMeta) -> String {
    let mime = if meta.mime_type.is_empty() {
        "unknown type"
    } else {
        meta.mime_type.as_str()
    };
    format!(
        "[Attached file: {} ({}, {})]",
        meta.name,
        mime,
        format_size(meta.size_bytes)
    )
}

fn prompt_or_default(user_text: &str) -> &str {
    let trimmed = user_text.trim();
    if trimmed.is_empty() {
        DEFAULT_ATTACHMENT_PROMPT
    } else {
        trimmed
    }
}

/// Build the outgoing user message for an extracted attachment.
pub fn format_attachment_message(
    user_text: &str,
    meta: &AttachmentMeta,
    result: &ExtractionResult,
) -> String {
    let mut message = format!(
        "{}\n\n{}\n\n--- EXTRACTED CONTENT ---\n{}\n--- END OF EXTRACTED CONTENT ---",
        prompt_or_default(user_text),
        attachment_header(meta),
        result.text.trim_end()
    );
    if result.classified_as_invoice {
        message.push_str("\n\n");
        message.push_str(INVOICE_CHECKLIST);
    }
    message
}

/// Build the outgoing user message for an attachment classified `Other`.
pub fn format_other_attachment(user_text: &str, meta: &AttachmentMeta) -> String {
    format!(
        "{}\n\n{}\n\n{}",
        prompt_or_default(user_text),
        attachment_header(meta),
        other_file_notice(meta)
    )
}
