pub mod types;
pub mod classify;
pub mod sanitize;
pub mod invoice;
pub mod pdf;
pub mod pdfium;
pub mod ocr;
pub mod orchestrator;

pub use types::*;
pub use classify::*;
pub use sanitize::*;
pub use invoice::*;
pub use ocr::*;
pub use orchestrator::*;

use thiserror::Error;

/// Internal extraction failures. These never reach the caller of
/// `DocumentExtractor::extract`; they are turned into guidance text.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tesseract OCR initialization failed: {0}")]
    OcrInit(String),

    #[error("Tesseract OCR configuration error: {0}")]
    OcrConfig(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("OCR engine returned no text")]
    OcrEmpty,

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("PDF page {page} could not be read: {reason}")]
    PdfPage { page: usize, reason: String },

    #[error("PDF rendering failed on page {page}: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("PDF is password-protected or encrypted")]
    PdfEncrypted,

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Tessdata not found at: {0}")]
    TessdataNotFound(std::path::PathBuf),

    #[error("Extraction task failed: {0}")]
    Task(String),
}
