use std::io::Cursor;
use std::sync::Arc;

use image::ImageOutputFormat;

use super::types::{OcrEngine, OcrPageResult, PdfPageRenderer};
use super::ExtractionError;
use crate::config::ExtractionConfig;
use crate::models::DocumentKind;

/// Recognition language.
pub const OCR_LANGUAGE: &str = "eng";

/// Characters the engine may emit. Tuned for invoices and receipts.
pub const OCR_CHAR_WHITELIST: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789.,:-$%/ ()";

pub const SCANNED_PDF_MARKER: &str = "=== OCR TEXT FROM PDF (SCANNED DOCUMENT) ===";

/// Sets the preserved text layer apart from the guidance above it.
pub const TEXT_LAYER_SEPARATOR: &str = "--- TEXT LAYER (PARTIAL) ---";

const KEY_FIELDS: &str = "\
- Invoice Number
- Invoice Date
- Total Amount
- Vendor or Company Name
- Line Items (Products/Services, Quantity, Price)
- Tax Information (if applicable)";

/// Bundled Tesseract OCR engine.
/// Only available when compiled with the `ocr` feature flag.
#[cfg(feature = "ocr")]
pub struct BundledTesseract {
    tessdata_dir: std::path::PathBuf,
    lang: String,
}

#[cfg(feature = "ocr")]
impl BundledTesseract {
    /// Initialize with a tessdata directory containing `eng.traineddata`.
    pub fn new(tessdata_dir: &std::path::Path) -> Result<Self, ExtractionError> {
        let model = format!("{OCR_LANGUAGE}.traineddata");
        if !tessdata_dir.join(&model).exists() {
            return Err(ExtractionError::TessdataNotFound(tessdata_dir.to_path_buf()));
        }
        Ok(Self {
            tessdata_dir: tessdata_dir.to_path_buf(),
            lang: OCR_LANGUAGE.to_string(),
        })
    }
}

#[cfg(feature = "ocr")]
impl OcrEngine for BundledTesseract {
    fn ocr_image(&self, image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        let tessdata_str = self
            .tessdata_dir
            .to_str()
            .ok_or_else(|| ExtractionError::OcrInit("Invalid tessdata path".into()))?;

        let mut tess = tesseract::Tesseract::new(Some(tessdata_str), Some(&self.lang))
            .map_err(|e| ExtractionError::OcrInit(format!("{e:?}")))?
            .set_variable("tessedit_char_whitelist", OCR_CHAR_WHITELIST)
            .map_err(|e| ExtractionError::OcrConfig(format!("{e:?}")))?
            .set_image_from_mem(image_bytes)
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;

        let text = tess
            .get_text()
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;

        let confidence = tess.mean_text_conf().max(0) as f32 / 100.0;

        Ok(OcrPageResult { text, confidence })
    }
}

/// Engine used when the binary is built without the `ocr` feature.
/// Always fails, so callers fall through to guidance text.
pub struct UnavailableOcr;

impl OcrEngine for UnavailableOcr {
    fn ocr_image(&self, _image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        Err(ExtractionError::OcrInit(
            "OCR support not compiled in (enable the `ocr` feature)".into(),
        ))
    }
}

/// Mock OCR engine for unit testing without Tesseract. Counts its calls.
#[cfg(test)]
pub struct MockOcrEngine {
    pub text: String,
    pub confidence: f32,
    pub fail: bool,
    /// 1-based call number that fails while the others succeed.
    pub fail_on_call: Option<usize>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
            fail: false,
            fail_on_call: None,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("", 0.0)
        }
    }

    pub fn failing_on_call(text: &str, call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new(text, 0.8)
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl OcrEngine for MockOcrEngine {
    fn ocr_image(&self, _image_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if self.fail || self.fail_on_call == Some(call) {
            return Err(ExtractionError::OcrProcessing("engine crashed".into()));
        }
        Ok(OcrPageResult {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }
}

/// Normalise an image to 8-bit grayscale PNG before recognition.
/// Bytes that do not decode as an image are passed through untouched.
pub fn prepare_for_ocr(image_bytes: &[u8]) -> Vec<u8> {
    let decoded = match image::load_from_memory(image_bytes) {
        Ok(img) => img,
        Err(e) => {
            tracing::debug!(error = %e, "Image not decodable, passing raw bytes to OCR");
            return image_bytes.to_vec();
        }
    };

    let mut cursor = Cursor::new(Vec::new());
    match decoded.grayscale().write_to(&mut cursor, ImageOutputFormat::Png) {
        Ok(()) => cursor.into_inner(),
        Err(e) => {
            tracing::debug!(error = %e, "Grayscale re-encode failed, using raw bytes");
            image_bytes.to_vec()
        }
    }
}

/// Confidence over several pages, weighted by text length.
pub fn weighted_confidence(pages: &[OcrPageResult]) -> f32 {
    let total_chars: usize = pages.iter().map(|p| p.text.len()).sum();
    if total_chars == 0 {
        return 0.0;
    }
    let weighted_sum: f32 = pages
        .iter()
        .map(|p| p.confidence * p.text.len() as f32)
        .sum();
    weighted_sum / total_chars as f32
}

/// Final text for a scanned PDF whose OCR succeeded.
pub fn scanned_pdf_text(ocr_text: &str, text_layer: &str) -> String {
    format!("{SCANNED_PDF_MARKER}\n\n{ocr_text}\n\n{text_layer}")
}

/// Guidance for a scanned PDF whose OCR failed. A non-blank text layer is
/// kept after `TEXT_LAYER_SEPARATOR`.
pub fn scanned_pdf_guidance(text_layer: &str) -> String {
    let guidance = format!(
        "It seems this PDF is a scanned document without OCR (Optical Character Recognition) \
applied. The system attempted to perform OCR but encountered issues.

To process this invoice, you have these options:

1. Upload a clearer version where text is selectable
2. Convert this PDF using an OCR tool like Adobe Acrobat, Google Drive, or online converters
3. Manually enter the invoice details

Or you can manually enter these key invoice details:
{KEY_FIELDS}"
    );
    if text_layer.trim().is_empty() {
        return guidance;
    }
    format!("{guidance}\n\n{TEXT_LAYER_SEPARATOR}\n{text_layer}")
}

/// Guidance for an image whose OCR failed.
pub fn image_guidance() -> String {
    format!(
        "The text in this image could not be recognized. For best results, upload a clear, \
well-lit photo or scan where the text is legible, or convert it to a PDF with selectable text.

Alternatively, you can manually enter these key invoice details:
{KEY_FIELDS}"
    )
}

/// Guidance for a PDF that could not be opened at all.
pub fn unreadable_pdf_guidance(reason: &str) -> String {
    format!(
        "It seems there was an issue extracting the text from your PDF invoice. This can happen \
if the invoice is scanned as an image without OCR (Optical Character Recognition) applied, or if \
it is password-protected or in an unsupported format.

Here's how you can proceed:

Option 1: Upload a Clearer Version
Try uploading a high-quality version of the invoice where text is selectable. If your invoice is \
scanned, you can use OCR software to convert it into machine-readable text.

Option 2: Manual Entry
If uploading a new version isn't possible, you can manually provide the following key details:
{KEY_FIELDS}

Option 3: Convert the Invoice
If the PDF is password-protected or encrypted, you may need to remove the password. You can also \
try converting the PDF to a Word document or plain text format using tools like Adobe Acrobat, \
SmallPDF, or online converters.

Original error: {reason}"
    )
}

/// Result of one OCR fallback invocation.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    /// Recognised text, empty when recognition failed.
    pub text: String,
    pub confidence: Option<f32>,
    pub pages_recognized: usize,
}

impl OcrOutcome {
    pub fn succeeded(&self) -> bool {
        !self.text.trim().is_empty()
    }

    fn failed() -> Self {
        Self {
            text: String::new(),
            confidence: None,
            pages_recognized: 0,
        }
    }
}

/// OCR fallback for scanned PDFs and images.
///
/// One call to `recognize` is one fallback invocation. Blocking: callers on
/// an async runtime go through `spawn_blocking`.
#[derive(Clone)]
pub struct OcrFallback {
    engine: Arc<dyn OcrEngine + Send + Sync>,
    renderer: Option<Arc<dyn PdfPageRenderer + Send + Sync>>,
    config: ExtractionConfig,
}

impl OcrFallback {
    pub fn new(engine: Arc<dyn OcrEngine + Send + Sync>, config: ExtractionConfig) -> Self {
        Self {
            engine,
            renderer: None,
            config,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PdfPageRenderer + Send + Sync>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Recognise `bytes`. Engine failures are logged and yield an empty
    /// outcome; any non-empty text is accepted regardless of confidence.
    pub fn recognize(&self, bytes: &[u8], kind: DocumentKind) -> OcrOutcome {
        let result = match (kind, &self.renderer) {
            (DocumentKind::Pdf, Some(renderer)) => self.recognize_rendered(bytes, renderer.as_ref()),
            (DocumentKind::Pdf, None) => self.recognize_single(bytes),
            _ => self.recognize_single(&prepare_for_ocr(bytes)),
        };

        match result {
            Ok(outcome) if outcome.succeeded() => {
                tracing::info!(
                    kind = kind.as_str(),
                    pages = outcome.pages_recognized,
                    confidence = outcome.confidence.unwrap_or(0.0),
                    chars = outcome.text.len(),
                    "OCR completed"
                );
                outcome
            }
            Ok(_) => {
                tracing::warn!(kind = kind.as_str(), "OCR produced no text");
                OcrOutcome::failed()
            }
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), error = %e, "OCR fallback failed");
                OcrOutcome::failed()
            }
        }
    }

    fn recognize_single(&self, bytes: &[u8]) -> Result<OcrOutcome, ExtractionError> {
        let page = self.engine.ocr_image(bytes)?;
        Ok(OcrOutcome {
            text: page.text.trim().to_string(),
            confidence: Some(page.confidence),
            pages_recognized: 1,
        })
    }

    fn recognize_rendered(
        &self,
        pdf_bytes: &[u8],
        renderer: &(dyn PdfPageRenderer + Send + Sync),
    ) -> Result<OcrOutcome, ExtractionError> {
        let count = renderer.page_count(pdf_bytes)?.min(self.config.max_pages);
        let mut pages = Vec::with_capacity(count);

        for page_number in 0..count {
            let png = match renderer.render_page(pdf_bytes, page_number, self.config.ocr_render_dpi)
            {
                Ok(png) => png,
                Err(e) => {
                    tracing::warn!(page = page_number + 1, error = %e, "Skipping unrenderable page");
                    continue;
                }
            };
            match self.engine.ocr_image(&png) {
                Ok(page) => pages.push(page),
                Err(e) => {
                    tracing::warn!(page = page_number + 1, error = %e, "Skipping page OCR failed on");
                }
            }
        }

        if pages.iter().all(|p| p.text.trim().is_empty()) {
            return Err(ExtractionError::OcrEmpty);
        }

        let text = pages
            .iter()
            .map(|p| p.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(OcrOutcome {
            text,
            confidence: Some(weighted_confidence(&pages)),
            pages_recognized: pages.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::pdfium::MockPdfPageRenderer;

    fn png_bytes() -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(4, 4);
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, ImageOutputFormat::Png).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn whitelist_covers_invoice_punctuation() {
        for c in ['$', '%', '/', '.', ',', ':', '-', '(', ')', ' '] {
            assert!(OCR_CHAR_WHITELIST.contains(c), "missing {c:?}");
        }
        assert!(!OCR_CHAR_WHITELIST.contains('€'));
    }

    #[test]
    fn mock_ocr_returns_text() {
        let engine = MockOcrEngine::new("Hello World", 0.85);
        let result = engine.ocr_image(b"fake image").unwrap();
        assert_eq!(result.text, "Hello World");
        assert!((result.confidence - 0.85).abs() < f32::EPSILON);
        assert_eq!(engine.call_count(), 1);
    }

    #[test]
    fn unavailable_engine_fails() {
        assert!(matches!(
            UnavailableOcr.ocr_image(b"x"),
            Err(ExtractionError::OcrInit(_))
        ));
    }

    #[test]
    fn prepare_converts_to_grayscale_png() {
        let out = prepare_for_ocr(&png_bytes());
        let decoded = image::load_from_memory(&out).unwrap();
        assert!(matches!(decoded, image::DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn prepare_passes_through_undecodable_bytes() {
        assert_eq!(prepare_for_ocr(b"not an image"), b"not an image".to_vec());
    }

    #[test]
    fn weighted_confidence_by_length() {
        let pages = vec![
            OcrPageResult { text: "a".repeat(30), confidence: 1.0 },
            OcrPageResult { text: "b".repeat(10), confidence: 0.6 },
        ];
        assert!((weighted_confidence(&pages) - 0.9).abs() < 1e-5);
        assert_eq!(weighted_confidence(&[]), 0.0);
    }

    #[test]
    fn image_recognized_once() {
        let engine = Arc::new(MockOcrEngine::new("  TOTAL $12.00 \n", 0.4));
        let fallback = OcrFallback::new(engine.clone(), ExtractionConfig::default());
        let out = fallback.recognize(&png_bytes(), DocumentKind::Image);
        assert!(out.succeeded());
        assert_eq!(out.text, "TOTAL $12.00");
        assert_eq!(engine.call_count(), 1);
    }

    #[test]
    fn low_confidence_is_still_accepted() {
        let engine = Arc::new(MockOcrEngine::new("faint text", 0.05));
        let fallback = OcrFallback::new(engine, ExtractionConfig::default());
        let out = fallback.recognize(b"%PDF", DocumentKind::Pdf);
        assert!(out.succeeded());
        assert_eq!(out.confidence, Some(0.05));
    }

    #[test]
    fn engine_failure_yields_empty_outcome() {
        let engine = Arc::new(MockOcrEngine::failing());
        let fallback = OcrFallback::new(engine.clone(), ExtractionConfig::default());
        let out = fallback.recognize(b"%PDF", DocumentKind::Pdf);
        assert!(!out.succeeded());
        assert_eq!(out.confidence, None);
        assert_eq!(engine.call_count(), 1);
    }

    #[test]
    fn whitespace_only_output_is_failure() {
        let engine = Arc::new(MockOcrEngine::new(" \n\t", 0.9));
        let fallback = OcrFallback::new(engine, ExtractionConfig::default());
        assert!(!fallback.recognize(b"img", DocumentKind::Image).succeeded());
    }

    #[test]
    fn rendered_pdf_pages_are_capped_and_joined() {
        let engine = Arc::new(MockOcrEngine::new("scanned page", 0.7));
        let renderer = Arc::new(MockPdfPageRenderer::new(25));
        let fallback = OcrFallback::new(engine.clone(), ExtractionConfig::default())
            .with_renderer(renderer.clone());

        let out = fallback.recognize(b"%PDF", DocumentKind::Pdf);
        assert_eq!(out.pages_recognized, 20);
        assert_eq!(renderer.render_count(), 20);
        assert_eq!(engine.call_count(), 20);
        assert_eq!(out.text.matches("scanned page").count(), 20);
    }

    #[test]
    fn one_failed_page_keeps_the_others() {
        let engine = Arc::new(MockOcrEngine::failing_on_call("scanned page", 2));
        let fallback = OcrFallback::new(engine.clone(), ExtractionConfig::default())
            .with_renderer(Arc::new(MockPdfPageRenderer::new(3)));

        let out = fallback.recognize(b"%PDF", DocumentKind::Pdf);
        assert!(out.succeeded());
        assert_eq!(engine.call_count(), 3);
        assert_eq!(out.pages_recognized, 2);
        assert_eq!(out.text, "scanned page\n\nscanned page");
    }

    #[test]
    fn every_page_failing_is_failure() {
        let engine = Arc::new(MockOcrEngine::failing());
        let fallback = OcrFallback::new(engine.clone(), ExtractionConfig::default())
            .with_renderer(Arc::new(MockPdfPageRenderer::new(3)));

        let out = fallback.recognize(b"%PDF", DocumentKind::Pdf);
        assert!(!out.succeeded());
        assert_eq!(engine.call_count(), 3);
    }

    #[test]
    fn guidance_texts_keep_context() {
        let g = scanned_pdf_guidance("--- Page 1 ---\nfaint\n\n");
        assert!(g.contains("Upload a clearer version"));
        assert!(g.contains("- Invoice Number"));
        assert!(g.ends_with("- Tax Information (if applicable)\n\n--- TEXT LAYER (PARTIAL) ---\n--- Page 1 ---\nfaint\n\n"));
        assert!(!scanned_pdf_guidance(" \n").contains(TEXT_LAYER_SEPARATOR));

        let u = unreadable_pdf_guidance("Invalid PDF structure");
        assert!(u.contains("Option 3: Convert the Invoice"));
        assert!(u.ends_with("Original error: Invalid PDF structure"));

        assert!(image_guidance().contains("could not be recognized"));
    }

    #[test]
    fn scanned_text_is_prefixed() {
        let t = scanned_pdf_text("ACME Corp", "--- Page 1 ---\n\n\n");
        assert!(t.starts_with("=== OCR TEXT FROM PDF (SCANNED DOCUMENT) ===\n\nACME Corp\n\n"));
    }
}
