//! Text-layer extraction for digital PDFs.
//!
//! The page loop, page cap, per-page failure isolation and the layout join
//! live here as plain functions over a `PdfTextLayer`, so they run the same
//! against pdfium and against test doubles.

use super::sanitize::collapse_spaces;
use super::types::{PdfTextLayer, TextRun};
use super::ExtractionError;
use crate::config::ExtractionConfig;

/// Placeholder body for a page whose text could not be read.
pub const PAGE_ERROR_PLACEHOLDER: &str = "Error extracting text from this page.";

/// Joined text layer of a PDF, ready for the OCR decision.
#[derive(Debug, Clone, Default)]
pub struct TextLayerOutput {
    /// Page blocks (`--- Page N ---`) plus the truncation notice, if any.
    pub text: String,
    pub pages_total: usize,
    pub pages_processed: usize,
    pub truncated: bool,
    /// Character count of each page that was read successfully.
    pub page_chars: Vec<usize>,
}

impl TextLayerOutput {
    /// Total characters over pages holding more than `min_page_chars`.
    pub fn chars_on_text_pages(&self, min_page_chars: usize) -> usize {
        self.page_chars
            .iter()
            .filter(|&&c| c > min_page_chars)
            .sum()
    }
}

pub fn page_header(page_number: usize) -> String {
    format!("--- Page {page_number} ---")
}

pub fn truncation_notice(max_pages: usize) -> String {
    format!(
        "\n(Note: Only the first {max_pages} pages were processed due to size limitations.)\n"
    )
}

/// Join the runs of one page into text.
///
/// Runs are separated by a single space; a vertical jump larger than
/// `line_jitter` between consecutive runs starts a new line. Runs of
/// spaces are collapsed and every line is trimmed.
pub fn join_runs(runs: &[TextRun], line_jitter: f32) -> String {
    let mut joined = String::new();
    let mut last_y: Option<f32> = None;

    for run in runs {
        if let Some(y) = last_y {
            if (y - run.y).abs() > line_jitter {
                joined.push('\n');
            } else {
                joined.push(' ');
            }
        }
        joined.push_str(&run.text);
        last_y = Some(run.y);
    }

    collapse_spaces(&joined)
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Read and join the text layer of `pdf_bytes`.
///
/// Fails only when the document cannot be opened. Pages that fail on their
/// own contribute a placeholder block and the loop continues.
pub fn extract_text_layer(
    layer: &dyn PdfTextLayer,
    pdf_bytes: &[u8],
    config: &ExtractionConfig,
) -> Result<TextLayerOutput, ExtractionError> {
    let runs = layer.read_runs(pdf_bytes, config.max_pages)?;

    let mut output = TextLayerOutput {
        pages_total: runs.page_count,
        ..Default::default()
    };

    for (index, page) in runs.pages.into_iter().take(config.max_pages).enumerate() {
        let page_number = index + 1;
        output.text.push_str(&page_header(page_number));
        output.text.push('\n');
        match page {
            Ok(page_runs) => {
                let text = join_runs(&page_runs, config.line_jitter);
                output.page_chars.push(text.chars().count());
                output.text.push_str(&text);
            }
            Err(e) => {
                tracing::warn!(page = page_number, error = %e, "Failed to extract page text");
                output.text.push_str(PAGE_ERROR_PLACEHOLDER);
            }
        }
        output.text.push_str("\n\n");
        output.pages_processed += 1;
    }

    if output.pages_total > config.max_pages {
        output.truncated = true;
        output.text.push_str(&truncation_notice(config.max_pages));
    }

    tracing::debug!(
        pages_total = output.pages_total,
        pages_processed = output.pages_processed,
        truncated = output.truncated,
        "Text layer extracted"
    );

    Ok(output)
}

/// OCR decision for a text layer.
///
/// True when no page holds more than `min_page_chars` characters, or when
/// those pages together hold fewer than `ocr_trigger_chars`.
pub fn needs_ocr(output: &TextLayerOutput, config: &ExtractionConfig) -> bool {
    let has_text = output.page_chars.iter().any(|&c| c > config.min_page_chars);
    !has_text || output.chars_on_text_pages(config.min_page_chars) < config.ocr_trigger_chars
}

// ── Mock for testing ──────────────────────────────────────

/// Scripted text layer. Each page is either a list of runs or a failure.
#[cfg(test)]
pub struct MockPdfTextLayer {
    pub pages: Vec<Option<Vec<TextRun>>>,
    pub delay: Option<std::time::Duration>,
    pub fail_load: bool,
}

#[cfg(test)]
impl MockPdfTextLayer {
    pub fn with_pages(pages: Vec<Option<Vec<TextRun>>>) -> Self {
        Self {
            pages,
            delay: None,
            fail_load: false,
        }
    }

    /// `count` pages, each one line of `text`.
    pub fn uniform(count: usize, text: &str) -> Self {
        Self::with_pages(
            (0..count)
                .map(|_| Some(vec![TextRun::new(text, 700.0)]))
                .collect(),
        )
    }

    pub fn corrupt() -> Self {
        Self {
            pages: Vec::new(),
            delay: None,
            fail_load: true,
        }
    }

    pub fn slow(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[cfg(test)]
impl PdfTextLayer for MockPdfTextLayer {
    fn read_runs(
        &self,
        _pdf_bytes: &[u8],
        max_pages: usize,
    ) -> Result<super::types::PdfRuns, ExtractionError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail_load {
            return Err(ExtractionError::PdfParsing("Invalid PDF structure".into()));
        }
        let pages = self
            .pages
            .iter()
            .take(max_pages)
            .enumerate()
            .map(|(i, p)| match p {
                Some(runs) => Ok(runs.clone()),
                None => Err(ExtractionError::PdfPage {
                    page: i + 1,
                    reason: "bad content stream".into(),
                }),
            })
            .collect();
        Ok(super::types::PdfRuns {
            page_count: self.pages.len(),
            pages,
        })
    }
}
