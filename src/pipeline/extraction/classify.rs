use crate::models::DocumentKind;

/// Pick an extraction strategy from the declared MIME type and filename.
///
/// Total: anything unrecognised is `Other`. A missing or generic
/// (`application/octet-stream`) MIME type falls back to the type guessed
/// from the filename extension.
pub fn classify_attachment(mime_type: &str, filename: &str) -> DocumentKind {
    let declared = mime_type.trim().to_ascii_lowercase();
    let effective = if declared.is_empty() || declared == "application/octet-stream" {
        mime_guess::from_path(filename)
            .first_raw()
            .map(|m| m.to_string())
            .unwrap_or(declared)
    } else {
        declared
    };

    let lower_name = filename.to_ascii_lowercase();

    if effective.starts_with("image/") {
        DocumentKind::Image
    } else if effective == "application/pdf" || lower_name.ends_with(".pdf") {
        DocumentKind::Pdf
    } else if effective == "text/plain" || lower_name.ends_with(".txt") {
        DocumentKind::PlainText
    } else {
        DocumentKind::Other
    }
}

/// Human-readable size for attachment headers ("12.3 KB").
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    let b = bytes as f64;
    if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{bytes} bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_by_mime() {
        assert_eq!(classify_attachment("image/png", "scan.png"), DocumentKind::Image);
        assert_eq!(classify_attachment("image/jpeg", "x"), DocumentKind::Image);
    }

    #[test]
    fn pdf_by_mime_or_extension() {
        assert_eq!(classify_attachment("application/pdf", "a"), DocumentKind::Pdf);
        assert_eq!(classify_attachment("", "Invoice.PDF"), DocumentKind::Pdf);
    }

    #[test]
    fn plain_text_by_mime_or_extension() {
        assert_eq!(classify_attachment("text/plain", "notes"), DocumentKind::PlainText);
        assert_eq!(
            classify_attachment("application/octet-stream", "notes.txt"),
            DocumentKind::PlainText
        );
    }

    #[test]
    fn octet_stream_uses_filename_guess() {
        assert_eq!(
            classify_attachment("application/octet-stream", "photo.jpg"),
            DocumentKind::Image
        );
    }

    #[test]
    fn unknown_types_are_other() {
        assert_eq!(
            classify_attachment(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                "invoice.docx"
            ),
            DocumentKind::Other
        );
        assert_eq!(classify_attachment("", ""), DocumentKind::Other);
        assert_eq!(classify_attachment("audio/mpeg", "song.mp3"), DocumentKind::Other);
    }

    #[test]
    fn declared_mime_is_case_insensitive() {
        assert_eq!(classify_attachment("Application/PDF", "a"), DocumentKind::Pdf);
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
