use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "PaperChat";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Env var overriding the data directory (tests, portable installs).
pub const DATA_DIR_ENV: &str = "PAPERCHAT_DATA_DIR";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "paperchat=info,paperchat_lib=info,warn"
}

/// Get the application data directory.
/// `~/PaperChat/` on all platforms unless `PAPERCHAT_DATA_DIR` is set.
/// Falls back to the working directory when no home directory exists.
pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    match dirs::home_dir() {
        Some(home) => home.join(APP_NAME),
        None => {
            tracing::warn!("Cannot determine home directory, using working directory");
            PathBuf::from(".").join(APP_NAME)
        }
    }
}

/// Directory holding the persisted conversation store.
pub fn store_dir() -> PathBuf {
    app_data_dir().join("store")
}

/// Tesseract language data: `TESSDATA_PREFIX` if set, else `~/PaperChat/tessdata`.
pub fn tessdata_dir() -> PathBuf {
    match std::env::var("TESSDATA_PREFIX") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => app_data_dir().join("tessdata"),
    }
}

// ═══════════════════════════════════════════════════════════
// Extraction
// ═══════════════════════════════════════════════════════════

/// Tunables for the attachment extraction pipeline.
///
/// Defaults are the values the pipeline was calibrated with; tests shrink
/// the deadline to exercise the timeout path.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Hard cap on pages read from a PDF text layer.
    pub max_pages: usize,
    /// Deadline for the whole PDF load-and-parse step.
    pub deadline: Duration,
    /// Below this many characters of page text, the PDF is treated as a scan.
    pub ocr_trigger_chars: usize,
    /// A page counts as "having text" above this many characters.
    pub min_page_chars: usize,
    /// Vertical distance (PDF units) between runs that starts a new line.
    pub line_jitter: f32,
    /// Rendering DPI for PDF pages handed to OCR.
    pub ocr_render_dpi: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_pages: 20,
            deadline: Duration::from_secs(30),
            ocr_trigger_chars: 500,
            min_page_chars: 50,
            line_jitter: 10.0,
            ocr_render_dpi: 300,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Chat endpoint
// ═══════════════════════════════════════════════════════════

pub const DEFAULT_API_VERSION: &str = "2025-01-01-preview";

/// Where and how chat completions are requested.
#[derive(Debug, Clone)]
pub struct ChatEndpointConfig {
    /// Full completion URL without the `api-version` query.
    pub endpoint: String,
    /// Sent as the `api-key` header when non-empty.
    pub api_key: String,
    pub api_version: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Upper bound for one exchange; a stream silent past this is abandoned.
    pub max_exchange_duration: Duration,
}

impl ChatEndpointConfig {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: String::new(),
            api_version: DEFAULT_API_VERSION.to_string(),
            max_tokens: 4000,
            temperature: 0.7,
            max_exchange_duration: Duration::from_secs(300),
        }
    }

    /// Read `AZURE_OPENAI_ENDPOINT`, `AZURE_OPENAI_API_KEY` and
    /// `AZURE_OPENAI_API_VERSION`. Returns `None` without an endpoint.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("AZURE_OPENAI_ENDPOINT").ok()?;
        if endpoint.trim().is_empty() {
            return None;
        }
        let mut config = Self::new(endpoint.trim());
        if let Ok(key) = std::env::var("AZURE_OPENAI_API_KEY") {
            config.api_key = key;
        }
        if let Ok(version) = std::env::var("AZURE_OPENAI_API_VERSION") {
            if !version.trim().is_empty() {
                config.api_version = version.trim().to_string();
            }
        }
        Some(config)
    }

    /// Endpoint with the `api-version` query appended.
    pub fn request_url(&self) -> String {
        if self.api_version.is_empty() {
            return self.endpoint.clone();
        }
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{sep}api-version={}", self.endpoint, self.api_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_name_is_paperchat() {
        assert_eq!(APP_NAME, "PaperChat");
    }

    #[test]
    fn store_dir_under_app_data() {
        let store = store_dir();
        assert!(store.starts_with(app_data_dir()));
        assert!(store.ends_with("store"));
    }

    #[test]
    fn extraction_defaults() {
        let config = ExtractionConfig::default();
        assert_eq!(config.max_pages, 20);
        assert_eq!(config.deadline, Duration::from_secs(30));
        assert_eq!(config.ocr_trigger_chars, 500);
        assert!((config.line_jitter - 10.0).abs() < f32::EPSILON);
    }

    #[test]
    fn request_url_appends_api_version() {
        let config = ChatEndpointConfig::new("https://example.test/chat/completions/");
        assert_eq!(
            config.request_url(),
            "https://example.test/chat/completions?api-version=2025-01-01-preview"
        );
    }

    #[test]
    fn request_url_respects_existing_query() {
        let mut config = ChatEndpointConfig::new("https://example.test/run?x=1");
        config.api_version = "v1".into();
        assert_eq!(config.request_url(), "https://example.test/run?x=1&api-version=v1");
    }

    #[test]
    fn request_url_without_version() {
        let mut config = ChatEndpointConfig::new("http://127.0.0.1:9/run");
        config.api_version.clear();
        assert_eq!(config.request_url(), "http://127.0.0.1:9/run");
    }
}
