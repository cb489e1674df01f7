use serde::{Deserialize, Serialize};

/// Sidebar entry for a chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub title: String,
    /// Unix seconds.
    pub created_at: i64,
}

/// Session title from the first user message: at most 30 characters,
/// with "..." when cut. UTF-8 safe.
pub fn session_title(first_message: &str) -> String {
    const MAX_TITLE_CHARS: usize = 30;

    let trimmed = first_message.trim();
    if trimmed.is_empty() {
        return "New conversation".to_string();
    }

    match trimmed.char_indices().nth(MAX_TITLE_CHARS) {
        Some((boundary, _)) => format!("{}...", &trimmed[..boundary]),
        None => trimmed.to_string(),
    }
}
