//! Flat JSON persistence for the active conversation.
//!
//! Layout under the store directory:
//! - `messages.json`: message history per session id. The empty key holds a
//!   conversation that has not been assigned a session yet.
//! - `sessions.json`: known `SessionEntry` records, newest first
//! - `active_session.json`: id of the session the last run worked on
//!
//! Loads never fail: a missing or unreadable file yields empty state.
//! Saves are fire-and-forget and only log on failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::Conversation;
use crate::models::{Message, SessionEntry};

pub const MESSAGES_NAMESPACE: &str = "messages";
const SESSIONS_FILE: &str = "sessions.json";
const ACTIVE_SESSION_FILE: &str = "active_session.json";

/// Key of the history that has no session id yet.
const UNASSIGNED_KEY: &str = "";

type Histories = BTreeMap<String, Vec<Message>>;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store JSON error in {file}: {source}")]
    Json {
        file: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ActiveSession {
    session_id: Option<String>,
}

/// Session id → message history and session registry, on disk.
#[derive(Debug, Clone)]
pub struct SessionLedger {
    dir: PathBuf,
}

impl SessionLedger {
    /// Open (and create if needed) a store directory.
    pub fn open(dir: &Path) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    // ── Messages ─────────────────────────────────────────

    fn load_histories(&self) -> Histories {
        self.read_or_default(&self.namespace_path(MESSAGES_NAMESPACE))
    }

    /// Saved history of `session_id` (`None` for the unassigned one), or empty.
    pub fn load_messages(&self, session_id: Option<&str>) -> Vec<Message> {
        self.load_histories()
            .remove(session_id.unwrap_or(UNASSIGNED_KEY))
            .unwrap_or_default()
    }

    /// Replace the history of `session_id`. Other sessions are untouched.
    ///
    /// Saving under a session id also drops the unassigned history: that
    /// conversation has just been given this id.
    pub fn save_messages(&self, session_id: Option<&str>, messages: &[Message]) {
        let mut histories = self.load_histories();
        if session_id.is_some() {
            histories.remove(UNASSIGNED_KEY);
        }
        histories.insert(
            session_id.unwrap_or(UNASSIGNED_KEY).to_string(),
            messages.to_vec(),
        );
        self.write_logged(&self.namespace_path(MESSAGES_NAMESPACE), &histories);
    }

    // ── Sessions ─────────────────────────────────────────

    pub fn load_sessions(&self) -> Vec<SessionEntry> {
        self.read_or_default(&self.dir.join(SESSIONS_FILE))
    }

    pub fn save_sessions(&self, sessions: &[SessionEntry]) {
        self.write_logged(&self.dir.join(SESSIONS_FILE), &sessions);
    }

    pub fn load_active_session(&self) -> Option<String> {
        self.read_or_default::<ActiveSession>(&self.dir.join(ACTIVE_SESSION_FILE))
            .session_id
            .filter(|s| !s.is_empty())
    }

    pub fn save_active_session(&self, session_id: Option<&str>) {
        let active = ActiveSession {
            session_id: session_id.map(str::to_string),
        };
        self.write_logged(&self.dir.join(ACTIVE_SESSION_FILE), &active);
    }

    // ── Whole conversation ───────────────────────────────

    /// Restore a persisted conversation: the requested session, or the
    /// last active one. An unknown session id starts an empty history.
    pub fn load_conversation(&self, session_id: Option<&str>) -> Conversation {
        let session_id = match session_id {
            Some(requested) => Some(requested.to_string()),
            None => self.load_active_session(),
        };
        let messages = self.load_messages(session_id.as_deref());
        tracing::debug!(
            session = session_id.as_deref().unwrap_or("-"),
            messages = messages.len(),
            "Loaded conversation"
        );
        Conversation::restore(messages, self.load_sessions(), session_id)
    }

    /// Empty conversation that keeps the known session list.
    pub fn fresh_conversation(&self) -> Conversation {
        Conversation::restore(vec![], self.load_sessions(), None)
    }

    pub fn save_conversation(&self, conv: &Conversation) {
        self.save_messages(conv.session_id(), conv.messages());
        self.save_sessions(conv.sessions());
        self.save_active_session(conv.session_id());
    }

    // ── File helpers ─────────────────────────────────────

    fn read_or_default<T: DeserializeOwned + Default>(&self, path: &Path) -> T {
        match read_json(path) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable store file");
                T::default()
            }
        }
    }

    fn write_logged<T: Serialize + ?Sized>(&self, path: &Path, value: &T) {
        if let Err(e) = write_json(path, value) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist store file");
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, LedgerError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&content).map_err(|source| LedgerError::Json {
        file: file_label(path),
        source,
    })?;
    Ok(Some(value))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| LedgerError::Json {
        file: file_label(path),
        source,
    })?;
    std::fs::write(path, json)?;
    Ok(())
}
