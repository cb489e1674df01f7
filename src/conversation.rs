//! In-memory state of the active chat.
//!
//! One `Conversation` is owned by the chat driver and passed by `&mut` to
//! whatever mutates it; there is no ambient store.

use crate::models::{Message, MessageRole, SessionEntry};

#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    session_id: Option<String>,
    /// Known sessions, newest first.
    sessions: Vec<SessionEntry>,
    /// Last streaming error, shown outside the chat transcript.
    error: Option<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted state.
    pub fn restore(
        messages: Vec<Message>,
        sessions: Vec<SessionEntry>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            messages,
            session_id: session_id.filter(|s| !s.is_empty()),
            sessions,
            error: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn set_session_id(&mut self, session_id: &str) {
        self.session_id = Some(session_id.to_string());
    }

    /// Put back a session id saved earlier, including none.
    pub fn restore_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    pub fn sessions(&self) -> &[SessionEntry] {
        &self.sessions
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, message: &str) {
        self.error = Some(message.to_string());
    }

    /// Start an exchange: roll back a failed previous exchange, then append
    /// the user message and an empty agent placeholder.
    ///
    /// Returns true when a failed `(user, agent)` pair was discarded.
    pub fn begin_exchange(&mut self, user_message: Message) -> bool {
        let rolled_back = self.rollback_failed_pair();
        let placeholder_at = user_message.created_at + 1;
        self.error = None;
        self.messages.push(user_message);
        self.messages.push(Message::agent_placeholder(placeholder_at));
        rolled_back
    }

    fn rollback_failed_pair(&mut self) -> bool {
        let n = self.messages.len();
        if n < 2 {
            return false;
        }
        let failed = self.messages[n - 1].is_failed_agent()
            && self.messages[n - 2].role == MessageRole::User;
        if failed {
            self.messages.truncate(n - 2);
            tracing::debug!("Discarded failed exchange before resubmitting");
        }
        failed
    }

    /// The trailing message, if it is the agent reply being streamed.
    pub fn last_agent_mut(&mut self) -> Option<&mut Message> {
        self.messages
            .last_mut()
            .filter(|m| m.role == MessageRole::Agent)
    }

    /// Flag the trailing agent message as failed.
    pub fn mark_streaming_error(&mut self) {
        if let Some(agent) = self.last_agent_mut() {
            agent.streaming_error = true;
        }
    }

    /// Add a session entry at the front unless one with the same id exists.
    pub fn add_session(&mut self, entry: SessionEntry) -> bool {
        if self.sessions.iter().any(|s| s.session_id == entry.session_id) {
            return false;
        }
        self.sessions.insert(0, entry);
        true
    }

    pub fn remove_session(&mut self, session_id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.session_id != session_id);
        self.sessions.len() != before
    }
}
