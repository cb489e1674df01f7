use tracing::{debug, info, warn};

use super::types::{Content, RunEventKind, StreamEvent};
use crate::conversation::Conversation;
use crate::models::{session_title, Message, ResponseAudio, SessionEntry};

/// Where one exchange is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Dispatched,
    Streaming,
    Completed,
    Errored,
}

/// Render structured content as a fenced JSON block.
pub fn json_markdown(value: &serde_json::Value) -> String {
    let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    format!("```json\n{pretty}\n```")
}

/// Folds the events of one exchange into the trailing agent message.
///
/// Events are applied in arrival order. Anything after `RunCompleted` or
/// `RunError` is ignored.
#[derive(Debug)]
pub struct Reconciler {
    state: ExchangeState,
    user_text: String,
    started_at: i64,
    /// Full content of the last string chunk, for suffix detection.
    last_content: String,
    /// Session entry created by this exchange, evicted if it fails.
    created_session: Option<String>,
    /// Conversation session id before this exchange adopted a new one.
    prior_session: Option<String>,
}

impl Reconciler {
    /// `user_text` titles a new session; `started_at` is the submit time.
    pub fn new(user_text: &str, started_at: i64) -> Self {
        Self {
            state: ExchangeState::Dispatched,
            user_text: user_text.to_string(),
            started_at,
            last_content: String::new(),
            created_session: None,
            prior_session: None,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ExchangeState::Completed | ExchangeState::Errored)
    }

    pub fn created_session(&self) -> Option<&str> {
        self.created_session.as_deref()
    }

    pub fn apply(&mut self, conv: &mut Conversation, event: StreamEvent) {
        if self.is_finished() {
            debug!(kind = event.kind.as_str(), "Ignoring event after terminal event");
            return;
        }

        match event.kind {
            RunEventKind::RunStarted | RunEventKind::ReasoningStarted => self.on_started(conv, &event),
            RunEventKind::RunResponse => {
                self.state = ExchangeState::Streaming;
                self.on_response(conv, event);
            }
            RunEventKind::RunError => {
                let message = event
                    .content
                    .as_ref()
                    .map(Content::to_text)
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "The agent run failed.".to_string());
                self.fail(conv, &message);
            }
            RunEventKind::RunCompleted => self.on_completed(conv, event),
        }
    }

    /// Transport failure or run error: flag the reply, surface the message
    /// in the error slot and drop the session entry this exchange created,
    /// along with the id it adopted.
    pub fn fail(&mut self, conv: &mut Conversation, message: &str) {
        if self.is_finished() {
            debug!("Ignoring failure after terminal event");
            return;
        }
        warn!(error = %message, "Exchange failed");
        conv.mark_streaming_error();
        conv.set_error(message);
        if let Some(session_id) = self.created_session.take() {
            conv.remove_session(&session_id);
            conv.restore_session_id(self.prior_session.take());
        }
        self.state = ExchangeState::Errored;
    }

    fn on_started(&mut self, conv: &mut Conversation, event: &StreamEvent) {
        if self.state != ExchangeState::Dispatched {
            if let (Some(new), Some(current)) = (event.session_id.as_deref(), conv.session_id()) {
                if new != current {
                    debug!(current, ignored = new, "Session id already fixed for this exchange");
                }
            }
            return;
        }
        self.state = ExchangeState::Streaming;

        let previous = conv.session_id().map(str::to_string);
        let session_id = event
            .session_id
            .clone()
            .or_else(|| previous.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        conv.set_session_id(&session_id);
        if previous.as_deref() == Some(session_id.as_str()) {
            return;
        }

        let entry = SessionEntry {
            session_id: session_id.clone(),
            title: session_title(&self.user_text),
            created_at: event.created_at.unwrap_or(self.started_at),
        };
        if conv.add_session(entry) {
            info!(session = %session_id, "New chat session");
            self.created_session = Some(session_id);
            self.prior_session = previous;
        }
    }

    fn on_response(&mut self, conv: &mut Conversation, event: StreamEvent) {
        let Some(agent) = conv.last_agent_mut() else {
            warn!("No agent message to stream into");
            return;
        };

        match event.content {
            Some(Content::Text(text)) => {
                let unseen = text.strip_prefix(self.last_content.as_str()).unwrap_or(&text);
                agent.content.push_str(unseen);
                self.last_content = text;
            }
            Some(Content::Structured(value)) => {
                let block = json_markdown(&value);
                agent.content.push_str(&block);
                self.last_content = block;
            }
            None => {}
        }

        if let Some(tools) = event.tools.filter(|t| !t.is_empty()) {
            agent.tool_calls = tools;
        }
        if let Some(extra) = event.extra_data {
            if extra.reasoning_steps.is_some() {
                agent.extra_data.reasoning_steps = extra.reasoning_steps;
            }
            if extra.references.is_some() {
                agent.extra_data.references = extra.references;
            }
        }
        if let Some(created_at) = event.created_at {
            agent.created_at = created_at;
        }
        if event.images.is_some() {
            agent.media.images = event.images;
        }
        if event.videos.is_some() {
            agent.media.videos = event.videos;
        }
        if event.audio.is_some() {
            agent.media.audio = event.audio;
        }
        if let Some(fragment) = event.response_audio.and_then(|a| a.transcript) {
            append_transcript(agent, &fragment);
        }
    }

    fn on_completed(&mut self, conv: &mut Conversation, event: StreamEvent) {
        self.state = ExchangeState::Completed;
        let Some(agent) = conv.last_agent_mut() else {
            warn!("No agent message to complete");
            return;
        };

        if let Some(content) = &event.content {
            agent.content = content.to_text();
        }
        if let Some(tools) = event.tools.filter(|t| !t.is_empty()) {
            agent.tool_calls = tools;
        }
        if let Some(extra) = event.extra_data {
            agent.extra_data.reasoning_steps =
                extra.reasoning_steps.or(agent.extra_data.reasoning_steps.take());
            agent.extra_data.references = extra.references.or(agent.extra_data.references.take());
        }
        agent.media.images = event.images.or(agent.media.images.take());
        agent.media.videos = event.videos.or(agent.media.videos.take());
        agent.media.audio = event.audio.or(agent.media.audio.take());
        agent.media.response_audio = event.response_audio.or(agent.media.response_audio.take());
        agent.created_at = event.created_at.unwrap_or(agent.created_at);

        debug!(chars = agent.content.len(), "Exchange completed");
    }
}

fn append_transcript(agent: &mut Message, fragment: &str) {
    let audio = agent.media.response_audio.get_or_insert_with(ResponseAudio::default);
    audio
        .transcript
        .get_or_insert_with(String::new)
        .push_str(fragment);
}
