use serde::Deserialize;
use serde_json::Value;

use crate::models::{ExtraData, ResponseAudio, ToolCall};

/// Agent run event names on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RunEventKind {
    RunStarted,
    ReasoningStarted,
    RunResponse,
    RunError,
    RunCompleted,
}

impl RunEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "RunStarted",
            Self::ReasoningStarted => "ReasoningStarted",
            Self::RunResponse => "RunResponse",
            Self::RunError => "RunError",
            Self::RunCompleted => "RunCompleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunError | Self::RunCompleted)
    }
}

/// Payload of a chunk, resolved once when the frame is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Structured(Value),
}

impl Content {
    /// `null` carries no content; strings are text; anything else is structured.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self::Text(s)),
            other => Some(Self::Structured(other)),
        }
    }

    /// Flat text form: structured content as compact JSON.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Structured(v) => v.to_string(),
        }
    }
}

/// One decoded chunk of a streamed agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: RunEventKind,
    pub session_id: Option<String>,
    pub content: Option<Content>,
    pub tools: Option<Vec<ToolCall>>,
    pub extra_data: Option<ExtraData>,
    pub images: Option<Vec<Value>>,
    pub videos: Option<Vec<Value>>,
    pub audio: Option<Vec<Value>>,
    pub response_audio: Option<ResponseAudio>,
    pub created_at: Option<i64>,
}

impl StreamEvent {
    pub fn new(kind: RunEventKind) -> Self {
        Self {
            kind,
            session_id: None,
            content: None,
            tools: None,
            extra_data: None,
            images: None,
            videos: None,
            audio: None,
            response_audio: None,
            created_at: None,
        }
    }

    pub fn text(kind: RunEventKind, text: &str) -> Self {
        Self {
            content: Some(Content::Text(text.to_string())),
            ..Self::new(kind)
        }
    }

    pub fn started(session_id: Option<String>) -> Self {
        Self {
            session_id,
            ..Self::new(RunEventKind::RunStarted)
        }
    }

    /// Synthetic error event for transport failures.
    pub fn error(message: &str) -> Self {
        Self::text(RunEventKind::RunError, message)
    }
}

/// Wire shape of an agent run frame.
#[derive(Debug, Deserialize)]
pub(crate) struct RunFrame {
    pub event: RunEventKind,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub tools: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub extra_data: Option<ExtraData>,
    #[serde(default)]
    pub images: Option<Vec<Value>>,
    #[serde(default)]
    pub videos: Option<Vec<Value>>,
    #[serde(default)]
    pub audio: Option<Vec<Value>>,
    #[serde(default)]
    pub response_audio: Option<ResponseAudio>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl From<RunFrame> for StreamEvent {
    fn from(frame: RunFrame) -> Self {
        Self {
            kind: frame.event,
            session_id: frame.session_id.filter(|s| !s.is_empty()),
            content: Content::from_value(frame.content),
            tools: frame.tools,
            extra_data: frame.extra_data,
            images: frame.images,
            videos: frame.videos,
            audio: frame.audio,
            response_audio: frame.response_audio,
            created_at: frame.created_at,
        }
    }
}
