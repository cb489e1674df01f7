use serde::{Deserialize, Serialize};

use super::enums::MessageRole;

/// Display metadata for a file attached to a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetrics {
    #[serde(default)]
    pub time: f64,
}

/// A tool invocation reported by the agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_call_id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: serde_json::Value,
    #[serde(default)]
    pub tool_call_error: bool,
    #[serde(default)]
    pub metrics: ToolMetrics,
    #[serde(default)]
    pub created_at: i64,
}

/// One step of the agent's visible reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Retrieval references attached to a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceData {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub references: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_steps: Option<Vec<ReasoningStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<ReferenceData>>,
}

impl ExtraData {
    pub fn is_empty(&self) -> bool {
        self.reasoning_steps.is_none() && self.references.is_none()
    }
}

/// Spoken response returned alongside the text reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseAudio {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
}

/// Media the agent produced. Payloads are opaque to the core and kept as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Media {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub videos: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_audio: Option<ResponseAudio>,
}

/// A chat message as held by the conversation and persisted by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Unix seconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub streaming_error: bool,
    #[serde(default, skip_serializing_if = "ExtraData::is_empty")]
    pub extra_data: ExtraData,
    #[serde(flatten)]
    pub media: Media,
}

impl Message {
    fn new(role: MessageRole, content: &str, created_at: i64) -> Self {
        Self {
            role,
            content: content.to_string(),
            created_at,
            attachments: vec![],
            tool_calls: vec![],
            streaming_error: false,
            extra_data: ExtraData::default(),
            media: Media::default(),
        }
    }

    pub fn user(content: &str, created_at: i64) -> Self {
        Self::new(MessageRole::User, content, created_at)
    }

    /// Empty agent placeholder filled in by the reconciler.
    pub fn agent_placeholder(created_at: i64) -> Self {
        Self::new(MessageRole::Agent, "", created_at)
    }

    pub fn system(content: &str, created_at: i64) -> Self {
        Self::new(MessageRole::System, content, created_at)
    }

    pub fn with_attachment(mut self, meta: AttachmentMeta) -> Self {
        self.attachments.push(meta);
        self
    }

    pub fn is_failed_agent(&self) -> bool {
        self.role == MessageRole::Agent && self.streaming_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_empty_agent() {
        let msg = Message::agent_placeholder(10);
        assert_eq!(msg.role, MessageRole::Agent);
        assert!(msg.content.is_empty());
        assert!(!msg.streaming_error);
    }

    #[test]
    fn failed_agent_detection() {
        let mut msg = Message::agent_placeholder(10);
        assert!(!msg.is_failed_agent());
        msg.streaming_error = true;
        assert!(msg.is_failed_agent());

        let mut user = Message::user("hi", 10);
        user.streaming_error = true;
        assert!(!user.is_failed_agent());
    }

    #[test]
    fn serialized_message_omits_empty_fields() {
        let json = serde_json::to_value(Message::user("hello", 1)).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("images").is_none());
        assert!(json.get("extra_data").is_none());
    }

    #[test]
    fn deserializes_minimal_message() {
        let msg: Message =
            serde_json::from_str(r#"{"role":"agent","content":"ok","created_at":5}"#).unwrap();
        assert_eq!(msg.role, MessageRole::Agent);
        assert!(msg.tool_calls.is_empty());
        assert!(msg.media.images.is_none());
    }

    #[test]
    fn media_is_flattened() {
        let mut msg = Message::agent_placeholder(1);
        msg.media.images = Some(vec![serde_json::json!({"url": "https://x/y.png"})]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["images"][0]["url"], "https://x/y.png");
    }
}
