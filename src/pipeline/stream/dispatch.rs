use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::sse::SseDecoder;
use super::types::StreamEvent;
use super::StreamError;
use crate::config::ChatEndpointConfig;
use crate::models::{Message, MessageRole};
use crate::pipeline::extraction::Attachment;

/// Buffered events between the body reader and the reconciler.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// System prompt sent ahead of every conversation.
pub const SYSTEM_PROMPT: &str = "\
You are an Invoice Processing Assistant. Help users with:
- Invoice data extraction
- Payment processing
- Invoice validation
- Expense categorization
- Financial reporting

Be friendly and helpful. Explain how users can upload invoices for processing.
For questions not related to invoices, politely redirect the conversation to invoice topics.";

/// One outgoing exchange.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation before this exchange, oldest first.
    pub history: Vec<Message>,
    /// Formatted user message, including any extracted attachment text.
    pub user_content: String,
    pub session_id: Option<String>,
    /// Raw file sent alongside the messages as multipart.
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ApiMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    messages: &'a [ApiMessage],
    stream: bool,
    session_id: &'a str,
    max_tokens: u32,
    temperature: f32,
}

/// Build the role/content list sent to the endpoint: system prompt, prior
/// history (agent → `assistant`), then the new user message. Failed or
/// empty agent replies are left out.
pub fn build_api_messages(request: &ChatRequest) -> Vec<ApiMessage> {
    let mut messages = vec![ApiMessage {
        role: MessageRole::System.api_role(),
        content: SYSTEM_PROMPT.to_string(),
    }];
    messages.extend(
        request
            .history
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .filter(|m| !(m.role == MessageRole::Agent && (m.streaming_error || m.content.is_empty())))
            .map(|m| ApiMessage {
                role: m.role.api_role(),
                content: m.content.clone(),
            }),
    );
    messages.push(ApiMessage {
        role: MessageRole::User.api_role(),
        content: request.user_content.clone(),
    });
    messages
}

/// Sends exchanges to the chat endpoint and streams back decoded events.
pub struct ChatDispatcher {
    client: reqwest::Client,
    config: ChatEndpointConfig,
}

impl ChatDispatcher {
    pub fn new(config: ChatEndpointConfig) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| StreamError::HttpClient(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ChatEndpointConfig {
        &self.config
    }

    /// Send `request` and return the event receiver.
    ///
    /// Connection and non-2xx failures are returned directly. Once the body
    /// starts streaming, transport failures arrive as a `RunError` event.
    /// Dropping the receiver stops the body reader.
    pub async fn dispatch(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, StreamError> {
        let messages = build_api_messages(request);
        let session_id = request.session_id.clone().unwrap_or_default();
        let url = self.config.request_url();

        let mut builder = self.client.post(&url);
        if !self.config.api_key.is_empty() {
            builder = builder.header("api-key", &self.config.api_key);
        }

        builder = match &request.attachment {
            Some(attachment) => {
                builder.multipart(self.multipart_form(&messages, &session_id, request, attachment)?)
            }
            None => builder.json(&ChatBody {
                messages: &messages,
                stream: true,
                session_id: &session_id,
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            }),
        };

        info!(
            endpoint = %self.config.endpoint,
            messages = messages.len(),
            has_attachment = request.attachment.is_some(),
            session = %session_id,
            "Dispatching chat request"
        );

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                StreamError::Connection(self.config.endpoint.clone())
            } else if e.is_timeout() {
                StreamError::HttpClient("Request timed out".into())
            } else {
                StreamError::HttpClient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let decoder = SseDecoder::new(request.session_id.clone());
        tokio::spawn(pump_body(response.bytes_stream(), decoder, tx));
        Ok(rx)
    }

    fn multipart_form(
        &self,
        messages: &[ApiMessage],
        session_id: &str,
        request: &ChatRequest,
        attachment: &Attachment,
    ) -> Result<reqwest::multipart::Form, StreamError> {
        let messages_json =
            serde_json::to_string(messages).map_err(|e| StreamError::Encoding(e.to_string()))?;
        let metadata_json = serde_json::to_string(&attachment.meta())
            .map_err(|e| StreamError::Encoding(e.to_string()))?;

        let mut part = reqwest::multipart::Part::bytes(attachment.raw_bytes.clone())
            .file_name(attachment.name.clone());
        if !attachment.mime_type.is_empty() {
            part = part
                .mime_str(&attachment.mime_type)
                .map_err(|e| StreamError::Encoding(e.to_string()))?;
        }

        Ok(reqwest::multipart::Form::new()
            .text("messages", messages_json)
            .text("message", request.user_content.clone())
            .text("stream", "true")
            .text("session_id", session_id.to_string())
            .text("max_tokens", self.config.max_tokens.to_string())
            .text("temperature", self.config.temperature.to_string())
            .text("attachment_metadata", metadata_json)
            .part("file", part))
    }
}

/// Decode the body into events until it ends, fails, or the receiver goes away.
async fn pump_body<S>(body: S, mut decoder: SseDecoder, tx: mpsc::Sender<StreamEvent>)
where
    S: futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>>,
{
    let mut body = std::pin::pin!(body);
    while let Some(chunk) = body.next().await {
        let events = match chunk {
            Ok(bytes) => decoder.push(&bytes),
            Err(e) => {
                warn!(error = %e, "Chat stream interrupted");
                let _ = tx
                    .send(StreamEvent::error(&format!("Stream interrupted: {e}")))
                    .await;
                return;
            }
        };
        for event in events {
            if tx.send(event).await.is_err() {
                debug!("Event receiver dropped, stopping body reader");
                return;
            }
        }
        if decoder.is_done() {
            return;
        }
    }
    for event in decoder.finish() {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
