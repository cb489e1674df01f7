//! Chat exchange driver.
//!
//! Wires one exchange end to end:
//! - attachment → `DocumentExtractor` → formatted user message
//! - `Conversation::begin_exchange` (rollback of a failed pair)
//! - `ChatDispatcher` → `Reconciler` until a terminal event or the deadline
//! - `SessionLedger` persistence
//!
//! The driver owns the `Conversation`; nothing else mutates it while an
//! exchange is in flight.

use crate::conversation::Conversation;
use crate::models::{DocumentKind, Message, MessageRole};
use crate::pipeline::extraction::{
    format_attachment_message, format_other_attachment, Attachment, DocumentExtractor,
};
use crate::pipeline::stream::{ChatDispatcher, ChatRequest, ExchangeState, Reconciler};
use crate::session_ledger::SessionLedger;

pub const STREAM_ENDED_MESSAGE: &str = "The response stream ended before the reply was complete.";

// ═══════════════════════════════════════════
// Outcome
// ═══════════════════════════════════════════

/// What one exchange left behind.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub state: ExchangeState,
    /// Final content of the agent message.
    pub reply: String,
    /// Error slot contents when the exchange failed.
    pub error: Option<String>,
    pub session_id: Option<String>,
    /// A failed previous exchange was discarded before this one.
    pub rolled_back: bool,
}

impl ExchangeOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == ExchangeState::Completed
    }
}

// ═══════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════

pub struct ChatDriver {
    dispatcher: ChatDispatcher,
    extractor: DocumentExtractor,
    ledger: SessionLedger,
    conversation: Conversation,
}

impl ChatDriver {
    /// `conversation` usually comes from `SessionLedger::load_conversation`.
    pub fn new(
        dispatcher: ChatDispatcher,
        extractor: DocumentExtractor,
        ledger: SessionLedger,
        conversation: Conversation,
    ) -> Self {
        tracing::debug!(
            messages = conversation.messages().len(),
            session = ?conversation.session_id(),
            "Conversation restored"
        );
        Self {
            dispatcher,
            extractor,
            ledger,
            conversation,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Build the stored user message: the typed text, augmented with the
    /// extracted attachment content when a file is attached.
    pub async fn prepare_user_message(
        &self,
        text: &str,
        attachment: Option<&Attachment>,
        created_at: i64,
    ) -> Message {
        let Some(attachment) = attachment else {
            return Message::user(text, created_at);
        };

        let meta = attachment.meta();
        let result = self.extractor.extract(attachment).await;
        let content = match result.kind {
            DocumentKind::Other => format_other_attachment(text, &meta),
            _ => format_attachment_message(text, &meta, &result),
        };
        Message::user(&content, created_at).with_attachment(meta)
    }

    pub async fn send(&mut self, text: &str, attachment: Option<Attachment>) -> ExchangeOutcome {
        self.send_observed(text, attachment, |_| {}).await
    }

    /// Run one exchange, calling `on_update` with the agent message after
    /// every applied event.
    pub async fn send_observed<F>(
        &mut self,
        text: &str,
        attachment: Option<Attachment>,
        mut on_update: F,
    ) -> ExchangeOutcome
    where
        F: FnMut(&Message),
    {
        let now = chrono::Utc::now().timestamp();
        let user_message = self.prepare_user_message(text, attachment.as_ref(), now).await;
        let user_content = user_message.content.clone();

        let rolled_back = self.conversation.begin_exchange(user_message);
        let history_len = self.conversation.messages().len().saturating_sub(2);
        let request = ChatRequest {
            history: self.conversation.messages()[..history_len].to_vec(),
            user_content,
            session_id: self.conversation.session_id().map(str::to_string),
            attachment,
        };

        let title_source = match (&request.attachment, text.trim().is_empty()) {
            (Some(a), true) => a.name.clone(),
            _ => text.to_string(),
        };
        let mut reconciler = Reconciler::new(&title_source, now);

        let deadline = self.dispatcher.config().max_exchange_duration;
        let streamed = tokio::time::timeout(
            deadline,
            stream_exchange(
                &self.dispatcher,
                &mut self.conversation,
                &request,
                &mut reconciler,
                &mut on_update,
            ),
        )
        .await;

        if streamed.is_err() {
            tracing::warn!(deadline_secs = deadline.as_secs(), "Exchange exceeded its deadline");
            reconciler.fail(
                &mut self.conversation,
                &format!(
                    "No complete response within {} seconds. Please try again.",
                    deadline.as_secs()
                ),
            );
        }

        self.ledger.save_conversation(&self.conversation);
        self.outcome(reconciler.state(), rolled_back)
    }

    fn outcome(&self, state: ExchangeState, rolled_back: bool) -> ExchangeOutcome {
        let reply = self
            .conversation
            .messages()
            .last()
            .filter(|m| m.role == MessageRole::Agent)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        ExchangeOutcome {
            state,
            reply,
            error: self.conversation.error().map(str::to_string),
            session_id: self.conversation.session_id().map(str::to_string),
            rolled_back,
        }
    }
}

/// Dispatch and apply events until the exchange finishes or the stream ends.
async fn stream_exchange<F>(
    dispatcher: &ChatDispatcher,
    conversation: &mut Conversation,
    request: &ChatRequest,
    reconciler: &mut Reconciler,
    on_update: &mut F,
) where
    F: FnMut(&Message),
{
    let mut rx = match dispatcher.dispatch(request).await {
        Ok(rx) => rx,
        Err(e) => {
            reconciler.fail(conversation, &e.to_string());
            return;
        }
    };

    while let Some(event) = rx.recv().await {
        reconciler.apply(conversation, event);
        if let Some(agent) = conversation.messages().last() {
            on_update(agent);
        }
        if reconciler.is_finished() {
            return;
        }
    }

    reconciler.fail(conversation, STREAM_ENDED_MESSAGE);
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::body::Body;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::Router;

    use super::*;
    use crate::config::{ChatEndpointConfig, ExtractionConfig};
    use crate::pipeline::extraction::ocr::MockOcrEngine;
    use crate::pipeline::extraction::pdf::MockPdfTextLayer;

    const AGENT_STREAM: &str = concat!(
        "data: {\"event\":\"RunStarted\",\"session_id\":\"srv-1\"}\n\n",
        "data: {\"event\":\"RunResponse\",\"content\":\"Hel\"}\n\n",
        "data: {\"event\":\"RunResponse\",\"content\":\"Hello\"}\n\n",
        "data: {\"event\":\"RunCompleted\",\"content\":\"Hello there\"}\n\n",
    );

    const DELTA_STREAM: &str = concat!(
        "data: {\"id\":\"chatcmpl-7\",\"choices\":[{\"delta\":{\"content\":\"Total \"}}]}\n\n",
        "data: {\"id\":\"chatcmpl-7\",\"choices\":[{\"delta\":{\"content\":\"is $5\"}}]}\n\n",
        "data: [DONE]\n\n",
    );

    #[derive(Default)]
    struct Server {
        calls: AtomicUsize,
        fail_first: bool,
        bodies: Mutex<Vec<Vec<u8>>>,
    }

    type Shared = Arc<Server>;

    async fn agent_handler(State(server): State<Shared>, body: axum::body::Bytes) -> Response {
        server.bodies.lock().unwrap().push(body.to_vec());
        let call = server.calls.fetch_add(1, Ordering::SeqCst);
        if server.fail_first && call == 0 {
            return (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response();
        }
        AGENT_STREAM.into_response()
    }

    async fn delta_handler() -> &'static str {
        DELTA_STREAM
    }

    async fn error_handler() -> &'static str {
        concat!(
            "data: {\"event\":\"RunStarted\",\"session_id\":\"srv-err\"}\n\n",
            "data: {\"event\":\"RunResponse\",\"content\":\"Work\"}\n\n",
            "data: {\"event\":\"RunError\",\"content\":\"model crashed\"}\n\n",
        )
    }

    async fn hanging_handler() -> Response {
        let first = futures_util::stream::iter([Ok::<_, Infallible>(
            "data: {\"event\":\"RunStarted\",\"session_id\":\"srv-slow\"}\n\n",
        )]);
        let stalled = futures_util::stream::pending::<Result<&'static str, Infallible>>();
        let body = futures_util::StreamExt::chain(first, stalled);
        Body::from_stream(body).into_response()
    }

    async fn spawn_server(fail_first: bool) -> (String, Shared) {
        let server: Shared = Arc::new(Server {
            fail_first,
            ..Default::default()
        });
        let app = Router::new()
            .route("/agent", post(agent_handler))
            .route("/delta", post(delta_handler))
            .route("/error", post(error_handler))
            .route("/hang", post(hanging_handler))
            .with_state(server.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), server)
    }

    fn test_extractor() -> DocumentExtractor {
        DocumentExtractor::new(
            Arc::new(MockPdfTextLayer::uniform(1, "Invoice Number 42 Total Due 100.00")),
            Arc::new(MockOcrEngine::new("ocr text", 0.9)),
            ExtractionConfig::default(),
        )
    }

    fn driver(url: &str, dir: &tempfile::TempDir) -> ChatDriver {
        driver_with(ChatEndpointConfig::new(url), dir)
    }

    fn driver_with(config: ChatEndpointConfig, dir: &tempfile::TempDir) -> ChatDriver {
        let ledger = SessionLedger::open(dir.path()).unwrap();
        let conversation = ledger.load_conversation(None);
        ChatDriver::new(
            ChatDispatcher::new(config).unwrap(),
            test_extractor(),
            ledger,
            conversation,
        )
    }

    #[tokio::test]
    async fn completed_exchange_is_persisted() {
        let (base, _) = spawn_server(false).await;
        let dir = tempfile::tempdir().unwrap();
        let mut chat = driver(&format!("{base}/agent"), &dir);

        let mut updates = Vec::new();
        let outcome = chat
            .send_observed("What is due?", None, |m| updates.push(m.content.clone()))
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.reply, "Hello there");
        assert_eq!(outcome.session_id.as_deref(), Some("srv-1"));
        assert_eq!(updates, vec!["", "Hel", "Hello", "Hello there"]);

        let ledger = SessionLedger::open(dir.path()).unwrap();
        let stored = ledger.load_messages(Some("srv-1"));
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "Hello there");
        let sessions = ledger.load_sessions();
        assert_eq!(sessions[0].session_id, "srv-1");
        assert_eq!(sessions[0].title, "What is due?");
        assert_eq!(ledger.load_active_session().as_deref(), Some("srv-1"));
    }

    #[tokio::test]
    async fn delta_stream_accumulates_reply() {
        let (base, _) = spawn_server(false).await;
        let dir = tempfile::tempdir().unwrap();
        let mut chat = driver(&format!("{base}/delta"), &dir);

        let outcome = chat.send("total?", None).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.reply, "Total is $5");
        assert_eq!(outcome.session_id.as_deref(), Some("chatcmpl-7"));
    }

    #[tokio::test]
    async fn run_error_fills_error_slot_and_evicts_session() {
        let (base, _) = spawn_server(false).await;
        let dir = tempfile::tempdir().unwrap();
        let mut chat = driver(&format!("{base}/error"), &dir);

        let outcome = chat.send("hi", None).await;
        assert_eq!(outcome.state, ExchangeState::Errored);
        assert_eq!(outcome.error.as_deref(), Some("model crashed"));
        assert_eq!(outcome.reply, "Work");
        assert!(chat.conversation().messages()[1].streaming_error);
        assert!(chat.conversation().sessions().is_empty());
        assert_eq!(outcome.session_id, None);

        let ledger = SessionLedger::open(dir.path()).unwrap();
        assert!(ledger.load_sessions().is_empty());
    }

    #[tokio::test]
    async fn http_failure_then_retry_rolls_back_failed_pair() {
        let (base, server) = spawn_server(true).await;
        let dir = tempfile::tempdir().unwrap();
        let mut chat = driver(&format!("{base}/agent"), &dir);

        let failed = chat.send("first try", None).await;
        assert_eq!(failed.state, ExchangeState::Errored);
        assert!(failed.error.unwrap().contains("503"));
        assert_eq!(chat.conversation().messages().len(), 2);

        let retried = chat.send("second try", None).await;
        assert!(retried.succeeded());
        assert!(retried.rolled_back);
        let contents: Vec<_> = chat
            .conversation()
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["second try", "Hello there"]);

        let bodies = server.bodies.lock().unwrap();
        let second: serde_json::Value = serde_json::from_slice(&bodies[1]).unwrap();
        let messages = second["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["content"], "second try");
    }

    #[tokio::test]
    async fn history_is_sent_on_next_exchange() {
        let (base, server) = spawn_server(false).await;
        let dir = tempfile::tempdir().unwrap();
        let mut chat = driver(&format!("{base}/agent"), &dir);

        chat.send("one", None).await;
        chat.send("two", None).await;

        let bodies = server.bodies.lock().unwrap();
        let second: serde_json::Value = serde_json::from_slice(&bodies[1]).unwrap();
        assert_eq!(second["session_id"], "srv-1");
        let roles: Vec<_> = second["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    }

    #[tokio::test]
    async fn new_driver_resumes_persisted_conversation() {
        let (base, server) = spawn_server(false).await;
        let dir = tempfile::tempdir().unwrap();
        driver(&format!("{base}/agent"), &dir).send("one", None).await;

        let mut resumed = driver(&format!("{base}/agent"), &dir);
        assert_eq!(resumed.conversation().messages().len(), 2);
        resumed.send("two", None).await;

        let bodies = server.bodies.lock().unwrap();
        let second: serde_json::Value = serde_json::from_slice(&bodies[1]).unwrap();
        assert_eq!(second["session_id"], "srv-1");
        assert_eq!(second["messages"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut chat = driver("http://127.0.0.1:9/run", &dir);

        let outcome = chat.send("hello", None).await;
        assert_eq!(outcome.state, ExchangeState::Errored);
        assert!(outcome.error.is_some());
        assert!(chat.conversation().messages()[1].streaming_error);
    }

    #[tokio::test]
    async fn stalled_stream_hits_deadline() {
        let (base, _) = spawn_server(false).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = ChatEndpointConfig::new(&format!("{base}/hang"));
        config.max_exchange_duration = Duration::from_millis(300);
        let mut chat = driver_with(config, &dir);

        let outcome = chat.send("slow please", None).await;
        assert_eq!(outcome.state, ExchangeState::Errored);
        assert!(outcome.error.unwrap().contains("No complete response"));
        assert!(chat.conversation().sessions().is_empty());
    }

    #[tokio::test]
    async fn attachment_is_extracted_into_user_message() {
        let (base, _) = spawn_server(false).await;
        let dir = tempfile::tempdir().unwrap();
        let mut chat = driver(&format!("{base}/agent"), &dir);

        let file = Attachment::new(
            "invoice.txt",
            "text/plain",
            b"Invoice Number: INV-7\nBill To: ACME\nTotal Due: $120.00".to_vec(),
        );
        let outcome = chat.send("", Some(file)).await;
        assert!(outcome.succeeded());

        let user = &chat.conversation().messages()[0];
        assert_eq!(user.attachments[0].name, "invoice.txt");
        assert!(user.content.contains("--- EXTRACTED CONTENT ---"));
        assert!(user.content.contains("INV-7"));
        assert_eq!(chat.conversation().sessions()[0].title, "invoice.txt");
    }

    #[tokio::test]
    async fn other_attachment_is_described_not_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let chat = driver("http://127.0.0.1:9/run", &dir);
        let file = Attachment::new("archive.zip", "application/zip", vec![1, 2, 3]);

        let message = chat.prepare_user_message("look", Some(&file), 5).await;
        assert!(message.content.starts_with("look"));
        assert!(message.content.contains("archive.zip"));
        assert!(!message.content.contains("EXTRACTED CONTENT"));
        assert_eq!(message.created_at, 5);
    }
}
