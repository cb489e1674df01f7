//! Chat stream decoding.
//!
//! The response body is a sequence of `data:` lines. Two frame shapes are
//! understood:
//! - agent run frames carrying an `event` field
//! - chat-completion deltas (`choices[0].delta.content`), folded into
//!   accumulated `RunResponse` events
//!
//! `data: [DONE]` or the end of the body closes the stream with a
//! `RunCompleted` if none was seen.

use std::sync::LazyLock;

use bytes::BytesMut;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::types::{RunEventKind, RunFrame, StreamEvent};

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

static BARE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap());

#[derive(Debug, PartialEq)]
enum SseLine {
    Data(String),
    Done,
    Skip,
}

/// Classify one SSE line. Comments, blank lines, non-data fields and empty
/// data are skipped.
fn classify_line(line: &str) -> SseLine {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(data) = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))
    else {
        return SseLine::Skip;
    };
    match data.trim() {
        "" => SseLine::Skip,
        "[DONE]" => SseLine::Done,
        data => SseLine::Data(data.to_string()),
    }
}

/// Best-effort repair of a malformed frame: drops trailing commas and
/// quotes bare object keys.
pub fn sanitize_frame(data: &str) -> String {
    let without_commas = TRAILING_COMMA.replace_all(data, "$1");
    BARE_KEY.replace_all(&without_commas, r#"$1"$2":"#).into_owned()
}

/// Parse a frame, retrying once after sanitisation.
pub fn parse_frame(data: &str) -> Option<Value> {
    match serde_json::from_str(data) {
        Ok(v) => Some(v),
        Err(first) => match serde_json::from_str(&sanitize_frame(data)) {
            Ok(v) => {
                debug!(error = %first, "Recovered malformed stream frame");
                Some(v)
            }
            Err(e) => {
                debug!(
                    error = %e,
                    preview = %data.chars().take(100).collect::<String>(),
                    "Dropping malformed stream frame"
                );
                None
            }
        },
    }
}

/// Incremental decoder from response body bytes to `StreamEvent`s.
pub struct SseDecoder {
    buffer: BytesMut,
    request_session: Option<String>,
    /// Text accumulated from chat-completion deltas.
    accumulated: String,
    delta_started: bool,
    terminal_seen: bool,
    done: bool,
}

impl SseDecoder {
    /// `request_session` is the session id sent with the request, if any.
    pub fn new(request_session: Option<String>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            request_session: request_session.filter(|s| !s.is_empty()),
            accumulated: String::new(),
            delta_started: false,
            terminal_seen: false,
            done: false,
        }
    }

    /// Whether `[DONE]` has been received. Later input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk of the body; returns the events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line_bytes = self.buffer.split_to(newline_pos + 1);
            line_bytes.truncate(line_bytes.len() - 1);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }
            let Ok(line) = std::str::from_utf8(&line_bytes) else {
                debug!("Skipping non UTF-8 stream line");
                continue;
            };
            self.handle_line(line, &mut events);
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// End of body: flush any unterminated line and close the stream.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let rest = self.buffer.split();
            if let Ok(line) = std::str::from_utf8(&rest) {
                self.handle_line(line, &mut events);
            }
        }
        if !self.done {
            self.close(&mut events);
        }
        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        match classify_line(line) {
            SseLine::Skip => {}
            SseLine::Done => self.close(events),
            SseLine::Data(data) => {
                if let Some(value) = parse_frame(&data) {
                    self.handle_frame(value, events);
                }
            }
        }
    }

    fn handle_frame(&mut self, value: Value, events: &mut Vec<StreamEvent>) {
        if value.get("event").is_some() {
            match serde_json::from_value::<RunFrame>(value) {
                Ok(frame) => {
                    let event = StreamEvent::from(frame);
                    if event.kind.is_terminal() {
                        self.terminal_seen = true;
                    }
                    events.push(event);
                }
                Err(e) => debug!(error = %e, "Dropping unrecognised run frame"),
            }
            return;
        }

        let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else {
            debug!("Dropping frame with neither event nor choices");
            return;
        };

        if !self.delta_started {
            self.delta_started = true;
            let session = self.request_session.clone().or_else(|| {
                value
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            });
            events.push(StreamEvent::started(session));
        }

        let delta = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !delta.is_empty() {
            self.accumulated.push_str(delta);
            events.push(StreamEvent::text(RunEventKind::RunResponse, &self.accumulated));
        }
    }

    fn close(&mut self, events: &mut Vec<StreamEvent>) {
        self.done = true;
        if self.terminal_seen {
            return;
        }
        self.terminal_seen = true;
        if self.delta_started {
            events.push(StreamEvent::text(RunEventKind::RunCompleted, &self.accumulated));
        } else {
            events.push(StreamEvent::new(RunEventKind::RunCompleted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stream::types::Content;
    use serde_json::json;

    fn decode_all(body: &str) -> Vec<StreamEvent> {
        let mut decoder = SseDecoder::new(None);
        let mut events = decoder.push(body.as_bytes());
        events.extend(decoder.finish());
        events
    }

    fn text_of(event: &StreamEvent) -> Option<&str> {
        match &event.content {
            Some(Content::Text(t)) => Some(t.as_str()),
            _ => None,
        }
    }

    #[test]
    fn classify_data_lines() {
        assert_eq!(classify_line("data: {\"a\":1}"), SseLine::Data("{\"a\":1}".into()));
        assert_eq!(classify_line("data:{\"a\":1}"), SseLine::Data("{\"a\":1}".into()));
        assert_eq!(classify_line("data: [DONE]"), SseLine::Done);
        assert_eq!(classify_line("data: "), SseLine::Skip);
        assert_eq!(classify_line(": keep-alive"), SseLine::Skip);
        assert_eq!(classify_line("event: message"), SseLine::Skip);
        assert_eq!(classify_line(""), SseLine::Skip);
    }

    #[test]
    fn sanitize_trailing_commas_and_bare_keys() {
        let fixed = sanitize_frame(r#"{event: "RunResponse", content: "hi",}"#);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v, json!({"event": "RunResponse", "content": "hi"}));

        let fixed = sanitize_frame(r#"{"tools": [1, 2,],}"#);
        assert_eq!(serde_json::from_str::<Value>(&fixed).unwrap(), json!({"tools": [1, 2]}));
    }

    #[test]
    fn unrecoverable_frame_is_dropped() {
        assert!(parse_frame("{not json at all").is_none());
        let events = decode_all("data: {{{\n\ndata: {\"event\":\"RunCompleted\",\"content\":\"ok\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RunEventKind::RunCompleted);
    }

    #[test]
    fn agent_run_frames_pass_through() {
        let body = concat!(
            "data: {\"event\":\"RunStarted\",\"session_id\":\"s-1\",\"created_at\":5}\n\n",
            "data: {\"event\":\"RunResponse\",\"content\":\"Hel\"}\n\n",
            "data: {\"event\":\"RunCompleted\",\"content\":\"Hello\"}\n\n",
        );
        let events = decode_all(body);
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![RunEventKind::RunStarted, RunEventKind::RunResponse, RunEventKind::RunCompleted]
        );
        assert_eq!(events[0].session_id.as_deref(), Some("s-1"));
        assert_eq!(text_of(&events[2]), Some("Hello"));
    }

    #[test]
    fn structured_content_is_resolved() {
        let events = decode_all("data: {\"event\":\"RunResponse\",\"content\":{\"total\":12.5}}\n");
        assert_eq!(events[0].content, Some(Content::Structured(json!({"total": 12.5}))));
    }

    #[test]
    fn completion_deltas_accumulate() {
        let body = concat!(
            "data: {\"id\":\"chatcmpl-9\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"id\":\"chatcmpl-9\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"id\":\"chatcmpl-9\",\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let events = decode_all(body);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].kind, RunEventKind::RunStarted);
        assert_eq!(events[0].session_id.as_deref(), Some("chatcmpl-9"));
        assert_eq!(text_of(&events[1]), Some("Hello"));
        assert_eq!(text_of(&events[2]), Some("Hello world"));
        assert_eq!(events[3].kind, RunEventKind::RunCompleted);
        assert_eq!(text_of(&events[3]), Some("Hello world"));
    }

    #[test]
    fn request_session_wins_over_frame_id() {
        let mut decoder = SseDecoder::new(Some("existing".into()));
        let events = decoder.push(b"data: {\"id\":\"x\",\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n");
        assert_eq!(events[0].session_id.as_deref(), Some("existing"));
    }

    #[test]
    fn lines_split_across_chunks() {
        let mut decoder = SseDecoder::new(None);
        assert!(decoder.push(b"data: {\"event\":\"RunRes").is_empty());
        let events = decoder.push(b"ponse\",\"content\":\"hi\"}\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(text_of(&events[0]), Some("hi"));
    }

    #[test]
    fn unterminated_last_line_is_flushed() {
        let mut decoder = SseDecoder::new(None);
        assert!(decoder.push(b"data: {\"event\":\"RunCompleted\",\"content\":\"end\"}").is_empty());
        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(text_of(&events[0]), Some("end"));
    }

    #[test]
    fn no_synthetic_completion_after_error() {
        let events = decode_all("data: {\"event\":\"RunError\",\"content\":\"boom\"}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RunEventKind::RunError);
    }

    #[test]
    fn end_of_body_without_terminal_completes() {
        let events = decode_all("data: {\"event\":\"RunResponse\",\"content\":\"partial\"}\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, RunEventKind::RunCompleted);
        assert_eq!(events[1].content, None);
    }

    #[test]
    fn input_after_done_is_ignored() {
        let mut decoder = SseDecoder::new(None);
        let events = decoder.push(b"data: [DONE]\ndata: {\"event\":\"RunResponse\",\"content\":\"late\"}\n");
        assert_eq!(events.len(), 1);
        assert!(decoder.is_done());
        assert!(decoder.push(b"data: {\"event\":\"RunError\"}\n").is_empty());
        assert!(decoder.finish().is_empty());
    }
}
