//! Chat dispatch and streamed-response reconciliation.
//!
//! `dispatch` sends the conversation to the chat endpoint and decodes the
//! response body (`sse`) into `StreamEvent`s on a bounded channel.
//! `reconcile` folds those events into the trailing agent message.

pub mod types;
pub mod sse;
pub mod dispatch;
pub mod reconcile;

pub use types::*;
pub use dispatch::*;
pub use reconcile::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Chat endpoint not reachable at {0}")]
    Connection(String),

    #[error("Chat endpoint returned error (status {status}): {body}")]
    Http { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Request encoding error: {0}")]
    Encoding(String),

    #[error("Chat endpoint not configured: {0}")]
    NotConfigured(String),
}
