//! Terminal front-end.
//!
//! `ask` runs one exchange against the configured chat endpoint, streaming
//! the reply to stdout. `extract` shows what an attachment turns into.
//! `history` prints the persisted conversation and session list.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::chat::ChatDriver;
use crate::config::{self, ChatEndpointConfig, ExtractionConfig};
use crate::models::{Message, MessageRole};
use crate::pipeline::extraction::{Attachment, DocumentExtractor, ExtractionError};
use crate::pipeline::stream::{ChatDispatcher, StreamError};
use crate::session_ledger::{LedgerError, SessionLedger};

/// PaperChat: attach an invoice, PDF, image or text file and ask about it.
#[derive(Parser, Debug)]
#[command(name = "paperchat", version, about)]
pub struct CliArgs {
    /// Data directory (defaults to ~/PaperChat or $PAPERCHAT_DATA_DIR).
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a message, optionally with an attached file.
    Ask {
        /// Message text. May be empty when a file is attached.
        #[arg(default_value = "")]
        message: String,

        /// File to attach.
        #[arg(short = 'a', long = "attach")]
        attach: Option<PathBuf>,

        /// Continue (or start) a specific session.
        #[arg(short = 's', long = "session")]
        session: Option<String>,

        /// Start a new conversation instead of continuing the last one.
        #[arg(long = "new", conflicts_with = "session")]
        new: bool,
    },

    /// Print the text extracted from a file.
    Extract {
        file: PathBuf,

        /// Override the MIME type guessed from the extension.
        #[arg(long = "mime")]
        mime: Option<String>,
    },

    /// Show known sessions and the history of one of them.
    History {
        /// Session to show (defaults to the last active one).
        #[arg(short = 's', long = "session")]
        session: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Cannot read attachment: {0}")]
    Attachment(#[from] ExtractionError),

    #[error("{0}")]
    Exchange(String),
}

impl CliArgs {
    /// Store directory: `--data-dir` > `PAPERCHAT_DATA_DIR` > `~/PaperChat`.
    pub fn resolve_store_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.join("store"),
            None => config::store_dir(),
        }
    }
}

pub async fn execute(args: CliArgs) -> Result<(), CliError> {
    let store_dir = args.resolve_store_dir();
    match args.command {
        Command::Ask {
            message,
            attach,
            session,
            new,
        } => ask(store_dir, &message, attach, session, new).await,
        Command::Extract { file, mime } => extract(file, mime).await,
        Command::History { session } => history(store_dir, session),
    }
}

async fn ask(
    store_dir: PathBuf,
    message: &str,
    attach: Option<PathBuf>,
    session: Option<String>,
    new: bool,
) -> Result<(), CliError> {
    if message.trim().is_empty() && attach.is_none() {
        return Err(CliError::Exchange("Nothing to send: give a message or --attach a file".into()));
    }

    let endpoint = ChatEndpointConfig::from_env().ok_or_else(|| {
        StreamError::NotConfigured("set AZURE_OPENAI_ENDPOINT (and AZURE_OPENAI_API_KEY)".into())
    })?;
    let attachment = attach.as_deref().map(Attachment::from_path).transpose()?;

    let ledger = SessionLedger::open(&store_dir)?;
    let conversation = if new {
        ledger.fresh_conversation()
    } else {
        ledger.load_conversation(session.as_deref())
    };
    let mut driver = ChatDriver::new(
        ChatDispatcher::new(endpoint)?,
        DocumentExtractor::native(ExtractionConfig::default()),
        ledger,
        conversation,
    );

    let mut printed = String::new();
    let outcome = driver
        .send_observed(message, attachment, |agent| {
            if let Some(rest) = agent.content.strip_prefix(printed.as_str()) {
                print!("{rest}");
                let _ = std::io::stdout().flush();
                printed = agent.content.clone();
            }
        })
        .await;

    if outcome.reply != printed {
        println!("\n\n{}", outcome.reply);
    } else {
        println!();
    }

    if let Some(session_id) = &outcome.session_id {
        tracing::info!(session = %session_id, "Exchange finished");
    }
    match outcome.error {
        Some(error) => Err(CliError::Exchange(error)),
        None => Ok(()),
    }
}

async fn extract(file: PathBuf, mime: Option<String>) -> Result<(), CliError> {
    let mut attachment = Attachment::from_path(&file)?;
    if let Some(mime) = mime {
        attachment.mime_type = mime;
    }
    let extractor = DocumentExtractor::native(ExtractionConfig::default());
    let result = extractor.extract(&attachment).await;

    println!("{}", result.text);
    tracing::info!(
        pages = result.pages_processed,
        pages_total = result.pages_total,
        truncated = result.truncated,
        used_ocr = result.used_ocr,
        invoice = result.classified_as_invoice,
        "Extraction summary"
    );
    Ok(())
}

fn history(store_dir: PathBuf, session: Option<String>) -> Result<(), CliError> {
    let ledger = SessionLedger::open(&store_dir)?;
    let conversation = ledger.load_conversation(session.as_deref());

    println!("Sessions:");
    if conversation.sessions().is_empty() {
        println!("  (none)");
    }
    for entry in conversation.sessions() {
        let marker = if conversation.session_id() == Some(entry.session_id.as_str()) {
            '*'
        } else {
            ' '
        };
        println!(
            "{marker} {}  {}  {}",
            format_timestamp(entry.created_at),
            entry.session_id,
            entry.title
        );
    }

    println!();
    for message in conversation.messages() {
        println!("{}", render_message(message));
    }
    Ok(())
}

fn format_timestamp(unix_secs: i64) -> String {
    chrono::DateTime::from_timestamp(unix_secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| unix_secs.to_string())
}

fn render_message(message: &Message) -> String {
    let label = match message.role {
        MessageRole::User => "you",
        MessageRole::Agent => "assistant",
        MessageRole::System => "system",
    };
    let mut out = format!("[{}] {label}:", format_timestamp(message.created_at));
    for attachment in &message.attachments {
        out.push_str(&format!(" <{}>", attachment.name));
    }
    if message.streaming_error {
        out.push_str(" (failed)");
    }
    out.push('\n');
    out.push_str(&message.content);
    out.push('\n');
    out
}
