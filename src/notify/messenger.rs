use async_trait::async_trait;
use std::io::Write;
use thiserror::Error;

use crate::subscriber::ChatId;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Failed to write message: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound message channel (chat platform, mail, terminal...).
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<(), DeliveryError>;
}

/// Writes every message to standard output, one block per message.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutMessenger;

#[async_trait]
impl Messenger for StdoutMessenger {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<(), DeliveryError> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "--- chat {chat_id} ---")?;
        writeln!(out, "{text}")?;
        out.flush()?;
        Ok(())
    }
}
