// neura-core/src/ports/mailer.rs

use crate::error::NeuraError;
use async_trait::async_trait;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns true when the message was handed to the transport.
    async fn send(&self, email: &OutboundEmail) -> Result<bool, NeuraError>;
}
