// neura-core/src/ports/llm.rs

// What the pipeline needs from an LLM provider, without knowing which one.
// One chat-completion call: system + user parts (text and images), a single
// string back. JSON mode and low temperature are hints the adapter may honor.

use crate::error::NeuraError;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub enum UserPart {
    Text(String),
    /// data: URI (PNG) attached to the user message.
    ImageDataUri(String),
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub parts: Vec<UserPart>,
    /// Ask the provider for a strict JSON object response.
    pub json_mode: bool,
    /// Stage label used for prompt/response logging.
    pub description: String,
}

impl ChatRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into(), ..Default::default() }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(UserPart::Text(text.into()));
        self
    }

    pub fn with_image(mut self, data_uri: impl Into<String>) -> Self {
        self.parts.push(UserPart::ImageDataUri(data_uri.into()));
        self
    }

    pub fn json_object(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, NeuraError>;

    fn model_name(&self) -> &str;
}
