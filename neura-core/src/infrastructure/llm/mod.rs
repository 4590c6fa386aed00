// neura-core/src/infrastructure/llm/mod.rs

pub mod openai;

pub use openai::OpenAiChatModel;

use crate::error::NeuraError;
use crate::infrastructure::error::InfrastructureError;
use crate::ports::llm::{ChatModel, ChatRequest};
use async_trait::async_trait;

/// Stand-in for deployments without an OPENAI_API_KEY. Report runs work;
/// any pipeline stage that needs the LLM fails with a clear message.
pub struct DisabledChatModel;

#[async_trait]
impl ChatModel for DisabledChatModel {
    async fn complete(&self, request: &ChatRequest) -> Result<String, NeuraError> {
        Err(NeuraError::Infrastructure(InfrastructureError::LlmProvider(format!(
            "OPENAI_API_KEY is not set; cannot run '{}'",
            request.description
        ))))
    }

    fn model_name(&self) -> &str {
        "disabled"
    }
}
