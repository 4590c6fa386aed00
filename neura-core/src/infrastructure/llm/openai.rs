// neura-core/src/infrastructure/llm/openai.rs

// Chat-completion adapter over the OpenAI HTTP API. Transport failures and
// 5xx responses are retried with backoff; content-level validation failures
// are the pipeline's business and handled by its validator-feedback loop.

use crate::error::NeuraError;
use crate::infrastructure::error::InfrastructureError;
use crate::ports::llm::{ChatModel, ChatRequest, UserPart};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const TRANSPORT_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 500;

pub struct OpenAiChatModel {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Point the adapter at a different endpoint (proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({
                "role": "system",
                "content": [{"type": "text", "text": system}],
            }));
        }
        let content: Vec<Value> = request
            .parts
            .iter()
            .map(|part| match part {
                UserPart::Text(text) => json!({"type": "text", "text": text}),
                UserPart::ImageDataUri(uri) => {
                    json!({"type": "image_url", "image_url": {"url": uri}})
                }
            })
            .collect();
        messages.push(json!({"role": "user", "content": content}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.1,
        });
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, request: &ChatRequest) -> Result<String, NeuraError> {
        let body = self.build_body(request);
        let mut last_error: Option<String> = None;

        for attempt in 1..=TRANSPORT_RETRIES {
            debug!(
                description = %request.description,
                model = %self.model,
                attempt,
                "llm call start"
            );
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let payload: Value = resp
                        .json()
                        .await
                        .map_err(|e| NeuraError::Infrastructure(InfrastructureError::Http(e)))?;
                    let text = payload["choices"][0]["message"]["content"]
                        .as_str()
                        .map(str::trim)
                        .unwrap_or_default()
                        .to_string();
                    if text.is_empty() {
                        return Err(NeuraError::Infrastructure(
                            InfrastructureError::LlmProvider(
                                "provider returned an empty completion".to_string(),
                            ),
                        ));
                    }
                    info!(
                        description = %request.description,
                        attempt,
                        chars = text.len(),
                        "llm call complete"
                    );
                    return Ok(text);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let detail = resp.text().await.unwrap_or_default();
                    if status.is_server_error() && attempt < TRANSPORT_RETRIES {
                        warn!(%status, attempt, description = %request.description, "llm provider 5xx, retrying");
                        last_error = Some(format!("{status}: {detail}"));
                        tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64))
                            .await;
                        continue;
                    }
                    return Err(NeuraError::Infrastructure(InfrastructureError::LlmProvider(
                        format!("{status}: {detail}"),
                    )));
                }
                Err(err) if attempt < TRANSPORT_RETRIES => {
                    warn!(error = %err, attempt, description = %request.description, "llm transport error, retrying");
                    last_error = Some(err.to_string());
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64))
                        .await;
                }
                Err(err) => {
                    return Err(NeuraError::Infrastructure(InfrastructureError::Http(err)));
                }
            }
        }

        Err(NeuraError::Infrastructure(InfrastructureError::LlmProvider(
            last_error.unwrap_or_else(|| "llm call exhausted retries".to_string()),
        )))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Strip markdown code fences from a completion body.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    #[allow(clippy::expect_used)]
    let re = regex::Regex::new(r"```(?:json|html|JSON|HTML|sql|SQL)?\s*([\s\S]*?)```")
        .expect("code fence regex");
    match re.captures(trimmed) {
        Some(caps) => caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use httptest::{Expectation, Server, matchers::*, responders::*};

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```HTML\n<p></p>\n```"), "<p></p>");
        assert_eq!(strip_code_fences("plain text"), "plain text");
    }

    #[tokio::test]
    async fn test_complete_parses_choice_content() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/chat/completions"),
                request::body(matches("\"response_format\"")),
                request::body(matches("gpt-test")),
            ])
            .respond_with(json_encoded(serde_json::json!({
                "choices": [{"message": {"content": "{\"mapping\": {}}"}}]
            }))),
        );

        let model = OpenAiChatModel::new("sk-test", "gpt-test")
            .with_endpoint(server.url("/v1/chat/completions").to_string());
        let request = ChatRequest::new("automap")
            .with_system("You are a mapper.")
            .with_text("Map the tokens.")
            .json_object();
        let out = model.complete(&request).await.unwrap();
        assert_eq!(out, "{\"mapping\": {}}");
    }

    #[tokio::test]
    async fn test_complete_retries_until_budget_exhausted() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .times(TRANSPORT_RETRIES as usize)
                .respond_with(status_code(503)),
        );

        let model = OpenAiChatModel::new("sk-test", "gpt-test")
            .with_endpoint(server.url("/v1/chat/completions").to_string());
        let err = model.complete(&ChatRequest::new("verify").with_text("hi")).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_complete_surfaces_client_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .respond_with(status_code(401)),
        );

        let model = OpenAiChatModel::new("bad-key", "gpt-test")
            .with_endpoint(server.url("/v1/chat/completions").to_string());
        let err = model.complete(&ChatRequest::new("verify").with_text("hi")).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
