//! LLM provider client
//!
//! `LlmProvider` is the seam the execution dispatcher calls through. The one
//! real implementation speaks the OpenAI-compatible chat completions API; its
//! base URL, model and sampling parameters come from the project config on
//! every call, so one client serves all projects.
//!
//! Calls are never retried here. A failed call is reported once and the
//! caller decides what to do.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ProjectConfig;
use crate::template::{RenderedConversation, RenderedMessage};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(e)
        }
    }
}

/// Per-call parameters taken from a project snapshot.
#[derive(Clone)]
pub struct ProviderParams {
    pub base_url: String,
    pub token: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    /// Zero means unset.
    pub max_tokens: i32,
}

impl std::fmt::Debug for ProviderParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderParams")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl From<&ProjectConfig> for ProviderParams {
    fn from(p: &ProjectConfig) -> Self {
        Self {
            base_url: p.openai_base_url.clone(),
            token: p.openai_token.clone(),
            model: p.openai_model.clone(),
            temperature: p.openai_temperature,
            top_p: p.openai_top_p,
            max_tokens: p.openai_max_tokens,
        }
    }
}

/// What the provider produced for one call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    pub message: String,
    pub model: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        conversation: &RenderedConversation,
        params: &ProviderParams,
    ) -> Result<Completion, ProviderError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [RenderedMessage],
    temperature: f64,
    top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i32,
    #[serde(default)]
    completion_tokens: i32,
    #[serde(default)]
    total_tokens: i32,
}

/// Client for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
}

impl OpenAiClient {
    /// `timeout` is a transport-level backstop; the dispatcher enforces its
    /// own deadline around the whole call.
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProviderError::Http)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    async fn complete(
        &self,
        conversation: &RenderedConversation,
        params: &ProviderParams,
    ) -> Result<Completion, ProviderError> {
        let url = format!("{}/chat/completions", params.base_url.trim_end_matches('/'));

        let request = ChatRequest {
            model: &params.model,
            messages: &conversation.messages,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: (params.max_tokens > 0).then_some(params.max_tokens),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&params.token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), model = %params.model, "provider returned an error");
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let message = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("response has no choices".to_string()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            message,
            model: parsed.model.unwrap_or_else(|| params.model.clone()),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params(base_url: String) -> ProviderParams {
        ProviderParams {
            base_url,
            token: "sk-test".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.5,
            top_p: 1.0,
            max_tokens: 0,
        }
    }

    fn conversation() -> RenderedConversation {
        RenderedConversation {
            messages: vec![RenderedMessage {
                role: "user".to_string(),
                content: "Hello, Ada!".to_string(),
            }],
        }
    }

    fn completion_body() -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "Hi there" } }],
            "usage": { "prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12 }
        })
    }

    #[tokio::test]
    async fn test_complete_posts_chat_request_and_reads_usage() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "messages": [{ "role": "user", "content": "Hello, Ada!" }],
                "temperature": 0.5,
                "top_p": 1.0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = OpenAiClient::new(Duration::from_secs(5)).unwrap();
        let out = client
            .complete(&conversation(), &params(mock_server.uri()))
            .await
            .unwrap();

        assert_eq!(out.message, "Hi there");
        assert_eq!(out.model, "gpt-4o-mini-2024-07-18");
        assert_eq!((out.prompt_tokens, out.completion_tokens, out.total_tokens), (9, 3, 12));
    }

    #[tokio::test]
    async fn test_max_tokens_sent_only_when_positive() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "messages": [{ "role": "user", "content": "Hello, Ada!" }],
                "temperature": 0.5,
                "top_p": 1.0,
                "max_tokens": 64
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut p = params(format!("{}/", mock_server.uri()));
        p.max_tokens = 64;
        let client = OpenAiClient::new(Duration::from_secs(5)).unwrap();
        assert!(client.complete(&conversation(), &p).await.is_ok());
    }

    #[tokio::test]
    async fn test_error_status_is_reported_once_without_retry() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = OpenAiClient::new(Duration::from_secs(5)).unwrap();
        let err = client
            .complete(&conversation(), &params(mock_server.uri()))
            .await
            .unwrap_err();

        match err {
            ProviderError::Status { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "rate limited");
            }
            other => panic!("Expected Status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_choices_is_invalid_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })))
            .mount(&mock_server)
            .await;

        let client = OpenAiClient::new(Duration::from_secs(5)).unwrap();
        let err = client
            .complete(&conversation(), &params(mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_slow_provider_hits_transport_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body())
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&mock_server)
            .await;

        let client = OpenAiClient::new(Duration::from_millis(50)).unwrap();
        let err = client
            .complete(&conversation(), &params(mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
    }

    #[test]
    fn test_params_debug_hides_token() {
        let rendered = format!("{:?}", params("http://x".to_string()));
        assert!(!rendered.contains("sk-test"));
    }
}
