//! Text generation collaborator.
//!
//! The pipeline only sees the [`Generator`] trait. [`OpenRouterGenerator`]
//! talks to any OpenAI-compatible `chat/completions` endpoint.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use celia_shared::{AppConfig, CeliaError, GenerationConfig, Result, validate_api_key};

/// User-Agent string for generation requests.
const USER_AGENT: &str = concat!("CELIA/", env!("CARGO_PKG_VERSION"));

/// Longest error body echoed back in a `Generation` error.
const MAX_ERROR_BODY: usize = 300;

/// One completion request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            temperature,
            max_tokens,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Produces text for a prompt. Errors are collaborator faults.
pub trait Generator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> impl Future<Output = Result<String>> + Send;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Client for OpenRouter or any other OpenAI-compatible API.
pub struct OpenRouterGenerator {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenRouterGenerator {
    pub fn new(config: &GenerationConfig, api_key: impl Into<String>) -> Result<Self> {
        let endpoint = completions_url(&config.endpoint()?);
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CeliaError::Generation(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            model: config.model.clone(),
        })
    }

    /// Build from app config, reading the API key from the configured env var.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = validate_api_key(config)?;
        Self::new(&config.generation, api_key)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn completions_url(base: &Url) -> String {
    format!("{}/chat/completions", base.as_str().trim_end_matches('/'))
}

impl Generator for OpenRouterGenerator {
    #[instrument(skip_all, fields(model = %self.model, temperature = request.temperature))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "CELIA")
            .json(&body)
            .send()
            .await
            .map_err(|e| CeliaError::Generation(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let excerpt: String = text.chars().take(MAX_ERROR_BODY).collect();
            return Err(CeliaError::Generation(format!("HTTP {status}: {excerpt}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CeliaError::Generation(format!("malformed response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CeliaError::Generation("response contained no message content".into()))?;

        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn generator_for(server: &MockServer) -> OpenRouterGenerator {
        let config = GenerationConfig {
            base_url: format!("{}/api/v1/", server.uri()),
            model: "test/model".into(),
            ..GenerationConfig::default()
        };
        OpenRouterGenerator::new(&config, "sk-test").expect("build generator")
    }

    #[test]
    fn completions_url_joins_cleanly() {
        let base = Url::parse("https://openrouter.ai/api/v1/").unwrap();
        assert_eq!(
            completions_url(&base),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn sends_chat_request_and_reads_content() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "test/model",
                "max_tokens": 200,
                "messages": [
                    {"role": "system", "content": "Eres un redactor."},
                    {"role": "user", "content": "Hola"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"ok\": true}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let generator = generator_for(&server);
        let request = GenerationRequest::new("Hola", 0.2, 200).with_system("Eres un redactor.");
        let content = generator.generate(&request).await.unwrap();
        assert_eq!(content, "{\"ok\": true}");
    }

    #[tokio::test]
    async fn non_success_status_is_generation_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = generator_for(&server)
            .generate(&GenerationRequest::new("x", 0.2, 10))
            .await
            .unwrap_err();
        assert!(err.is_collaborator());
        let msg = err.to_string();
        assert!(msg.contains("429"));
        assert!(msg.contains("rate limited"));
    }

    #[tokio::test]
    async fn empty_choices_is_generation_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let err = generator_for(&server)
            .generate(&GenerationRequest::new("x", 0.2, 10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no message content"));
    }

    #[tokio::test]
    async fn malformed_body_is_generation_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = generator_for(&server)
            .generate(&GenerationRequest::new("x", 0.2, 10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("malformed response"));
    }

    #[test]
    fn rejects_non_http_base_url() {
        let config = GenerationConfig {
            base_url: "file:///tmp".into(),
            ..GenerationConfig::default()
        };
        assert!(OpenRouterGenerator::new(&config, "k").is_err());
    }
}
