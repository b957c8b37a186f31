use std::sync::Arc;

use arc_swap::ArcSwap;
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::services::config::{AiConfig, load_ai_config};
use crate::services::prompts;
use crate::services::retry::RetryConfig;

use super::request::{build_chat_request, clean_title, parse_completion};
use super::retry_policy::{map_openai_error, should_retry_openai_error};
use super::types::{AiError, ChatMessage};

/// The model-facing half of the tree store.
///
/// Implemented by [`OpenAiCompletionClient`] for real endpoints; tests plug in
/// scripted backends.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Answer an ordered, role-tagged context with plain text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AiError>;

    /// Name a conversation from its flattened transcript.
    async fn generate_title(&self, transcript: &str) -> Result<String, AiError>;
}

/// Client for OpenAI-compatible chat-completion endpoints.
pub struct OpenAiCompletionClient {
    http_client: reqwest::Client,
    // Read on every call so key/model changes apply without rebuilding the client.
    config: ArcSwap<AiConfig>,
    retry: RetryConfig,
}

impl OpenAiCompletionClient {
    pub fn new(config: AiConfig, retry: RetryConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http_client,
            config: ArcSwap::from_pointee(config),
            retry,
        }
    }

    pub fn from_env() -> Self {
        let client = Self::new(AiConfig::default(), RetryConfig::from_env());
        client.reload_config();
        client
    }

    pub fn config(&self) -> Arc<AiConfig> {
        self.config.load_full()
    }

    pub fn set_config(&self, config: AiConfig) {
        self.config.store(Arc::new(config));
    }

    /// Re-read `.env`/environment.
    pub fn reload_config(&self) {
        let config = load_ai_config();
        log::info!(
            "AI config loaded (model={}, base_url={})",
            config.model,
            config.base_url
        );
        self.set_config(config);
    }

    async fn chat(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String, AiError> {
        let config = self.config();
        if !config.has_usable_api_key() {
            return Err(AiError::config(
                "API key is not configured. Set AI_API_KEY (or OPENAI_API_KEY) in the environment or .env",
            ));
        }

        let openai_config = OpenAIConfig::new()
            .with_api_base(config.base_url.clone())
            .with_api_key(config.api_key.clone());
        let client = Client::with_config(openai_config).with_http_client(self.http_client.clone());

        let request = build_chat_request(&config, messages, max_tokens);
        log::debug!(
            "chat completion: model={} messages={}",
            config.model,
            messages.len()
        );

        let client = &client;
        let request = &request;
        let response: JsonValue = self
            .retry
            .run(
                move || async move { client.chat().create_byot::<_, JsonValue>(request).await },
                should_retry_openai_error,
            )
            .await
            .map_err(|err| {
                let err = map_openai_error(err);
                log::error!("Error calling chat completion API: {}", err);
                err
            })?;

        parse_completion(&response)
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompletionClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AiError> {
        let max_tokens = self.config().max_tokens;
        self.chat(messages, max_tokens).await
    }

    async fn generate_title(&self, transcript: &str) -> Result<String, AiError> {
        let messages = [
            ChatMessage::system(prompts::TITLE_SYSTEM_PROMPT),
            ChatMessage::user(prompts::title_request(transcript)),
        ];
        let raw = self.chat(&messages, prompts::TITLE_MAX_TOKENS).await?;
        let title = clean_title(&raw);
        if title.is_empty() {
            return Err(AiError::empty_response("Empty title from model"));
        }
        Ok(title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer, model: &str) -> AiConfig {
        AiConfig {
            provider: crate::services::config::AiProvider::Compatible,
            base_url: server.uri(),
            api_key: "sk-test-key-123".to_string(),
            model: model.to_string(),
            ..AiConfig::default()
        }
    }

    fn completion_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }]
        })
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test-key-123"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "max_tokens": 1000,
                "messages": [{ "role": "user", "content": "hi" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Hello!")))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            OpenAiCompletionClient::new(test_config(&server, "gpt-4o-mini"), RetryConfig::none());
        let text = client.complete(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(text, "Hello!");
    }

    #[tokio::test]
    async fn test_reasoning_family_request_uses_completion_token_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-5-mini",
                "max_completion_tokens": 1000
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            OpenAiCompletionClient::new(test_config(&server, "gpt-5-mini"), RetryConfig::none());
        assert_eq!(client.complete(&[ChatMessage::user("hi")]).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_provider_error_message_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {
                    "message": "Incorrect API key provided",
                    "type": "invalid_request_error",
                    "param": null,
                    "code": "invalid_api_key"
                }
            })))
            .mount(&server)
            .await;

        let client =
            OpenAiCompletionClient::new(test_config(&server, "gpt-4o-mini"), RetryConfig::none());
        let err = client.complete(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(err.message().contains("Incorrect API key provided"), "{err}");
    }

    #[tokio::test]
    async fn test_empty_choices_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-2",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4o-mini",
                "choices": []
            })))
            .mount(&server)
            .await;

        let client =
            OpenAiCompletionClient::new(test_config(&server, "gpt-4o-mini"), RetryConfig::none());
        let err = client.complete(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, AiError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn test_placeholder_key_fails_before_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("nope")))
            .expect(0)
            .mount(&server)
            .await;

        let mut config = test_config(&server, "gpt-4o-mini");
        config.api_key = "sk-proj-xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx".to_string();
        let client = OpenAiCompletionClient::new(config, RetryConfig::none());

        let err = client.complete(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, AiError::Config { .. }));
        let err = client.generate_title("user: hi").await.unwrap_err();
        assert!(matches!(err, AiError::Config { .. }));
    }

    #[tokio::test]
    async fn test_generate_title_strips_quotes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({ "max_tokens": 64 })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body("\"Borrow checker tips\"")),
            )
            .mount(&server)
            .await;

        let client =
            OpenAiCompletionClient::new(test_config(&server, "gpt-4o-mini"), RetryConfig::none());
        let title = client.generate_title("user: how do lifetimes work?").await.unwrap();
        assert_eq!(title, "Borrow checker tips");
    }

    #[test]
    fn test_reload_config_reads_environment() {
        // SAFETY: no other test in this crate reads or writes AI_MODEL.
        unsafe { std::env::set_var("AI_MODEL", "gpt-5-nano") };
        let client = OpenAiCompletionClient::new(AiConfig::default(), RetryConfig::none());
        assert_eq!(client.config().model, "gpt-4o-mini");

        client.reload_config();
        assert_eq!(client.config().model, "gpt-5-nano");
        assert_eq!(OpenAiCompletionClient::from_env().config().model, "gpt-5-nano");
        unsafe { std::env::remove_var("AI_MODEL") };
    }

    #[test]
    fn test_set_config_swaps_model() {
        let client = OpenAiCompletionClient::new(AiConfig::default(), RetryConfig::none());
        assert_eq!(client.config().model, "gpt-4o-mini");
        client.set_config(AiConfig {
            model: "gpt-5".to_string(),
            ..AiConfig::default()
        });
        assert_eq!(client.config().model, "gpt-5");
    }
}
