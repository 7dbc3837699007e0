//! Brief Generator: sends a rendered prompt to the model provider.
//!
//! The returned text is not inspected here; the Output Validator owns that.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use briefengine_shared::{
    BriefError, GenerationOptions, ModelConfig, ProviderError, Result, RetryPolicy, retry, with_timeout,
};

/// API version header value sent with every request.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A text generation backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Generate text for `prompt`. May fail or time out per call.
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> std::result::Result<String, ProviderError>;
}

// ---------------------------------------------------------------------------
// Anthropic Messages API
// ---------------------------------------------------------------------------

/// Client for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl AnthropicProvider {
    /// Build a client from the `[model]` config and the model credential.
    pub fn new(config: &ModelConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BriefError::config(format!("failed to build model HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: api_key.into(),
        })
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> std::result::Result<String, ProviderError> {
        let body = MessagesRequest {
            model: &options.model,
            max_tokens: options.max_tokens,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };

        let start = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("model request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let raw = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<ErrorResponse>(&raw) {
                Ok(err) => format!("{}: {}", err.error.kind, err.error.message),
                Err(_) => raw.chars().take(200).collect(),
            };

            return Err(match ProviderError::from_status(status.as_u16(), detail) {
                ProviderError::Transient { message, .. } => ProviderError::Transient { message, retry_after },
                permanent => permanent,
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(format!("invalid model response: {e}")))?;

        let texts: Vec<String> = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();

        if texts.is_empty() {
            return Err(ProviderError::permanent("model response contained no text content"));
        }

        if parsed.stop_reason.as_deref() == Some("max_tokens") {
            warn!(max_tokens = options.max_tokens, "model output hit max_tokens");
        }

        let usage = parsed.usage.unwrap_or(Usage {
            input_tokens: 0,
            output_tokens: 0,
        });
        debug!(
            model = %options.model,
            tokens_in = usage.input_tokens,
            tokens_out = usage.output_tokens,
            latency_ms = start.elapsed().as_millis() as u64,
            "model call complete"
        );

        Ok(texts.concat())
    }
}

// ---------------------------------------------------------------------------
// Retrying generator
// ---------------------------------------------------------------------------

/// Generated text and how many provider calls it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub attempts: u32,
}

/// Wraps a [`ModelProvider`] with per-call timeout and bounded retry.
pub struct BriefGenerator {
    provider: Arc<dyn ModelProvider>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl BriefGenerator {
    pub fn new(provider: Arc<dyn ModelProvider>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            provider,
            policy,
            timeout,
        }
    }

    /// Generate a brief. Exhausted or permanent failures become `ModelUnavailable`.
    #[instrument(skip_all, fields(provider = self.provider.name(), model = %options.model))]
    pub async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<Generation> {
        let mut attempts = 0;
        let generated = retry(&self.policy, "generation", |attempt| {
            attempts = attempt;
            with_timeout(self.timeout, self.provider.generate(prompt, options))
        })
        .await;

        match generated {
            Ok(text) => {
                info!(attempts, chars = text.chars().count(), "brief generated");
                Ok(Generation { text, attempts })
            }
            Err(exhausted) => Err(BriefError::ModelUnavailable {
                attempts: exhausted.attempts,
                message: exhausted.last_error.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn options() -> GenerationOptions {
        GenerationOptions {
            model: "claude-haiku-4-5-20251001".into(),
            max_tokens: 4096,
        }
    }

    fn provider_for(server: &MockServer) -> AnthropicProvider {
        let config = ModelConfig {
            endpoint: format!("{}/v1/messages", server.uri()),
            ..ModelConfig::default()
        };
        AnthropicProvider::new(&config, "sk-test").unwrap()
    }

    #[tokio::test]
    async fn returns_text_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(serde_json::json!({
                "model": "claude-haiku-4-5-20251001",
                "max_tokens": 4096,
                "messages": [{ "role": "user", "content": "Write the brief" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "content": [
                    { "type": "text", "text": "<b>Top Stories</b>\n" },
                    { "type": "text", "text": "• item" }
                ],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 120, "output_tokens": 40 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = provider_for(&server).generate("Write the brief", &options()).await.unwrap();
        assert_eq!(text, "<b>Top Stories</b>\n• item");
    }

    #[tokio::test]
    async fn overloaded_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(529)
                    .set_body_json(serde_json::json!({
                        "type": "error",
                        "error": { "type": "overloaded_error", "message": "Overloaded" }
                    })),
            )
            .mount(&server)
            .await;

        let err = provider_for(&server).generate("x", &options()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("overloaded_error: Overloaded"));
    }

    #[tokio::test]
    async fn rate_limit_reads_retry_after_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let err = provider_for(&server).generate("x", &options()).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn auth_failure_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "type": "error",
                "error": { "type": "authentication_error", "message": "invalid x-api-key" }
            })))
            .mount(&server)
            .await;

        let err = provider_for(&server).generate("x", &options()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn no_text_blocks_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [], "stop_reason": "end_turn"
            })))
            .mount(&server)
            .await;

        assert!(provider_for(&server).generate("x", &options()).await.is_err());
    }

    struct AlwaysBusy(AtomicU32);

    #[async_trait]
    impl ModelProvider for AlwaysBusy {
        fn name(&self) -> &str {
            "busy"
        }
        async fn generate(&self, _: &str, _: &GenerationOptions) -> std::result::Result<String, ProviderError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::transient("HTTP 529: overloaded"))
        }
    }

    #[tokio::test]
    async fn generator_stops_at_retry_ceiling() {
        let provider = Arc::new(AlwaysBusy(AtomicU32::new(0)));
        let generator = BriefGenerator::new(provider.clone(), RetryPolicy::immediate(3), Duration::from_secs(5));

        let err = generator.generate("x", &options()).await.unwrap_err();

        assert_eq!(provider.0.load(Ordering::SeqCst), 3);
        assert!(matches!(err, BriefError::ModelUnavailable { attempts: 3, .. }));
    }

    struct Slow;

    #[async_trait]
    impl ModelProvider for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn generate(&self, _: &str, _: &GenerationOptions) -> std::result::Result<String, ProviderError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("late".into())
        }
    }

    #[tokio::test]
    async fn timeout_counts_as_failed_attempt() {
        let generator = BriefGenerator::new(Arc::new(Slow), RetryPolicy::immediate(2), Duration::from_millis(20));
        let err = generator.generate("x", &options()).await.unwrap_err();
        match err {
            BriefError::ModelUnavailable { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("expected ModelUnavailable, got {other:?}"),
        }
    }
}
