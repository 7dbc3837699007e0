//! Telegram Bot API delivery provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use briefengine_shared::{BriefError, DeliveryConfig, Destination, ProviderError, Result};

use crate::DeliveryProvider;

/// Sends one HTML-formatted message per call via `sendMessage`.
pub struct TelegramBot {
    client: Client,
    endpoint: String,
    token: String,
    disable_web_page_preview: bool,
}

impl TelegramBot {
    /// Build a client from the `[delivery]` config and the bot token.
    pub fn new(config: &DeliveryConfig, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BriefError::config(format!("failed to build delivery HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: token.into(),
            disable_web_page_preview: config.disable_web_page_preview,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.endpoint, self.token)
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[async_trait]
impl DeliveryProvider for TelegramBot {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, destination: &Destination, text: &str) -> std::result::Result<String, ProviderError> {
        let body = SendMessage {
            chat_id: &destination.chat_id,
            message_thread_id: destination.thread_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: self.disable_web_page_preview,
        };

        // The token is part of the URL; errors are reported without it.
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("sendMessage request failed: {}", e.without_url())))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("sendMessage response unreadable: {}", e.without_url())))?;
        let parsed: Option<ApiResponse> = serde_json::from_str(&raw).ok();

        if !status.is_success() {
            let detail = parsed
                .as_ref()
                .and_then(|p| p.description.clone())
                .unwrap_or_else(|| raw.chars().take(200).collect());
            let retry_after = parsed
                .as_ref()
                .and_then(|p| p.parameters.as_ref())
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs);

            return Err(match ProviderError::from_status(status.as_u16(), detail) {
                ProviderError::Transient { message, .. } => ProviderError::Transient { message, retry_after },
                permanent => permanent,
            });
        }

        let parsed = parsed.ok_or_else(|| ProviderError::permanent("sendMessage returned invalid JSON"))?;
        if !parsed.ok {
            return Err(ProviderError::permanent(format!(
                "sendMessage rejected: {}",
                parsed.description.unwrap_or_else(|| "no description".into())
            )));
        }

        let message_id = parsed
            .result
            .map(|m| m.message_id)
            .ok_or_else(|| ProviderError::permanent("sendMessage response has no message_id"))?;

        debug!(%destination, message_id, "message sent");
        Ok(message_id.to_string())
    }
}
