//! LLM text service seam.
//!
//! Stages only see `LlmClient`. `AnthropicClient` is the production adapter
//! for the Messages API; tests plug in scripted clients.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{truncate_chars, HarvestError};
use crate::ledger::TokenUsage;

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.anthropic.com";

/// One single-turn prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    /// Per-call deadline; exceeding it is `HarvestError::Timeout`.
    pub timeout: Duration,
}

/// Generated text plus the usage block, when the service sent one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn new(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage: Some(usage),
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier, for logging.
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, HarvestError>;
}

/// Anthropic Messages API adapter.
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<UsageBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct UsageBlock {
    input_tokens: u64,
    output_tokens: u64,
}

impl AnthropicClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| HarvestError::Configuration(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, HarvestError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "messages": [{
                "role": "user",
                "content": request.prompt,
            }]
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = format!("LLM API error ({status}): {}", truncate_chars(&text, 200));
            // 529 is Anthropic's "overloaded"; back off like a rate limit.
            return Err(match status.as_u16() {
                429 | 529 => HarvestError::RateLimit(detail),
                408 | 504 => HarvestError::Timeout(detail),
                _ => HarvestError::Request(detail),
            });
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text)
            .unwrap_or_default();

        Ok(Completion {
            text,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
        })
    }
}
