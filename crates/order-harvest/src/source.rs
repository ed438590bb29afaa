//! Message gateway client.
//!
//! `fetch` never fails: any problem is logged, followed by the failure
//! cooldown, and reported as an empty batch. Whether to try again is the
//! caller's decision.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::errors::{truncate_chars, HarvestError};
use crate::pacing::{self, DelayRange};

pub const DEFAULT_GATEWAY_BASE_URL: &str = "https://api.ultramsg.com";

/// One chat message as delivered by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Zero-based index within the fetched batch.
    pub position: usize,
    pub body: String,
    pub from: Option<String>,
    pub timestamp: Option<i64>,
}

impl RawMessage {
    pub fn new(position: usize, body: impl Into<String>) -> Self {
        Self {
            position,
            body: body.into(),
            from: None,
            timestamp: None,
        }
    }

    fn from_value(position: usize, value: &Value) -> Self {
        Self {
            position,
            body: value
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            from: value.get("from").and_then(Value::as_str).map(str::to_string),
            timestamp: value.get("timestamp").and_then(Value::as_i64),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch up to `limit` messages from `chat_id`. Empty on any failure.
    async fn fetch(&self, chat_id: &str, limit: usize) -> Vec<RawMessage>;
}

/// Waits around a gateway fetch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FetchPacing {
    pub before: DelayRange,
    pub after: DelayRange,
    #[serde(with = "crate::pacing::duration_secs")]
    pub failure_cooldown: Duration,
}

impl FetchPacing {
    pub const NONE: FetchPacing = FetchPacing {
        before: DelayRange::ZERO,
        after: DelayRange::ZERO,
        failure_cooldown: Duration::ZERO,
    };
}

/// Decode a gateway body. Anything but a JSON array is "no messages".
pub fn decode_messages(body: &str) -> Result<Vec<RawMessage>, HarvestError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| HarvestError::Source(format!("undecodable body: {e}")))?;
    match value {
        Value::Array(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, item)| RawMessage::from_value(i, item))
            .collect()),
        other => {
            warn!(
                body = %truncate_chars(&other.to_string(), 120),
                "gateway answered with a non-array body"
            );
            Ok(Vec::new())
        }
    }
}

/// UltraMsg-style REST gateway: `GET {base}/{instance}/chats/messages`.
pub struct UltraMsgSource {
    client: reqwest::Client,
    base_url: String,
    instance_id: String,
    token: String,
    pacing: FetchPacing,
}

impl UltraMsgSource {
    pub fn new(
        base_url: impl Into<String>,
        instance_id: impl Into<String>,
        token: impl Into<String>,
        pacing: FetchPacing,
    ) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| HarvestError::Configuration(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            instance_id: instance_id.into(),
            token: token.into(),
            pacing,
        })
    }

    async fn request(&self, chat_id: &str, limit: usize) -> Result<Vec<RawMessage>, HarvestError> {
        let url = format!("{}/{}/chats/messages", self.base_url, self.instance_id);
        let limit = limit.to_string();
        let response = self
            .client
            .get(url)
            .header("content-type", "application/x-www-form-urlencoded")
            .query(&[
                ("token", self.token.as_str()),
                ("chatId", chat_id),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| HarvestError::Source(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HarvestError::Source(e.without_url().to_string()))?;
        if !status.is_success() {
            return Err(HarvestError::Source(format!(
                "gateway error ({status}): {}",
                truncate_chars(&body, 120)
            )));
        }
        decode_messages(&body)
    }
}

#[async_trait]
impl MessageSource for UltraMsgSource {
    async fn fetch(&self, chat_id: &str, limit: usize) -> Vec<RawMessage> {
        info!(chat_id, limit, "fetching chat history");
        pacing::delay(self.pacing.before, "pre-fetch delay").await;

        match self.request(chat_id, limit).await {
            Ok(messages) => {
                info!(count = messages.len(), "messages fetched");
                pacing::delay(self.pacing.after, "post-fetch cooldown").await;
                messages
            }
            Err(e) => {
                error!(error = %e, cooldown_secs = self.pacing.failure_cooldown.as_secs(), "gateway fetch failed");
                pacing::pause(self.pacing.failure_cooldown).await;
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn decodes_array_with_positions() {
        let body = r#"[{"body":"primero","from":"573001@c.us","timestamp":1700000000},{"body":"segundo"}]"#;
        let messages = decode_messages(body).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].position, 0);
        assert_eq!(messages[0].from.as_deref(), Some("573001@c.us"));
        assert_eq!(messages[0].timestamp, Some(1_700_000_000));
        assert_eq!(messages[1].body, "segundo");
        assert_eq!(messages[1].position, 1);
    }

    #[test]
    fn non_array_body_is_empty() {
        let messages = decode_messages(r#"{"error":"invalid token"}"#).unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn odd_elements_get_empty_bodies() {
        let messages = decode_messages(r#"[42, {"body": 7}, {"type":"image"}]"#).unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.body.is_empty()));
    }

    #[test]
    fn garbage_is_a_source_error() {
        assert!(matches!(
            decode_messages("<html>"),
            Err(HarvestError::Source(_))
        ));
    }

    #[tokio::test]
    async fn fetch_sends_credentials_and_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance1/chats/messages"))
            .and(query_param("token", "tok"))
            .and(query_param("chatId", "group@g.us"))
            .and(query_param("limit", "20"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{"body": "hola"}, {"body": "pedido"}])),
            )
            .mount(&server)
            .await;

        let source = UltraMsgSource::new(server.uri(), "instance1", "tok", FetchPacing::NONE).unwrap();
        let messages = source.fetch("group@g.us", 20).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].body, "pedido");
    }

    #[tokio::test]
    async fn server_error_yields_empty_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = UltraMsgSource::new(server.uri(), "i", "t", FetchPacing::NONE).unwrap();
        assert!(source.fetch("chat", 10).await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_gateway_yields_empty_batch() {
        // Nothing listens on port 9 on loopback.
        let source = UltraMsgSource::new("http://127.0.0.1:9", "i", "t", FetchPacing::NONE).unwrap();
        assert!(source.fetch("chat", 10).await.is_empty());
    }

    #[tokio::test]
    async fn transport_error_text_omits_the_token() {
        let source =
            UltraMsgSource::new("http://127.0.0.1:9", "inst", "SECRET-TOKEN", FetchPacing::NONE)
                .unwrap();
        let err = source.request("chat", 10).await.unwrap_err();
        assert!(matches!(err, HarvestError::Source(_)));
        assert!(!err.to_string().contains("SECRET-TOKEN"), "{err}");
    }
}
