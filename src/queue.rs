use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::models::Update;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Durable queue handoff. Intake acknowledges the webhook only after a
/// publish confirmation from the implementation.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publish a raw update payload; returns the queue-assigned message id.
    async fn publish(
        &self,
        payload: &[u8],
        attributes: HashMap<String, String>,
    ) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    #[serde(rename = "messageIds", default)]
    message_ids: Vec<String>,
}

/// REST publisher for a Pub/Sub-style topic endpoint.
pub struct HttpQueuePublisher {
    client: reqwest::Client,
    topic_url: String,
    token: Option<String>,
}

impl HttpQueuePublisher {
    pub fn new(topic_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            topic_url,
            token,
        }
    }
}

#[async_trait]
impl QueuePublisher for HttpQueuePublisher {
    async fn publish(
        &self,
        payload: &[u8],
        attributes: HashMap<String, String>,
    ) -> Result<String> {
        let body = json!({
            "messages": [{
                "data": STANDARD.encode(payload),
                "attributes": attributes,
            }]
        });

        let mut request = self
            .client
            .post(&self.topic_url)
            .timeout(PUBLISH_TIMEOUT)
            .json(&body);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("Failed to reach queue topic")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Queue publish error ({status}): {text}");
        }

        let parsed: PublishResponse = response.json().await.unwrap_or(PublishResponse {
            message_ids: Vec::new(),
        });
        let message_id = parsed
            .message_ids
            .into_iter()
            .next()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(message_id, "Update published to queue");
        Ok(message_id)
    }
}

/// One push delivery from the queue: `{message: {data, messageId, ...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
    #[serde(rename = "publishTime", default)]
    pub publish_time: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl PushEnvelope {
    /// Base64 payload → JSON update. Failures here bubble up as processing
    /// errors, which the queue answers with redelivery.
    pub fn decode_update(&self) -> Result<Update> {
        let data = self
            .message
            .data
            .as_deref()
            .filter(|d| !d.is_empty())
            .context("Queue message has no data payload")?;
        let decoded = STANDARD
            .decode(data)
            .context("Queue message data is not valid base64")?;
        serde_json::from_slice(&decoded).context("Queue message data is not a valid update")
    }
}
