use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;

/// Topics the core publishes on. The transport behind the sink (socket
/// layer, pub/sub, webhook) handles subscriber fan-out; the core only ever
/// calls `publish`.
pub mod topics {
    pub const CHANNEL_STATUS: &str = "channel.status";
    pub const SESSION_METRICS: &str = "session.metrics";
    pub const CHANNEL_ALERT: &str = "channel.alert";
    pub const DELIVERY_STATUS: &str = "delivery.status";
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()>;
}

/// Publish and log on failure. Event emission is observability, never a
/// reason to fail the operation that produced the event.
pub async fn publish_or_log(sink: &dyn EventSink, topic: &str, payload: serde_json::Value) {
    if let Err(error) = sink.publish(topic, payload).await {
        tracing::warn!(%error, topic, "event publish failed");
    }
}

/// In-memory sink for tests and the `doctor` command.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_for(&self, topic: &str) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push((topic.to_string(), payload));
        }
        Ok(())
    }
}

/// Sink that POSTs events to an external transport endpoint, signing the
/// body with `x-hub-signature-256` when a secret is configured.
pub struct WebhookEventSink {
    http: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookEventSink {
    pub fn new(url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            url: url.to_string(),
            secret: None,
        })
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned);
        self
    }
}

#[async_trait]
impl EventSink for WebhookEventSink {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(&serde_json::json!({
            "topic": topic,
            "payload": payload,
            "published_at": Utc::now(),
        }))?;

        let mut request = self
            .http
            .post(&self.url)
            .header("content-type", "application/json");
        if let Some(secret) = self.secret.as_deref() {
            let signature = format!("sha256={}", hmac_sha256_hex(secret.as_bytes(), &body));
            request = request.header("x-hub-signature-256", signature);
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "event webhook rejected publish: status={status} body={text}"
            ));
        }
        Ok(())
    }
}

fn hmac_sha256_hex(key: &[u8], payload: &[u8]) -> String {
    let mut key_block = [0_u8; 64];
    if key.len() > 64 {
        let mut hasher = Sha256::new();
        hasher.update(key);
        let digest = hasher.finalize();
        key_block[..32].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner_pad = [0_u8; 64];
    let mut outer_pad = [0_u8; 64];
    for index in 0..64 {
        inner_pad[index] = key_block[index] ^ 0x36;
        outer_pad[index] = key_block[index] ^ 0x5c;
    }

    let mut inner = Sha256::new();
    inner.update(inner_pad);
    inner.update(payload);
    let inner_digest = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(outer_pad);
    outer.update(inner_digest);
    let digest = outer.finalize();

    to_lower_hex(&digest)
}

fn to_lower_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}
