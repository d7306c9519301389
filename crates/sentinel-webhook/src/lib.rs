//! Webhook notifications for control-plane events.
//!
//! This crate delivers [`NotificationEvent`]s to configured HTTP endpoints.
//! Delivery is best-effort: the dispatcher retries a bounded number of times
//! and then drops the event. Bodies are signed with HMAC-SHA256 over the raw
//! bytes, carried in the `x-hub-signature-256` header as `sha256=<hex>`.
//!
//! # Example
//!
//! ```ignore
//! use sentinel_webhook::{WebhookEndpoint, send_notification};
//!
//! let endpoint = WebhookEndpoint {
//!     url: "https://ops.example.com/hooks/sentinel".to_string(),
//!     secret: Some("shared-secret".to_string()),
//!     ..Default::default()
//! };
//!
//! send_notification(&endpoint, &event).await.expect("send");
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use sentinel_types::NotificationEvent;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

fn default_timeout() -> u64 {
    10
}

/// One outbound delivery target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Target URL; receives a JSON POST per event.
    pub url: String,
    /// Shared secret for the body signature. Unsigned posts when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for WebhookEndpoint {
    fn default() -> Self {
        Self { url: String::new(), secret: None, timeout_secs: default_timeout() }
    }
}

/// Envelope posted to endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Topic label, e.g. `rollout.state_changed`.
    pub topic: String,
    #[serde(flatten)]
    pub event: NotificationEvent,
    pub delivered_at: chrono::DateTime<chrono::Utc>,
}

impl WebhookDelivery {
    pub fn new(event: NotificationEvent) -> Self {
        Self {
            topic: event.topic().to_string(),
            event,
            delivered_at: sentinel_types::clock::now(),
        }
    }
}

/// Compute the signature header value for a raw body.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .context("failed to initialize HMAC")?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Verify a signature header value against a raw body.
pub fn verify_body(secret: &str, body: &[u8], header: &str) -> bool {
    sign_body(secret, body).is_ok_and(|expected| constant_time_eq(expected.as_bytes(), header.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Deliver one event to one endpoint.
pub async fn send_notification(endpoint: &WebhookEndpoint, event: &NotificationEvent) -> Result<()> {
    let delivery = WebhookDelivery::new(event.clone());
    let body = serde_json::to_vec(&delivery).context("failed to serialize webhook body")?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(endpoint.timeout_secs))
        .build()
        .context("failed to create HTTP client")?;

    let mut request = client
        .post(&endpoint.url)
        .header("Content-Type", "application/json");
    if let Some(secret) = &endpoint.secret {
        request = request.header(SIGNATURE_HEADER, sign_body(secret, &body)?);
    }

    let response = request
        .body(body)
        .send()
        .await
        .context("failed to send webhook request")?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!(
            "webhook request failed with status {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        ));
    }

    Ok(())
}
