//! Webhook delivery of notification messages
//!
//! Posts `{"text": "..."}` to the configured destination, the payload format
//! understood by Slack incoming webhooks and compatible sinks. Delivery is
//! low-frequency and bursty, so the connection pool is kept small.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::NotifyError;
use crate::models::{Notification, NotificationPayload};

/// HTTP client settings for webhook delivery
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Idle connections kept per destination host
    pub max_idle_connections: usize,
    /// How long an idle connection stays in the pool
    pub idle_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: 10,
            idle_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Delivers one message to one destination
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send the notification once. Retrying is the caller's business.
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier posting JSON payloads over HTTP(S)
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_idle_connections)
            .pool_idle_timeout(config.idle_timeout)
            .timeout(config.request_timeout)
            .no_gzip()
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = NotificationPayload {
            text: notification.text.clone(),
        };

        let response = self
            .client
            .post(notification.destination.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport {
                destination: redact(&notification.destination),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                destination: redact(&notification.destination),
                status: status.as_u16(),
            });
        }

        debug!(status = status.as_u16(), "Notification delivered");
        Ok(())
    }
}

/// Webhook URLs embed their secret in the path; only the host is logged
fn redact(url: &url::Url) -> String {
    format!("{}://{}", url.scheme(), url.host_str().unwrap_or("unknown"))
}
