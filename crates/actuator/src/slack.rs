//! Rate-limited Slack notification on `HardwareFault`.
//!
//! Not part of `cooler-core` since it's purely an actuator-side concern;
//! a no-op implementation keeps tests and `-d`/dummy mode free of any
//! outbound HTTP.

use std::time::{Duration, Instant};

#[async_trait::async_trait]
pub trait SlackNotifier: Send + Sync {
    async fn notify(&self, message: &str);
}

pub struct NoopNotifier;

#[async_trait::async_trait]
impl SlackNotifier for NoopNotifier {
    async fn notify(&self, message: &str) {
        tracing::debug!(message, "slack notification suppressed (no-op notifier)");
    }
}

/// Webhook-backed notifier with a simple rate limit: at most one message
/// per `rate_limit` window, regardless of how many faults fire in between.
pub struct WebhookNotifier {
    http: reqwest::Client,
    webhook_url: String,
    rate_limit: Duration,
    last_sent: tokio::sync::Mutex<Option<Instant>>,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>, rate_limit: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            rate_limit,
            last_sent: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl SlackNotifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        let mut last_sent = self.last_sent.lock().await;
        if let Some(last) = *last_sent {
            if last.elapsed() < self.rate_limit {
                tracing::debug!("slack notification rate-limited, dropping");
                return;
            }
        }

        let body = serde_json::json!({ "text": message });
        if let Err(e) = self.http.post(&self.webhook_url).json(&body).send().await {
            tracing::warn!("slack webhook failed: {e}");
            return;
        }
        *last_sent = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_notifier_does_not_panic() {
        let notifier = NoopNotifier;
        notifier.notify("test message").await;
    }
}
