//! Notification sinks.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::NotificationConfig;
use crate::domain::ports::Notifier;

/// Writes alerts to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: &str, message: &str) -> DomainResult<()> {
        info!(channel, message, "notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    channel: &'a str,
    text: &'a str,
}

/// Posts alerts as JSON to a webhook, dropping anything over the rate limit.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    limiter: DefaultDirectRateLimiter,
}

impl WebhookNotifier {
    /// Rate limited to `max_per_minute` posts. Errors on a zero limit.
    pub fn new(url: impl Into<String>, max_per_minute: u32) -> DomainResult<Self> {
        let per_minute = NonZeroU32::new(max_per_minute).ok_or_else(|| {
            DomainError::InvalidValue("notification rate must be positive".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DomainError::InvalidValue(format!("webhook client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, channel: &str, message: &str) -> DomainResult<()> {
        if self.limiter.check().is_err() {
            warn!(channel, "notification dropped by rate limit");
            return Ok(());
        }

        self.client
            .post(&self.url)
            .json(&WebhookPayload {
                channel,
                text: message,
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| DomainError::DispatchFailed(format!("webhook: {e}")))?;
        Ok(())
    }
}

/// Notifier for a configuration: webhook when a URL is set, log otherwise.
pub fn notifier_from_config(config: &NotificationConfig) -> DomainResult<Box<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => Ok(Box::new(WebhookNotifier::new(url.clone(), config.max_per_minute)?)),
        None => Ok(Box::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "channel": "ops",
                "text": "TASK-1 blocked"
            })))
            .with_status(200)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.url()), 10).unwrap();
        notifier.notify("ops", "TASK-1 blocked").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.url()), 10).unwrap();
        assert!(notifier.notify("ops", "hello").await.is_err());
    }

    #[tokio::test]
    async fn test_rate_limit_drops_excess() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.url()), 1).unwrap();
        notifier.notify("ops", "first").await.unwrap();
        notifier.notify("ops", "second").await.unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(WebhookNotifier::new("http://localhost/hook", 0).is_err());
    }
}
