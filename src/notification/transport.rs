//! Outbound chat transport boundary
//!
//! The dispatcher hands over `(recipients, text)` pairs; protocol details live behind
//! `ChatTransport`. `WebhookTransport` posts them as JSON to a bridge endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::utils::AppError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn deliver(&self, recipients: &[String], text: &str) -> Result<(), AppError>;
}

/// Webhook payload
#[derive(Debug, Serialize)]
pub struct WebhookMessage<'a> {
    pub recipients: &'a [String],
    pub content: &'a str,
}

#[derive(Debug, Clone)]
pub struct WebhookTransport {
    webhook_url: String,
    client: Client,
    enabled: bool,
}

impl WebhookTransport {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            webhook_url: webhook_url.into(),
            client,
            enabled: true,
        }
    }

    /// Transport that only logs messages
    pub fn disabled() -> Self {
        Self {
            webhook_url: String::new(),
            client: Client::new(),
            enabled: false,
        }
    }

    /// Built once logging is up, so a missing URL is recorded
    pub fn from_url(url: Option<&str>) -> Self {
        match url {
            Some(url) => Self::new(url),
            None => {
                warn!("NOTIFY_WEBHOOK_URL is not set, notifications will only be logged");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.webhook_url.is_empty()
    }
}

#[async_trait]
impl ChatTransport for WebhookTransport {
    #[instrument(skip_all, fields(recipients = recipients.len()))]
    async fn deliver(&self, recipients: &[String], text: &str) -> Result<(), AppError> {
        if !self.is_enabled() {
            info!(?recipients, content = %text, "Webhook disabled, notification logged only");
            return Ok(());
        }

        let payload = WebhookMessage {
            recipients,
            content: text,
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to send notification webhook");
                AppError::DeliveryFailed(format!("webhook request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Notification webhook returned error");
            return Err(AppError::DeliveryFailed(format!(
                "webhook error: {} - {}",
                status, body
            )));
        }

        debug!("Notification delivered");
        Ok(())
    }
}
