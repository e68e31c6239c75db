//! Outbound notification sinks (spec.md §1, "the messaging-transport gateway
//! itself is out of scope"). `LogNotificationSink` always works; `WebhookNotificationSink`
//! additionally posts to an operator-configured URL, grounded on the
//! teacher's `reqwest::Client`-based HTTP call idiom (`binance.rs`'s
//! `.post(&url).send().await.context(...)`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};

use crate::domain::ports::NotificationSink;

pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, message: &str) -> Result<()> {
        info!(target: "notifications", "{message}");
        Ok(())
    }

    async fn alarm(&self, message: &str) -> Result<()> {
        warn!(target: "notifications", "{message}");
        Ok(())
    }
}

pub struct WebhookNotificationSink {
    client: Client,
    url: String,
}

impl WebhookNotificationSink {
    pub fn new(url: String) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, url }
    }

    async fn post(&self, level: &str, message: &str) -> Result<()> {
        let body = serde_json::json!({ "level": level, "message": message });
        let response = self.client.post(&self.url).json(&body).send().await.context("failed to post notification webhook")?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("notification webhook returned an error: {text}");
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn notify(&self, message: &str) -> Result<()> {
        info!(target: "notifications", "{message}");
        self.post("info", message).await
    }

    async fn alarm(&self, message: &str) -> Result<()> {
        warn!(target: "notifications", "{message}");
        self.post("alarm", message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_sink_never_fails() {
        let sink = LogNotificationSink;
        assert!(sink.notify("hello").await.is_ok());
        assert!(sink.alarm("uh oh").await.is_ok());
    }
}
