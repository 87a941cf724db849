//! Outbound notifications for high-severity safety events.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::safety::Severity;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub org_id: String,
    pub trace_id: String,
    pub details: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Default sink: the structured log.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, n: Notification) -> Result<(), NotifyError> {
        tracing::warn!(
            target = "notify",
            kind = %n.kind,
            severity = n.severity.as_str(),
            org_id = %n.org_id,
            trace_id = %n.trace_id,
            "{}", n.title
        );
        Ok(())
    }
}

/// POSTs the notification as JSON to a fixed URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, n: Notification) -> Result<(), NotifyError> {
        let resp = self.client.post(&self.url).json(&n).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}
