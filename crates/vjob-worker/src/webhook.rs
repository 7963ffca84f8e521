//! Completion webhooks for audio jobs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use vjob_models::JobStatus;

use crate::error::WorkerResult;
use crate::metrics;

/// Body POSTed to a job's callback URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookNotification {
    pub job_id: String,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl WebhookNotification {
    pub fn completed(job_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Completed,
            timestamp: Utc::now(),
            result: Some(result),
        }
    }
}

/// Best-effort delivery: failures are logged, never returned.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookNotifier: Send + Sync {
    /// Returns whether the callback accepted the notification.
    async fn notify(&self, url: &str, notification: &WebhookNotification) -> bool;
}

pub struct HttpWebhookNotifier {
    client: reqwest::Client,
}

impl HttpWebhookNotifier {
    pub fn new(timeout: Duration) -> WorkerResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookNotifier for HttpWebhookNotifier {
    async fn notify(&self, url: &str, notification: &WebhookNotification) -> bool {
        let delivered = match self.client.post(url).json(notification).send().await {
            Ok(response) if response.status().is_success() => {
                info!(job_id = %notification.job_id, "Webhook delivered to {}", url);
                true
            }
            Ok(response) => {
                warn!(
                    job_id = %notification.job_id,
                    "Webhook to {} rejected with HTTP {}",
                    url,
                    response.status()
                );
                false
            }
            Err(e) => {
                warn!(job_id = %notification.job_id, "Webhook to {} failed: {}", url, e);
                false
            }
        };

        metrics::record_webhook(delivered);
        delivered
    }
}
