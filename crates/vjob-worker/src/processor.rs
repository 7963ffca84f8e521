//! Media processing capability invoked by the dispatcher.
//!
//! The dispatcher only knows the [`Processor`] trait. The production
//! implementation forwards each job to the media-processing service over
//! HTTP; tests substitute in-process doubles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use vjob_models::{AudioJob, JobKind, OverlayJob, TakesJob, TrimJoinJob};
use vjob_queue::StatusStore;

use crate::error::WorkerResult;
use crate::logging::JobLogger;

/// Failure reported by a [`Processor`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessorError {
    /// The job's input cannot be processed (bad media URL, unreadable take...)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

impl ProcessorError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

pub type ProcessorResult = Result<serde_json::Value, ProcessorError>;

/// Lets a processor publish intermediate progress for the job it runs.
#[derive(Clone)]
pub struct ProgressReporter {
    status: Arc<StatusStore>,
    logger: JobLogger,
}

impl ProgressReporter {
    pub fn new(status: Arc<StatusStore>, kind: JobKind, job_id: impl Into<String>) -> Self {
        Self {
            status,
            logger: JobLogger::new(job_id, kind),
        }
    }

    pub async fn report(&self, progress: u8) {
        self.logger.log_progress(progress);
        self.status
            .update_progress(self.logger.kind(), self.logger.job_id(), progress)
            .await;
    }
}

/// One operation per job kind. Payloads are passed through unmodified.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn transcribe(&self, job: &AudioJob, progress: &ProgressReporter) -> ProcessorResult;

    async fn overlay(&self, job: &OverlayJob, progress: &ProgressReporter) -> ProcessorResult;

    async fn trim_join(&self, job: &TrimJoinJob, progress: &ProgressReporter) -> ProcessorResult;

    async fn process_takes(&self, job: &TakesJob, progress: &ProgressReporter)
        -> ProcessorResult;
}

/// Processor backed by the media-processing HTTP service.
pub struct HttpProcessor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProcessor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> WorkerResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> ProcessorResult {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ProcessorError::failed(format!("request to {} failed: {}", path, e)))?;

        let status = response.status();
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProcessorError::invalid_input(error_detail(status, &text)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProcessorError::failed(error_detail(status, &text)));
        }

        response
            .json()
            .await
            .map_err(|e| ProcessorError::failed(format!("invalid response body: {}", e)))
    }
}

/// Prefer the service's `detail`/`error` field over the raw body.
fn error_detail(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("detail")
                .or_else(|| v.get("error"))
                .and_then(|d| d.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());

    if detail.is_empty() {
        format!("HTTP {}", status)
    } else {
        detail
    }
}

#[async_trait]
impl Processor for HttpProcessor {
    async fn transcribe(&self, job: &AudioJob, _progress: &ProgressReporter) -> ProcessorResult {
        self.post("/audio/process", job).await
    }

    async fn overlay(&self, job: &OverlayJob, _progress: &ProgressReporter) -> ProcessorResult {
        self.post("/video/overlay", job).await
    }

    async fn trim_join(&self, job: &TrimJoinJob, _progress: &ProgressReporter) -> ProcessorResult {
        self.post("/video/trim-join", job).await
    }

    async fn process_takes(
        &self,
        job: &TakesJob,
        _progress: &ProgressReporter,
    ) -> ProcessorResult {
        self.post("/video/takes", job).await
    }
}
