//! Job status store.
//!
//! Durable, TTL-bounded record of job state keyed by `{namespace}:{job_id}`,
//! where each [`JobKind`] owns one namespace. Readable by any process;
//! written only by the dispatcher executing the job.
//!
//! Backend failures never reach callers: writes are logged and dropped, reads
//! return `None`. A poller may then see a stale or missing record.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error};

use vjob_models::{JobKind, JobRecord, JobStatus};

use crate::error::QueueResult;

pub use self::memory::MemoryStatusBackend;
pub use self::redis::RedisStatusBackend;

/// Key-value storage for status records with expiry.
#[async_trait]
pub trait StatusBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write a record and (re)set its time-to-live.
    async fn put(&self, key: &str, record: &JobRecord, ttl: Duration) -> QueueResult<()>;

    async fn get(&self, key: &str) -> QueueResult<Option<JobRecord>>;

    async fn delete(&self, key: &str) -> QueueResult<()>;

    async fn ping(&self) -> QueueResult<()>;
}

/// A full status overwrite.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: 0,
            result: None,
            error: None,
        }
    }

    pub fn processing(progress: u8) -> Self {
        Self::new(JobStatus::Processing).with_progress(progress)
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: JobStatus::Completed,
            progress: 100,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            progress: 0,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }
}

/// Status records for all job kinds.
pub struct StatusStore {
    backend: Arc<dyn StatusBackend>,
    ttl: Duration,
}

impl StatusStore {
    pub fn new(backend: Arc<dyn StatusBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Create a process-local store.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryStatusBackend::new()), ttl)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Storage key of a job's record.
    pub fn key(kind: JobKind, job_id: &str) -> String {
        format!("{}:{}", kind.namespace(), job_id)
    }

    /// Overwrite the record, refreshing `updated_at` and the TTL.
    pub async fn set_status(&self, kind: JobKind, job_id: &str, update: StatusUpdate) {
        let record = JobRecord {
            job_id: job_id.to_string(),
            job_type: kind.job_type().map(str::to_string),
            status: update.status,
            progress: update.progress.min(100),
            result: update.result,
            error: update.error,
            updated_at: Utc::now(),
        };
        self.write(kind, &record).await;
    }

    /// Patch only the progress of an existing record.
    ///
    /// Without a record the job is assumed to have just started processing.
    /// Progress of a processing job never moves backwards.
    pub async fn update_progress(&self, kind: JobKind, job_id: &str, progress: u8) {
        let progress = progress.min(100);
        let key = Self::key(kind, job_id);

        let existing = match self.backend.get(&key).await {
            Ok(existing) => existing,
            Err(e) => {
                error!(job_id, kind = %kind, "Failed to read job status: {}", e);
                return;
            }
        };

        match existing {
            Some(mut record) => {
                if record.status == JobStatus::Processing && progress < record.progress {
                    debug!(
                        job_id,
                        kind = %kind,
                        current = record.progress,
                        requested = progress,
                        "Ignoring progress regression"
                    );
                    return;
                }
                record.set_progress(progress);
                self.write(kind, &record).await;
            }
            None => {
                self.set_status(kind, job_id, StatusUpdate::processing(progress))
                    .await
            }
        }
    }

    pub async fn get_status(&self, kind: JobKind, job_id: &str) -> Option<JobRecord> {
        match self.backend.get(&Self::key(kind, job_id)).await {
            Ok(record) => record,
            Err(e) => {
                error!(job_id, kind = %kind, "Failed to read job status: {}", e);
                None
            }
        }
    }

    /// Remove a record before its TTL expires.
    pub async fn delete(&self, kind: JobKind, job_id: &str) {
        if let Err(e) = self.backend.delete(&Self::key(kind, job_id)).await {
            error!(job_id, kind = %kind, "Failed to delete job status: {}", e);
        }
    }

    /// Check that the backend is reachable.
    pub async fn ping(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                error!("Status backend {} unreachable: {}", self.backend.name(), e);
                false
            }
        }
    }

    async fn write(&self, kind: JobKind, record: &JobRecord) {
        let key = Self::key(kind, &record.job_id);
        match self.backend.put(&key, record, self.ttl).await {
            Ok(()) => debug!(
                job_id = %record.job_id,
                kind = %kind,
                status = %record.status,
                progress = record.progress,
                "Job status updated"
            ),
            Err(e) => error!(
                job_id = %record.job_id,
                kind = %kind,
                "Failed to write job status: {}", e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use serde_json::json;

    fn store() -> StatusStore {
        StatusStore::in_memory(Duration::from_secs(60))
    }

    struct BrokenBackend;

    #[async_trait]
    impl StatusBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn put(&self, _key: &str, _record: &JobRecord, _ttl: Duration) -> QueueResult<()> {
            Err(QueueError::connection_failed("timeout"))
        }

        async fn get(&self, _key: &str) -> QueueResult<Option<JobRecord>> {
            Err(QueueError::connection_failed("timeout"))
        }

        async fn delete(&self, _key: &str) -> QueueResult<()> {
            Err(QueueError::connection_failed("timeout"))
        }

        async fn ping(&self) -> QueueResult<()> {
            Err(QueueError::connection_failed("timeout"))
        }
    }

    #[tokio::test]
    async fn test_completed_round_trip() {
        let store = store();
        let result = json!({"transcript": "olá", "segments": 3});

        store
            .set_status(JobKind::Audio, "j1", StatusUpdate::completed(result.clone()))
            .await;

        let record = store.get_status(JobKind::Audio, "j1").await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.result, Some(result));
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_update_progress_without_record_starts_processing() {
        let store = store();
        store.update_progress(JobKind::VideoOverlay, "v1", 42).await;

        let record = store.get_status(JobKind::VideoOverlay, "v1").await.unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.progress, 42);
        assert_eq!(record.job_type.as_deref(), Some("video_processing"));
    }

    #[tokio::test]
    async fn test_update_progress_preserves_status_and_result() {
        let store = store();
        store
            .set_status(JobKind::VideoTakes, "t1", StatusUpdate::completed(json!({"url": "x"})))
            .await;
        store.update_progress(JobKind::VideoTakes, "t1", 80).await;

        let record = store.get_status(JobKind::VideoTakes, "t1").await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 80);
        assert_eq!(record.result, Some(json!({"url": "x"})));
    }

    #[tokio::test]
    async fn test_progress_never_regresses_while_processing() {
        let store = store();
        store
            .set_status(JobKind::Audio, "p1", StatusUpdate::processing(10))
            .await;
        store.update_progress(JobKind::Audio, "p1", 60).await;
        store.update_progress(JobKind::Audio, "p1", 30).await;
        store.update_progress(JobKind::Audio, "p1", 250).await;

        let record = store.get_status(JobKind::Audio, "p1").await.unwrap();
        assert_eq!(record.progress, 100);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = store();
        store
            .set_status(JobKind::VideoTrimJoin, "same-id", StatusUpdate::failed("bad take"))
            .await;

        assert!(store.get_status(JobKind::VideoTakes, "same-id").await.is_none());
        assert!(store.get_status(JobKind::Audio, "same-id").await.is_none());
        let record = store
            .get_status(JobKind::VideoTrimJoin, "same-id")
            .await
            .unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(record.error.as_deref(), Some("bad take"));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        store
            .set_status(JobKind::Audio, "gone", StatusUpdate::processing(5))
            .await;
        store.delete(JobKind::Audio, "gone").await;
        store.delete(JobKind::Audio, "gone").await;

        assert!(store.get_status(JobKind::Audio, "gone").await.is_none());
    }

    #[tokio::test]
    async fn test_backend_failures_are_swallowed() {
        let store = StatusStore::new(Arc::new(BrokenBackend), Duration::from_secs(60));

        store
            .set_status(JobKind::Audio, "j", StatusUpdate::processing(10))
            .await;
        store.update_progress(JobKind::Audio, "j", 50).await;
        store.delete(JobKind::Audio, "j").await;

        assert!(store.get_status(JobKind::Audio, "j").await.is_none());
        assert!(!store.ping().await);
    }

    #[test]
    fn test_key_format() {
        assert_eq!(StatusStore::key(JobKind::Audio, "a"), "job:a");
        assert_eq!(StatusStore::key(JobKind::VideoOverlay, "a"), "video_job:a");
        assert_eq!(StatusStore::key(JobKind::VideoTrimJoin, "a"), "trim_join_job:a");
        assert_eq!(StatusStore::key(JobKind::VideoTakes, "a"), "takes_job:a");
    }
}
