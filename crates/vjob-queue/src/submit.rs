//! Producer side: queue bookkeeping plus transport publish.

use std::sync::Arc;

use tracing::info;

use vjob_models::JobEnvelope;

use crate::error::{QueueError, QueueResult};
use crate::task_queue::TaskQueue;
use crate::transport::Transport;

/// Submits jobs for dispatch.
pub struct JobSubmitter {
    queue: Arc<TaskQueue>,
    transport: Arc<dyn Transport>,
}

impl JobSubmitter {
    pub fn new(queue: Arc<TaskQueue>, transport: Arc<dyn Transport>) -> Self {
        Self { queue, transport }
    }

    /// Enqueue the job on its kind's topic and publish the envelope on its
    /// family stream. Returns the transport message id.
    pub async fn submit(&self, envelope: &JobEnvelope) -> QueueResult<String> {
        let job_id = envelope.job_id().as_str();
        let kind = envelope.kind();
        let priority = envelope.priority();
        let payload = envelope.to_bytes()?;

        match self
            .queue
            .try_enqueue(job_id, kind.topic(), i32::from(priority))
            .await
        {
            Some(true) => {}
            Some(false) => {
                return Err(QueueError::enqueue_failed(format!(
                    "job {} is already queued",
                    job_id
                )))
            }
            None => {
                return Err(QueueError::enqueue_failed(format!(
                    "no queue backend accepted job {}",
                    job_id
                )))
            }
        }

        let stream = envelope.family().stream_name();
        let message_id = match self.transport.publish(stream, &payload, priority).await {
            Ok(id) => id,
            Err(e) => {
                // Keep the queue consistent with what was actually sent
                self.queue.remove(job_id).await;
                return Err(e);
            }
        };

        info!(
            job_id,
            kind = %kind,
            stream,
            message_id = %message_id,
            "Submitted job"
        );
        Ok(message_id)
    }

    /// Cancel a job that has not been picked up yet.
    ///
    /// Its message is still delivered; the dispatcher acknowledges it without
    /// running the job. Returns `false` once the job has been picked up.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let cancelled = self.queue.cancel(job_id).await;
        if cancelled {
            info!(job_id, "Cancelled queued job");
        }
        cancelled
    }

    pub async fn position(&self, job_id: &str) -> Option<usize> {
        self.queue.position(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::time::Duration;
    use vjob_models::{AudioJob, JobFamily, JobKind, OverlayJob};

    fn submitter() -> (JobSubmitter, Arc<TaskQueue>, Arc<MemoryTransport>) {
        let queue = Arc::new(TaskQueue::in_memory(10));
        let transport = Arc::new(MemoryTransport::new());
        let submitter = JobSubmitter::new(Arc::clone(&queue), transport.clone());
        (submitter, queue, transport)
    }

    #[tokio::test]
    async fn test_submit_enqueues_and_publishes() {
        let (submitter, queue, transport) = submitter();
        let mut job = AudioJob::new("https://cdn.example.com/a.mp3");
        job.priority = true;
        let envelope = JobEnvelope::from(job);

        submitter.submit(&envelope).await.unwrap();

        assert_eq!(queue.len(JobKind::Audio.topic()).await, 1);
        assert_eq!(submitter.position(envelope.job_id().as_str()).await, Some(0));

        let stream = JobFamily::Audio.stream_name();
        let delivery = transport
            .receive(stream, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(JobEnvelope::from_bytes(&delivery.payload).unwrap(), envelope);
        assert_eq!(delivery.priority, 10);
    }

    #[tokio::test]
    async fn test_priority_job_overtakes_backlog() {
        let (submitter, _queue, transport) = submitter();
        let backlog = JobEnvelope::from(AudioJob::new("https://cdn.example.com/1.mp3"));
        let mut urgent = AudioJob::new("https://cdn.example.com/2.mp3");
        urgent.priority = true;
        let urgent = JobEnvelope::from(urgent);

        submitter.submit(&backlog).await.unwrap();
        submitter.submit(&urgent).await.unwrap();

        let stream = JobFamily::Audio.stream_name();
        let first = transport
            .receive(stream, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(JobEnvelope::from_bytes(&first.payload).unwrap(), urgent);
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_rejected() {
        let (submitter, _queue, transport) = submitter();
        let envelope = JobEnvelope::from(OverlayJob::new("https://cdn.example.com/v.mp4"));

        submitter.submit(&envelope).await.unwrap();
        assert!(submitter.submit(&envelope).await.is_err());

        let stream = JobFamily::Video.stream_name();
        assert_eq!(transport.pending(stream).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let (submitter, queue, _transport) = submitter();
        let envelope = JobEnvelope::from(OverlayJob::new("https://cdn.example.com/v.mp4"));
        let job_id = envelope.job_id().to_string();

        submitter.submit(&envelope).await.unwrap();
        assert!(submitter.cancel(&job_id).await);
        assert!(!submitter.cancel(&job_id).await);
        assert_eq!(queue.dequeue(JobKind::VideoOverlay.topic()).await, None);
        assert_eq!(submitter.position(&job_id).await, None);

        // The dispatcher finds out through the marker
        assert!(queue.take_cancelled(&job_id).await);
    }
}
