//! Consumption loop for one job family.
//!
//! Each message is decoded once into a [`JobEnvelope`], routed by its kind
//! to the matching [`Processor`] operation, and its outcome recorded in the
//! [`StatusStore`]. Messages are acknowledged only after the outcome is
//! recorded. Undecodable messages are dead-lettered without redelivery.
//! Jobs cancelled while queued are acknowledged without running.
//!
//! The transport delivers higher priority messages first. Messages left
//! unacknowledged by a crashed consumer are reclaimed periodically.
//!
//! Nothing inside one job's handling stops the loop: processor errors and
//! panics become `error` status records.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

use vjob_models::{JobEnvelope, JobFamily};
use vjob_queue::{Delivery, StatusStore, StatusUpdate, TaskQueue, Transport};

use crate::error::WorkerResult;
use crate::logging::JobLogger;
use crate::metrics;
use crate::processor::{Processor, ProcessorResult, ProgressReporter};
use crate::retry::FailureTracker;
use crate::webhook::{WebhookNotification, WebhookNotifier};

/// Consecutive receive failures logged before suppression kicks in.
const MAX_LOGGED_RECEIVE_FAILURES: u32 = 5;

/// Messages taken over per reclaim pass.
const RECLAIM_BATCH: usize = 5;

/// What happened to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Processed and recorded as `completed`
    Completed,
    /// Processed and recorded as `error`
    Failed,
    /// Dead-lettered without touching the status store
    Rejected,
    /// Cancelled while queued; acknowledged without running
    Cancelled,
}

pub struct Dispatcher {
    family: JobFamily,
    transport: Arc<dyn Transport>,
    queue: Arc<TaskQueue>,
    status: Arc<StatusStore>,
    processor: Arc<dyn Processor>,
    webhook: Arc<dyn WebhookNotifier>,
    receive_block: Duration,
    reclaim_interval: Duration,
    reclaim_min_idle: Duration,
}

impl Dispatcher {
    pub fn new(
        family: JobFamily,
        transport: Arc<dyn Transport>,
        queue: Arc<TaskQueue>,
        status: Arc<StatusStore>,
        processor: Arc<dyn Processor>,
        webhook: Arc<dyn WebhookNotifier>,
    ) -> Self {
        Self {
            family,
            transport,
            queue,
            status,
            processor,
            webhook,
            receive_block: Duration::from_secs(1),
            reclaim_interval: Duration::from_secs(30),
            reclaim_min_idle: Duration::from_secs(3900),
        }
    }

    pub fn with_receive_block(mut self, block: Duration) -> Self {
        self.receive_block = block;
        self
    }

    /// Every `interval`, take over messages left unacknowledged for `min_idle`.
    pub fn with_reclaim(mut self, interval: Duration, min_idle: Duration) -> Self {
        self.reclaim_interval = interval;
        self.reclaim_min_idle = min_idle;
        self
    }

    pub fn family(&self) -> JobFamily {
        self.family
    }

    /// Consume until `shutdown` turns `true` (or its sender is dropped).
    ///
    /// A job already being handled runs to completion before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        let stream = self.family.stream_name();
        self.transport.prepare(stream).await?;

        info!(
            "Dispatcher started for {} jobs on {} (queue: {}, status: {})",
            self.family,
            stream,
            self.queue.backend_name(),
            self.status.backend_name()
        );

        let mut failures = FailureTracker::new(MAX_LOGGED_RECEIVE_FAILURES);
        let mut reclaim = tokio::time::interval(self.reclaim_interval);
        reclaim.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = reclaim.tick() => self.reclaim_idle().await,
                received = self.transport.receive(stream, self.receive_block) => {
                    match received {
                        Ok(Some(delivery)) => {
                            failures.record_success();
                            self.handle_delivery(&delivery).await;
                        }
                        Ok(None) => failures.record_success(),
                        Err(e) => {
                            if failures.record_failure() {
                                error!(stream, "Failed to receive from transport: {}", e);
                            }
                            // Back off on error, unless shutdown arrives first
                            let backoff = failures.failure_count().min(5);
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(u64::from(backoff))) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                }
            }
        }

        info!("Dispatcher for {} jobs stopped", self.family);
        Ok(())
    }

    /// Handle messages abandoned by consumers that died mid-job.
    async fn reclaim_idle(&self) {
        let stream = self.family.stream_name();
        match self
            .transport
            .reclaim(stream, self.reclaim_min_idle, RECLAIM_BATCH)
            .await
        {
            Ok(deliveries) if deliveries.is_empty() => {}
            Ok(deliveries) => {
                info!(stream, count = deliveries.len(), "Reclaimed abandoned messages");
                metrics::record_messages_reclaimed(stream, deliveries.len());
                for delivery in &deliveries {
                    self.handle_delivery(delivery).await;
                }
            }
            Err(e) => warn!(stream, "Failed to reclaim idle messages: {}", e),
        }
    }

    /// Decode, execute and settle one message.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> DispatchOutcome {
        let stream = self.family.stream_name();

        let envelope = match JobEnvelope::from_bytes(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(stream, message_id = %delivery.id, "Undecodable message: {}", e);
                self.reject(delivery, "undecodable", &format!("undecodable payload: {}", e))
                    .await;
                return DispatchOutcome::Rejected;
            }
        };

        if envelope.family() != self.family {
            warn!(
                stream,
                message_id = %delivery.id,
                job_id = %envelope.job_id(),
                "Received {} job on the {} stream",
                envelope.kind(),
                self.family
            );
            let reason = format!("{} job does not belong to {}", envelope.kind(), stream);
            self.reject(delivery, "wrong_family", &reason).await;
            return DispatchOutcome::Rejected;
        }

        let job_id = envelope.job_id().as_str();
        if self.is_cancelled(job_id).await {
            info!(job_id, kind = %envelope.kind(), "Skipping job cancelled while queued");
            metrics::record_job_cancelled(envelope.kind());
            self.ack(delivery, job_id).await;
            return DispatchOutcome::Cancelled;
        }

        let outcome = self.execute(&envelope).await;
        self.ack(delivery, job_id).await;
        outcome
    }

    /// Take the job out of the task queue, or learn that it was cancelled there.
    ///
    /// A cancel removes the entry and leaves its marker atomically, so a
    /// failed remove followed by a missing marker means the entry was never
    /// in this queue (or was already taken) and the job runs.
    async fn is_cancelled(&self, job_id: &str) -> bool {
        if self.queue.remove(job_id).await {
            debug!(job_id, "Removed dispatched job from task queue");
            return false;
        }
        self.queue.take_cancelled(job_id).await
    }

    async fn ack(&self, delivery: &Delivery, job_id: &str) {
        let stream = self.family.stream_name();
        if let Err(e) = self.transport.ack(stream, delivery).await {
            error!(message_id = %delivery.id, job_id, "Failed to ack message: {}", e);
        }
    }

    /// Run one job and record its outcome.
    pub async fn execute(&self, envelope: &JobEnvelope) -> DispatchOutcome {
        let kind = envelope.kind();
        let job_id = envelope.job_id().as_str();
        let logger = JobLogger::new(job_id, kind);

        async {
            let started = Instant::now();
            logger.log_start(&format!("priority {}", envelope.priority()));
            metrics::record_job_started(kind);

            self.status
                .set_status(kind, job_id, StatusUpdate::processing(kind.accepted_progress()))
                .await;

            if let Err(errors) = envelope.validate() {
                let message = format!("Invalid payload: {}", errors);
                return self.fail(&logger, &message, "invalid_payload", started).await;
            }

            let reporter = ProgressReporter::new(Arc::clone(&self.status), kind, job_id);
            let result = AssertUnwindSafe(self.invoke(envelope, &reporter))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(serde_json::Value::Null)) => {
                    let message = "Processing error: processor returned no result";
                    self.fail(&logger, message, "processing", started).await
                }
                Ok(Ok(value)) => self.complete(envelope, &logger, value, started).await,
                Ok(Err(e)) => {
                    let message = format!("Processing error: {}", e);
                    self.fail(&logger, &message, "processing", started).await
                }
                Err(panic) => {
                    let message = format!("Unexpected error: {}", panic_message(panic.as_ref()));
                    self.fail(&logger, &message, "unexpected", started).await
                }
            }
        }
        .instrument(logger.create_span())
        .await
    }

    async fn invoke(&self, envelope: &JobEnvelope, progress: &ProgressReporter) -> ProcessorResult {
        match envelope {
            JobEnvelope::Audio(job) => self.processor.transcribe(job, progress).await,
            JobEnvelope::VideoOverlay(job) => self.processor.overlay(job, progress).await,
            JobEnvelope::VideoTrimJoin(job) => self.processor.trim_join(job, progress).await,
            JobEnvelope::VideoTakes(job) => self.processor.process_takes(job, progress).await,
        }
    }

    async fn complete(
        &self,
        envelope: &JobEnvelope,
        logger: &JobLogger,
        result: serde_json::Value,
        started: Instant,
    ) -> DispatchOutcome {
        let kind = envelope.kind();
        let job_id = logger.job_id();

        self.status
            .set_status(kind, job_id, StatusUpdate::completed(result.clone()))
            .await;

        let elapsed = started.elapsed().as_secs_f64();
        logger.log_completion(elapsed);
        metrics::record_job_completed(kind, elapsed);

        // Completion stands whether or not the callback accepts it
        if let Some(url) = envelope.webhook_url() {
            let notification = WebhookNotification::completed(job_id, result);
            if !self.webhook.notify(url, &notification).await {
                logger.log_warning("webhook delivery failed");
            }
        }

        DispatchOutcome::Completed
    }

    async fn fail(
        &self,
        logger: &JobLogger,
        message: &str,
        reason: &'static str,
        started: Instant,
    ) -> DispatchOutcome {
        logger.log_error(message);
        self.status
            .set_status(logger.kind(), logger.job_id(), StatusUpdate::failed(message))
            .await;
        metrics::record_job_failed(logger.kind(), reason, started.elapsed().as_secs_f64());
        DispatchOutcome::Failed
    }

    async fn reject(&self, delivery: &Delivery, metric_reason: &'static str, reason: &str) {
        let stream = self.family.stream_name();
        metrics::record_message_rejected(stream, metric_reason);
        if let Err(e) = self.transport.reject(stream, delivery, reason).await {
            error!(stream, message_id = %delivery.id, "Failed to reject message: {}", e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during processing".to_string()
    }
}
