//! Priority task queue over independently served topics.
//!
//! Within a topic, entries are served highest priority first and FIFO
//! within a priority level. Two interchangeable backends implement
//! [`QueueBackend`]: an in-process [`MemoryQueue`] and a [`RedisQueue`]
//! shared by every dispatcher process.
//!
//! [`TaskQueue`] never surfaces backend errors. When the distributed
//! backend fails, the failure is logged and the queue degrades for the
//! rest of the process lifetime to a fresh in-memory backend.

mod memory;
mod redis;

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{QueueError, QueueResult};

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

/// A pending queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub topic: String,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job_id: impl Into<String>, topic: impl Into<String>, priority: u8) -> Self {
        Self {
            job_id: job_id.into(),
            topic: topic.into(),
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

/// Clamp a requested priority into `[1, max_priority]`.
pub fn clamp_priority(priority: i32, max_priority: u8) -> u8 {
    priority.clamp(1, i32::from(max_priority.max(1))) as u8
}

/// Storage behind a [`TaskQueue`].
///
/// Implementations hold at most one pending entry per job id.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether the backend is shared across processes.
    fn is_distributed(&self) -> bool;

    /// Append an entry. Returns `false` if the job id is already pending.
    async fn push(&self, entry: &QueueEntry) -> QueueResult<bool>;

    /// Pop the oldest entry at the highest non-empty priority of `topic`.
    async fn pop(&self, topic: &str) -> QueueResult<Option<String>>;

    /// Remove a pending entry. Returns `false` if it was not queued.
    async fn remove(&self, job_id: &str) -> QueueResult<bool>;

    /// Remove a pending entry and leave a cancellation marker in the same
    /// atomic step. Returns `false` (and leaves no marker) if it was not queued.
    async fn cancel(&self, job_id: &str) -> QueueResult<bool>;

    /// Consume the cancellation marker for `job_id`, if any.
    async fn take_cancelled(&self, job_id: &str) -> QueueResult<bool>;

    /// 0-based rank across all topics, or `None` if not queued.
    async fn position(&self, job_id: &str) -> QueueResult<Option<usize>>;

    /// Number of pending entries in `topic`.
    async fn len(&self, topic: &str) -> QueueResult<usize>;
}

/// Priority multi-queue with transparent fallback to memory.
pub struct TaskQueue {
    backend: RwLock<Arc<dyn QueueBackend>>,
    max_priority: u8,
}

impl TaskQueue {
    /// Create a queue over the given backend.
    pub fn new(backend: Arc<dyn QueueBackend>, max_priority: u8) -> Self {
        Self {
            backend: RwLock::new(backend),
            max_priority: max_priority.max(1),
        }
    }

    /// Create a process-local queue.
    pub fn in_memory(max_priority: u8) -> Self {
        Self::new(Arc::new(MemoryQueue::new()), max_priority)
    }

    pub fn max_priority(&self) -> u8 {
        self.max_priority
    }

    /// Name of the backend currently serving requests.
    pub fn backend_name(&self) -> &'static str {
        self.current().name()
    }

    pub fn is_distributed(&self) -> bool {
        self.current().is_distributed()
    }

    /// Enqueue a job id on `topic`. Priority is clamped into `[1, max_priority]`.
    ///
    /// Returns `false` when the id is already pending (the duplicate is dropped)
    /// or when no backend accepted the write.
    pub async fn enqueue(&self, job_id: &str, topic: &str, priority: i32) -> bool {
        self.try_enqueue(job_id, topic, priority).await.unwrap_or(false)
    }

    /// Like [`TaskQueue::enqueue`], but tells a duplicate (`Some(false)`) apart
    /// from a write that no backend accepted (`None`).
    pub async fn try_enqueue(&self, job_id: &str, topic: &str, priority: i32) -> Option<bool> {
        let entry = QueueEntry::new(job_id, topic, clamp_priority(priority, self.max_priority));
        let entry = &entry;

        let inserted = self
            .with_fallback("enqueue", move |backend| async move { backend.push(entry).await })
            .await;

        match inserted {
            Some(true) => debug!(job_id, topic, priority = entry.priority, "Enqueued task"),
            Some(false) => warn!(job_id, topic, "Duplicate enqueue ignored, job is already queued"),
            None => error!(job_id, topic, "Enqueue lost, no queue backend accepted the entry"),
        }
        inserted
    }

    /// Dequeue the next job id for `topic`, or `None` when it has no pending work.
    pub async fn dequeue(&self, topic: &str) -> Option<String> {
        self.with_fallback("dequeue", move |backend| async move { backend.pop(topic).await })
            .await
            .flatten()
    }

    /// Dequeue up to `batch_size` job ids, stopping early once the topic is empty.
    ///
    /// Not atomic: concurrent producers may interleave with the batch.
    pub async fn dequeue_batch(&self, topic: &str, batch_size: usize) -> Vec<String> {
        let mut tasks = Vec::with_capacity(batch_size.min(64));
        for _ in 0..batch_size {
            match self.dequeue(topic).await {
                Some(job_id) => tasks.push(job_id),
                None => break,
            }
        }
        tasks
    }

    /// Remove a job id if it is still queued. No-op otherwise.
    pub async fn remove(&self, job_id: &str) -> bool {
        self.with_fallback("remove", move |backend| async move { backend.remove(job_id).await })
            .await
            .unwrap_or(false)
    }

    /// Cancel a job that is still queued.
    ///
    /// Unlike [`TaskQueue::remove`], a successful cancel is remembered so the
    /// dispatcher that later receives the job's message skips it.
    pub async fn cancel(&self, job_id: &str) -> bool {
        self.with_fallback("cancel", move |backend| async move { backend.cancel(job_id).await })
            .await
            .unwrap_or(false)
    }

    /// Whether `job_id` was cancelled while queued. Consumes the marker.
    pub async fn take_cancelled(&self, job_id: &str) -> bool {
        self.with_fallback("take_cancelled", move |backend| async move {
            backend.take_cancelled(job_id).await
        })
        .await
        .unwrap_or(false)
    }

    /// Approximate queue position (0 = next) across all topics.
    ///
    /// Best effort: concurrent enqueues and dequeues may shift the result.
    pub async fn position(&self, job_id: &str) -> Option<usize> {
        self.with_fallback("position", move |backend| async move {
            backend.position(job_id).await
        })
        .await
        .flatten()
    }

    /// Pending entries in `topic`.
    pub async fn len(&self, topic: &str) -> usize {
        self.with_fallback("len", move |backend| async move { backend.len(topic).await })
            .await
            .unwrap_or(0)
    }

    fn current(&self) -> Arc<dyn QueueBackend> {
        Arc::clone(&self.backend.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Run `op` against the current backend; on failure degrade to memory and retry once.
    async fn with_fallback<T, F, Fut>(&self, op: &str, f: F) -> Option<T>
    where
        F: Fn(Arc<dyn QueueBackend>) -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        let backend = self.current();
        match f(Arc::clone(&backend)).await {
            Ok(value) => Some(value),
            Err(e) => {
                self.degrade(&backend, op, &e);
                match f(self.current()).await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        error!("Queue {} failed on {} backend: {}", op, self.backend_name(), e);
                        None
                    }
                }
            }
        }
    }

    fn degrade(&self, failed: &Arc<dyn QueueBackend>, op: &str, err: &QueueError) {
        let mut guard = self.backend.write().unwrap_or_else(PoisonError::into_inner);
        if !Arc::ptr_eq(&guard, failed) || !guard.is_distributed() {
            return;
        }
        error!(
            "Queue {} failed on {} backend, falling back to in-memory queue: {}",
            op,
            guard.name(),
            err
        );
        *guard = Arc::new(MemoryQueue::new());
    }
}
