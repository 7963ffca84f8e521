//! In-process queue backend.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{QueueBackend, QueueEntry};
use crate::error::QueueResult;

#[derive(Default)]
struct MemoryState {
    /// topic -> priority -> FIFO of job ids
    topics: BTreeMap<String, BTreeMap<u8, VecDeque<String>>>,
    /// job id -> entry, for remove/position without scanning every topic
    index: HashMap<String, QueueEntry>,
    /// Cancelled while queued, not yet seen by a dispatcher
    cancelled: HashSet<String>,
}

impl MemoryState {
    fn unlink(&mut self, job_id: &str) -> bool {
        let Some(entry) = self.index.remove(job_id) else {
            return false;
        };

        let fifo = self
            .topics
            .get_mut(&entry.topic)
            .and_then(|levels| levels.get_mut(&entry.priority));
        if let Some(fifo) = fifo {
            fifo.retain(|id| id != job_id);
        }
        true
    }
}

/// Single-process queue guarded by one lock shared across all topics.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_distributed(&self) -> bool {
        false
    }

    async fn push(&self, entry: &QueueEntry) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        if state.index.contains_key(&entry.job_id) {
            return Ok(false);
        }

        state
            .topics
            .entry(entry.topic.clone())
            .or_default()
            .entry(entry.priority)
            .or_default()
            .push_back(entry.job_id.clone());
        state.index.insert(entry.job_id.clone(), entry.clone());
        // A resubmitted job runs even if an earlier submission was cancelled
        state.cancelled.remove(&entry.job_id);
        Ok(true)
    }

    async fn pop(&self, topic: &str) -> QueueResult<Option<String>> {
        let mut state = self.state.lock().await;
        let Some(levels) = state.topics.get_mut(topic) else {
            return Ok(None);
        };

        let popped = levels
            .values_mut()
            .rev()
            .find_map(|fifo| fifo.pop_front());

        if let Some(job_id) = &popped {
            state.index.remove(job_id);
        }
        Ok(popped)
    }

    async fn remove(&self, job_id: &str) -> QueueResult<bool> {
        Ok(self.state.lock().await.unlink(job_id))
    }

    async fn cancel(&self, job_id: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        if !state.unlink(job_id) {
            return Ok(false);
        }
        state.cancelled.insert(job_id.to_string());
        Ok(true)
    }

    async fn take_cancelled(&self, job_id: &str) -> QueueResult<bool> {
        Ok(self.state.lock().await.cancelled.remove(job_id))
    }

    async fn position(&self, job_id: &str) -> QueueResult<Option<usize>> {
        let state = self.state.lock().await;
        if !state.index.contains_key(job_id) {
            return Ok(None);
        }

        let mut ordered = state
            .topics
            .values()
            .flat_map(|levels| levels.values().rev())
            .flatten();
        Ok(ordered.position(|id| id == job_id))
    }

    async fn len(&self, topic: &str) -> QueueResult<usize> {
        let state = self.state.lock().await;
        Ok(state
            .topics
            .get(topic)
            .map(|levels| levels.values().map(VecDeque::len).sum())
            .unwrap_or(0))
    }
}
