//! Message transport between producers and dispatchers.
//!
//! Delivers raw payload bytes per topic with manual acknowledgement. A
//! received message stays unacknowledged until the consumer calls
//! [`Transport::ack`] or [`Transport::reject`].
//!
//! Each message carries a priority. Within a topic, higher priority messages
//! are delivered first and FIFO within a priority level, the same order the
//! task queue serves its entries in.

mod memory;
mod redis_stream;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueResult;

pub use self::memory::{DeadLetter, MemoryTransport};
pub use self::redis_stream::RedisStreamTransport;

/// A received, not yet acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport-assigned message id
    pub id: String,
    pub payload: Vec<u8>,
    /// Priority the message was published with
    pub priority: u8,
}

impl Delivery {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            priority: 1,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Declare a topic before publishing to or consuming from it. Idempotent.
    async fn prepare(&self, topic: &str) -> QueueResult<()>;

    /// Publish a payload at `priority`, returning the message id.
    async fn publish(&self, topic: &str, payload: &[u8], priority: u8) -> QueueResult<String>;

    /// Wait up to `block` for the next message on `topic`, highest priority first.
    async fn receive(&self, topic: &str, block: Duration) -> QueueResult<Option<Delivery>>;

    /// Take over up to `count` messages delivered at least `min_idle` ago and
    /// never settled, e.g. by a consumer that crashed mid-job.
    async fn reclaim(
        &self,
        topic: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Acknowledge a processed message.
    async fn ack(&self, topic: &str, delivery: &Delivery) -> QueueResult<()>;

    /// Dead-letter a message that must not be redelivered, then acknowledge it.
    async fn reject(&self, topic: &str, delivery: &Delivery, reason: &str) -> QueueResult<()>;

    /// Messages published on `topic` and not yet acknowledged.
    async fn pending(&self, topic: &str) -> QueueResult<u64>;
}
