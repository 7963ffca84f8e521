//! Transport on Redis Streams with one consumer group shared by all dispatchers.
//!
//! A topic is backed by one stream per priority level: `{topic}` holds
//! priority 1 and `{topic}:p{n}` holds priority `n`. Consumers read the
//! levels from highest to lowest, so a priority message published behind a
//! backlog is delivered before it.

use std::cmp::Reverse;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{Delivery, Transport};
use crate::config::TransportConfig;
use crate::error::{QueueError, QueueResult};

const PAYLOAD_FIELD: &str = "job";

/// Redis Streams transport.
///
/// Owns a dedicated connection: `XREADGROUP ... BLOCK` stalls every other
/// command pipelined on the same connection.
pub struct RedisStreamTransport {
    conn: MultiplexedConnection,
    consumer_group: String,
    consumer_name: String,
    max_priority: u8,
    /// (topic, delivery) read by a blocking call alongside a higher priority
    /// message; already owned by this consumer
    buffered: Mutex<Vec<(String, Delivery)>>,
}

impl RedisStreamTransport {
    /// Connect and verify the server answers PING.
    pub async fn connect(config: &TransportConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let mut conn = tokio::time::timeout(
            config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| QueueError::connection_failed("timed out connecting to transport"))??;

        redis::cmd("PING").query_async::<()>(&mut conn).await?;

        info!(
            "Connected to transport, consumer {} in group {}",
            config.consumer_name, config.consumer_group
        );
        Ok(Self {
            conn,
            consumer_group: config.consumer_group.clone(),
            consumer_name: config.consumer_name.clone(),
            max_priority: config.max_priority.max(1),
            buffered: Mutex::new(Vec::new()),
        })
    }

    fn dlq_stream(topic: &str) -> String {
        format!("{}:dlq", topic)
    }

    fn stream_key(topic: &str, priority: u8) -> String {
        if priority <= 1 {
            topic.to_string()
        } else {
            format!("{}:p{}", topic, priority)
        }
    }

    fn level_of(topic: &str, stream: &str) -> u8 {
        stream
            .strip_prefix(topic)
            .and_then(|rest| rest.strip_prefix(":p"))
            .and_then(|p| p.parse().ok())
            .unwrap_or(1)
    }

    /// Priority levels, highest first.
    fn levels(&self) -> impl Iterator<Item = u8> {
        (1..=self.max_priority).rev()
    }

    /// Dead-lettered messages for `topic`.
    pub async fn dlq_len(&self, topic: &str) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(Self::dlq_stream(topic)).await?;
        Ok(len)
    }

    async fn create_group(&self, stream: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        // Create consumer group (ignore error if already exists)
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&self.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => info!("Created consumer group {} on {}", self.consumer_group, stream),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group {} already exists on {}", self.consumer_group, stream);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }
        Ok(())
    }

    /// `XREADGROUP COUNT 1` over `streams`; without `block` it returns at once.
    async fn read_group(
        &self,
        streams: &[String],
        block: Option<Duration>,
    ) -> QueueResult<Option<StreamReadReply>> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.consumer_group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            // BLOCK 0 would wait forever
            cmd.arg("BLOCK").arg((block.as_millis() as u64).max(1));
        }
        cmd.arg("STREAMS");
        for stream in streams {
            cmd.arg(stream);
        }
        for _ in streams {
            cmd.arg(">"); // Only new messages
        }

        // Nil reply when nothing is ready
        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
        Ok(reply)
    }

    fn to_delivery(topic: &str, priority: u8, entry: &StreamId) -> Delivery {
        let payload = match entry.map.get(PAYLOAD_FIELD) {
            Some(redis::Value::BulkString(bytes)) => bytes.clone(),
            Some(redis::Value::SimpleString(s)) => s.clone().into_bytes(),
            _ => {
                // Surface as an empty payload so the consumer rejects it
                warn!(topic, message_id = %entry.id, "Message has no job field");
                Vec::new()
            }
        };
        Delivery::new(entry.id.clone(), payload).with_priority(priority)
    }

    /// Deliveries in a read reply, highest priority first.
    fn collect(topic: &str, reply: Option<StreamReadReply>) -> Vec<Delivery> {
        let mut deliveries: Vec<Delivery> = reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|stream_key| {
                let priority = Self::level_of(topic, &stream_key.key);
                stream_key
                    .ids
                    .into_iter()
                    .map(move |entry| (priority, entry))
            })
            .map(|(priority, entry)| Self::to_delivery(topic, priority, &entry))
            .collect();
        deliveries.sort_by_key(|d| Reverse(d.priority));
        deliveries
    }

    fn take_buffered(&self, topic: &str) -> Option<Delivery> {
        let mut buffered = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
        let index = buffered
            .iter()
            .enumerate()
            .filter(|(_, (owner, _))| owner == topic)
            .min_by_key(|(i, (_, delivery))| (Reverse(delivery.priority), *i))
            .map(|(i, _)| i)?;
        Some(buffered.remove(index).1)
    }
}

#[async_trait]
impl Transport for RedisStreamTransport {
    fn name(&self) -> &'static str {
        "redis-streams"
    }

    async fn prepare(&self, topic: &str) -> QueueResult<()> {
        for priority in self.levels() {
            self.create_group(&Self::stream_key(topic, priority)).await?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], priority: u8) -> QueueResult<String> {
        let mut conn = self.conn.clone();
        let priority = priority.clamp(1, self.max_priority);

        let message_id: String = redis::cmd("XADD")
            .arg(Self::stream_key(topic, priority))
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::publish_failed(e.to_string()))?;

        debug!(topic, priority, message_id = %message_id, "Published message");
        Ok(message_id)
    }

    async fn receive(&self, topic: &str, block: Duration) -> QueueResult<Option<Delivery>> {
        if let Some(delivery) = self.take_buffered(topic) {
            return Ok(Some(delivery));
        }

        // Highest level with a ready message wins
        for priority in self.levels() {
            let stream = [Self::stream_key(topic, priority)];
            let reply = self.read_group(&stream, None).await?;
            if let Some(delivery) = Self::collect(topic, reply).into_iter().next() {
                return Ok(Some(delivery));
            }
        }

        // Nothing ready: wait on every level at once
        let streams: Vec<String> = self
            .levels()
            .map(|priority| Self::stream_key(topic, priority))
            .collect();
        let mut deliveries = Self::collect(topic, self.read_group(&streams, Some(block)).await?);
        if deliveries.is_empty() {
            return Ok(None);
        }

        let first = deliveries.remove(0);
        if !deliveries.is_empty() {
            let mut buffered = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
            buffered.extend(deliveries.into_iter().map(|d| (topic.to_string(), d)));
        }
        Ok(Some(first))
    }

    async fn reclaim(
        &self,
        topic: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as u64;
        let mut claimed = Vec::new();

        for priority in self.levels() {
            if claimed.len() >= count {
                break;
            }
            let stream = Self::stream_key(topic, priority);

            let pending: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(&stream)
                .arg(&self.consumer_group)
                .arg("-")
                .arg("+")
                .arg(count - claimed.len())
                .query_async(&mut conn)
                .await?;

            let idle: Vec<String> = pending
                .ids
                .into_iter()
                .filter(|p| p.last_delivered_ms as u64 >= min_idle_ms)
                .map(|p| p.id)
                .collect();
            if idle.is_empty() {
                continue;
            }

            // XCLAIM re-checks the idle time, so a message settled meanwhile is skipped
            let mut cmd = redis::cmd("XCLAIM");
            cmd.arg(&stream)
                .arg(&self.consumer_group)
                .arg(&self.consumer_name)
                .arg(min_idle_ms);
            for id in &idle {
                cmd.arg(id);
            }
            let reply: StreamClaimReply = cmd.query_async(&mut conn).await?;

            claimed.extend(
                reply
                    .ids
                    .iter()
                    .map(|entry| Self::to_delivery(topic, priority, entry)),
            );
        }

        if !claimed.is_empty() {
            info!(topic, count = claimed.len(), "Claimed idle pending messages");
        }
        Ok(claimed)
    }

    async fn ack(&self, topic: &str, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let stream = Self::stream_key(topic, delivery.priority);

        redis::cmd("XACK")
            .arg(&stream)
            .arg(&self.consumer_group)
            .arg(&delivery.id)
            .query_async::<()>(&mut conn)
            .await?;

        // Delete the message from the stream
        redis::cmd("XDEL")
            .arg(&stream)
            .arg(&delivery.id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(topic, message_id = %delivery.id, "Acknowledged message");
        Ok(())
    }

    async fn reject(&self, topic: &str, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        redis::cmd("XADD")
            .arg(Self::dlq_stream(topic))
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(delivery.payload.as_slice())
            .arg("error")
            .arg(reason)
            .arg("original_id")
            .arg(&delivery.id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(topic, delivery).await?;

        warn!(topic, message_id = %delivery.id, "Moved message to DLQ: {}", reason);
        Ok(())
    }

    async fn pending(&self, topic: &str) -> QueueResult<u64> {
        // Acknowledged entries are deleted, so the stream lengths are the backlog
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for priority in self.levels() {
            pipe.xlen(Self::stream_key(topic, priority));
        }
        let lens: Vec<u64> = pipe.query_async(&mut conn).await?;
        Ok(lens.into_iter().sum())
    }
}
