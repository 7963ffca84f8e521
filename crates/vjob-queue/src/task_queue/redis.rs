//! Redis queue backend.
//!
//! Key layout:
//! - One list per (topic, priority): `media_queue:{topic}:{priority}`
//! - Metadata hash per job: `media_task_meta:{job_id}` -> {topic, priority, created_at}
//! - Known topics: `media_queue:topics`
//! - Cancellation marker: `media_task_cancelled:{job_id}` (expires)
//!
//! Push, pop and cancel run as Lua scripts so a list entry and its metadata
//! are created and destroyed together. `remove` is two commands; racing a
//! `dequeue` it can leave the two briefly disagreeing, which the next
//! `dequeue` tolerates.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::debug;

use super::{QueueBackend, QueueEntry};
use crate::config::JOB_STATUS_TTL_SECS;
use crate::error::QueueResult;

const LIST_PREFIX: &str = "media_queue";
const META_PREFIX: &str = "media_task_meta";
const CANCELLED_PREFIX: &str = "media_task_cancelled";

/// KEYS: meta, list, topics, cancelled. ARGV: job_id, topic, priority, created_at.
const PUSH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'topic', ARGV[2], 'priority', ARGV[3], 'created_at', ARGV[4])
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[2])
redis.call('DEL', KEYS[4])
return 1
"#;

/// KEYS: the topic's lists, highest priority first. ARGV: metadata key prefix.
const POP_SCRIPT: &str = r#"
for _, key in ipairs(KEYS) do
    local job_id = redis.call('LPOP', key)
    if job_id then
        redis.call('DEL', ARGV[1] .. ':' .. job_id)
        return job_id
    end
end
return false
"#;

/// KEYS: list, meta, cancelled. ARGV: job_id, marker ttl seconds.
const CANCEL_SCRIPT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('DEL', KEYS[2])
if removed > 0 then
    redis.call('SET', KEYS[3], '1', 'EX', ARGV[2])
end
return removed
"#;

/// Queue stored in Redis lists, shared by every dispatcher process.
#[derive(Clone)]
pub struct RedisQueue {
    conn: MultiplexedConnection,
    max_priority: u8,
    cancel_ttl: Duration,
}

impl RedisQueue {
    pub fn new(conn: MultiplexedConnection, max_priority: u8) -> Self {
        Self {
            conn,
            max_priority: max_priority.max(1),
            cancel_ttl: Duration::from_secs(JOB_STATUS_TTL_SECS),
        }
    }

    /// How long a cancellation marker waits for the job's message.
    pub fn with_cancel_ttl(mut self, ttl: Duration) -> Self {
        self.cancel_ttl = ttl;
        self
    }

    fn list_key(topic: &str, priority: u8) -> String {
        format!("{}:{}:{}", LIST_PREFIX, topic, priority)
    }

    fn meta_key(job_id: &str) -> String {
        format!("{}:{}", META_PREFIX, job_id)
    }

    fn topics_key() -> String {
        format!("{}:topics", LIST_PREFIX)
    }

    fn cancelled_key(job_id: &str) -> String {
        format!("{}:{}", CANCELLED_PREFIX, job_id)
    }

    /// Read (topic, priority) from a job's metadata hash.
    async fn locate(&self, job_id: &str) -> QueueResult<Option<(String, u8)>> {
        let mut conn = self.conn.clone();
        let meta: HashMap<String, String> = conn.hgetall(Self::meta_key(job_id)).await?;

        let topic = meta.get("topic").cloned();
        let priority = meta.get("priority").and_then(|p| p.parse::<u8>().ok());
        Ok(topic.zip(priority))
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_distributed(&self) -> bool {
        true
    }

    async fn push(&self, entry: &QueueEntry) -> QueueResult<bool> {
        let mut conn = self.conn.clone();

        let script = Script::new(PUSH_SCRIPT);
        let pushed: i64 = script
            .key(Self::meta_key(&entry.job_id))
            .key(Self::list_key(&entry.topic, entry.priority))
            .key(Self::topics_key())
            .key(Self::cancelled_key(&entry.job_id))
            .arg(&entry.job_id)
            .arg(&entry.topic)
            .arg(entry.priority)
            .arg(entry.enqueued_at.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        if pushed == 0 {
            return Ok(false);
        }

        debug!(
            job_id = %entry.job_id,
            topic = %entry.topic,
            priority = entry.priority,
            "Pushed task to Redis queue"
        );
        Ok(true)
    }

    async fn pop(&self, topic: &str) -> QueueResult<Option<String>> {
        let mut conn = self.conn.clone();

        let script = Script::new(POP_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for priority in (1..=self.max_priority).rev() {
            invocation.key(Self::list_key(topic, priority));
        }
        invocation.arg(META_PREFIX);

        let job_id: Option<String> = invocation.invoke_async(&mut conn).await?;
        Ok(job_id)
    }

    async fn remove(&self, job_id: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();

        let removed: i64 = match self.locate(job_id).await? {
            Some((topic, priority)) => {
                conn.lrem(Self::list_key(&topic, priority), 0, job_id).await?
            }
            None => 0,
        };
        conn.del::<_, ()>(Self::meta_key(job_id)).await?;
        Ok(removed > 0)
    }

    async fn cancel(&self, job_id: &str) -> QueueResult<bool> {
        let Some((topic, priority)) = self.locate(job_id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();

        let script = Script::new(CANCEL_SCRIPT);
        let removed: i64 = script
            .key(Self::list_key(&topic, priority))
            .key(Self::meta_key(job_id))
            .key(Self::cancelled_key(job_id))
            .arg(job_id)
            .arg(self.cancel_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn take_cancelled(&self, job_id: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(Self::cancelled_key(job_id)).await?;
        Ok(deleted > 0)
    }

    async fn position(&self, job_id: &str) -> QueueResult<Option<usize>> {
        let Some((topic, priority)) = self.locate(job_id).await? else {
            return Ok(None);
        };
        let mut conn = self.conn.clone();

        let mut topics: Vec<String> = conn.smembers(Self::topics_key()).await?;
        topics.sort();

        // Lengths of every list served before ours
        let mut pipe = redis::pipe();
        let mut queued_lists = 0usize;
        for earlier in topics.iter().filter(|t| t.as_str() < topic.as_str()) {
            for p in 1..=self.max_priority {
                pipe.llen(Self::list_key(earlier, p));
                queued_lists += 1;
            }
        }
        for p in (priority + 1)..=self.max_priority {
            pipe.llen(Self::list_key(&topic, p));
            queued_lists += 1;
        }

        let ahead: usize = if queued_lists == 0 {
            0
        } else {
            let lens: Vec<usize> = pipe.query_async(&mut conn).await?;
            lens.into_iter().sum()
        };

        let ids: Vec<String> = conn.lrange(Self::list_key(&topic, priority), 0, -1).await?;
        Ok(ids.iter().position(|id| id == job_id).map(|i| ahead + i))
    }

    async fn len(&self, topic: &str) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for p in 1..=self.max_priority {
            pipe.llen(Self::list_key(topic, p));
        }
        let lens: Vec<usize> = pipe.query_async(&mut conn).await?;
        Ok(lens.into_iter().sum())
    }
}
