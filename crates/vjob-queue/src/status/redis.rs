//! Redis status backend: one JSON string per record, written with SETEX.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use vjob_models::JobRecord;

use super::StatusBackend;
use crate::error::QueueResult;

#[derive(Clone)]
pub struct RedisStatusBackend {
    conn: MultiplexedConnection,
}

impl RedisStatusBackend {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StatusBackend for RedisStatusBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put(&self, key: &str, record: &JobRecord, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        // SETEX rejects a zero expiry
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, json, seconds).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(key).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
