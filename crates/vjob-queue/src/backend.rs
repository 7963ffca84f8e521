//! Backend selection for the task queue and status store.

use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::status::{MemoryStatusBackend, RedisStatusBackend, StatusStore};
use crate::task_queue::{MemoryQueue, RedisQueue, TaskQueue};

/// Storage strategy, chosen once per process.
#[derive(Clone)]
pub enum Backend {
    /// Process-local storage; nothing survives a restart.
    Memory,
    /// Shared Redis storage visible to every dispatcher process.
    Redis(MultiplexedConnection),
}

impl Backend {
    /// Select the backend from configuration.
    ///
    /// Without a Redis URL the memory backend is used. A configured but
    /// unreachable server is logged and also yields the memory backend.
    pub async fn connect(config: &QueueConfig) -> Self {
        let Some(url) = config.redis_url.as_deref() else {
            info!("No REDIS_URL configured, using in-memory queue and status store");
            return Backend::Memory;
        };

        match Self::connect_redis(url, config).await {
            Ok(conn) => {
                info!("Connected to Redis backend");
                Backend::Redis(conn)
            }
            Err(e) => {
                warn!(
                    "Redis backend unavailable, falling back to in-memory queue and status store: {}",
                    e
                );
                Backend::Memory
            }
        }
    }

    async fn connect_redis(url: &str, config: &QueueConfig) -> QueueResult<MultiplexedConnection> {
        let client = redis::Client::open(url)?;
        let mut conn = tokio::time::timeout(
            config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            QueueError::connection_failed(format!(
                "timed out after {:?}",
                config.connect_timeout
            ))
        })??;

        tokio::time::timeout(
            config.connect_timeout,
            redis::cmd("PING").query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| QueueError::connection_failed("PING timed out"))??;

        Ok(conn)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Redis(_) => "redis",
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Backend::Redis(_))
    }

    pub fn task_queue(&self, config: &QueueConfig) -> TaskQueue {
        match self {
            Backend::Memory => TaskQueue::new(Arc::new(MemoryQueue::new()), config.max_priority),
            Backend::Redis(conn) => TaskQueue::new(
                Arc::new(
                    RedisQueue::new(conn.clone(), config.max_priority)
                        .with_cancel_ttl(config.status_ttl),
                ),
                config.max_priority,
            ),
        }
    }

    pub fn status_store(&self, config: &QueueConfig) -> StatusStore {
        match self {
            Backend::Memory => {
                StatusStore::new(Arc::new(MemoryStatusBackend::new()), config.status_ttl)
            }
            Backend::Redis(conn) => StatusStore::new(
                Arc::new(RedisStatusBackend::new(conn.clone())),
                config.status_ttl,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_no_url_selects_memory() {
        let backend = Backend::connect(&QueueConfig::default()).await;
        assert!(!backend.is_distributed());
        assert_eq!(backend.name(), "memory");
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back_to_memory() {
        let config = QueueConfig::default()
            .with_redis_url("redis://127.0.0.1:1")
            .with_connect_timeout(Duration::from_millis(500));

        let backend = Backend::connect(&config).await;
        assert!(!backend.is_distributed());

        let queue = backend.task_queue(&config);
        queue.enqueue("j1", "audio", 5).await;
        queue.enqueue("j2", "audio", 9).await;
        assert_eq!(queue.dequeue("audio").await.as_deref(), Some("j2"));
        assert_eq!(queue.dequeue("audio").await.as_deref(), Some("j1"));

        let store = backend.status_store(&config);
        assert!(store.ping().await);
        assert_eq!(store.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_invalid_url_falls_back_to_memory() {
        let config = QueueConfig::default().with_redis_url("not-a-redis-url");
        let backend = Backend::connect(&config).await;
        assert!(!backend.is_distributed());
    }
}
