//! Queue and status store configuration.

use std::time::Duration;

use vjob_models::MAX_PRIORITY;

/// Retention window for status records (7 days).
pub const JOB_STATUS_TTL_SECS: u64 = 604_800;

/// Backend configuration shared by the task queue and the status store.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL for the distributed backend. `None` selects the in-memory backend.
    pub redis_url: Option<String>,
    /// Timeout for establishing the distributed backend connection
    pub connect_timeout: Duration,
    /// Highest priority level; priorities are clamped into [1, max_priority]
    pub max_priority: u8,
    /// Time-to-live applied on every status write
    pub status_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            connect_timeout: Duration::from_secs(5),
            max_priority: MAX_PRIORITY,
            status_ttl: Duration::from_secs(JOB_STATUS_TTL_SECS),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            connect_timeout: Duration::from_secs(
                std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            max_priority: std::env::var("QUEUE_MAX_PRIORITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|p: &u8| *p >= 1)
                .unwrap_or(MAX_PRIORITY),
            status_ttl: Duration::from_secs(
                std::env::var("JOB_STATUS_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(JOB_STATUS_TTL_SECS),
            ),
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Transport (Redis Streams) configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Redis URL hosting the streams
    pub url: String,
    /// Consumer group shared by all dispatchers
    pub consumer_group: String,
    /// Name of this consumer within the group
    pub consumer_name: String,
    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,
    /// Highest message priority; one stream per level is read
    pub max_priority: u8,
}

impl TransportConfig {
    /// Create config from environment variables.
    pub fn from_env(consumer_name: impl Into<String>) -> Self {
        let url = std::env::var("TRANSPORT_URL")
            .or_else(|_| std::env::var("REDIS_URL"))
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());

        Self {
            url,
            consumer_group: std::env::var("TRANSPORT_CONSUMER_GROUP")
                .unwrap_or_else(|_| "vjob:workers".to_string()),
            consumer_name: consumer_name.into(),
            connect_timeout: Duration::from_secs(
                std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            max_priority: std::env::var("QUEUE_MAX_PRIORITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|p: &u8| *p >= 1)
                .unwrap_or(MAX_PRIORITY),
        }
    }
}
