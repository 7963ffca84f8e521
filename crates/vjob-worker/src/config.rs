//! Worker configuration.

use std::time::Duration;

use uuid::Uuid;
use vjob_models::JobFamily;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job family consumed by this process
    pub family: JobFamily,
    /// Name of this consumer within the transport consumer group
    pub consumer_name: String,
    /// How long a single transport receive blocks
    pub receive_block: Duration,
    /// How often to look for messages abandoned by crashed consumers
    pub claim_interval: Duration,
    /// Minimum idle time before an unacknowledged message is taken over.
    /// Must exceed `processor_timeout` or a live job can run twice.
    pub claim_min_idle: Duration,
    /// Transport connection attempts before giving up
    pub connect_attempts: u32,
    /// First backoff delay between connection attempts (doubles each attempt)
    pub connect_base_delay: Duration,
    /// Upper bound on the backoff delay
    pub connect_max_delay: Duration,
    /// Base URL of the media-processing service
    pub media_processor_url: String,
    /// Timeout for a single processor request
    pub processor_timeout: Duration,
    /// Timeout for webhook delivery
    pub webhook_timeout: Duration,
    /// Prometheus exporter port; disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            family: JobFamily::Audio,
            consumer_name: format!("worker-{}", Uuid::new_v4()),
            receive_block: Duration::from_millis(1000),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(3900), // processor timeout + 5 minutes
            connect_attempts: 10,
            connect_base_delay: Duration::from_secs(1),
            connect_max_delay: Duration::from_secs(60),
            media_processor_url: "http://localhost:8080".to_string(),
            processor_timeout: Duration::from_secs(3600), // 1 hour
            webhook_timeout: Duration::from_secs(10),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            family: std::env::var("WORKER_FAMILY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.family),
            consumer_name: std::env::var("WORKER_CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            receive_block: Duration::from_millis(
                std::env::var("WORKER_RECEIVE_BLOCK_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|ms: &u64| *ms > 0)
                    .unwrap_or(1000),
            ),
            claim_interval: Duration::from_secs(
                std::env::var("WORKER_CLAIM_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|secs: &u64| *secs > 0)
                    .unwrap_or(30),
            ),
            claim_min_idle: Duration::from_secs(
                std::env::var("WORKER_CLAIM_MIN_IDLE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3900),
            ),
            connect_attempts: std::env::var("TRANSPORT_CONNECT_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(10),
            connect_base_delay: Duration::from_secs(
                std::env::var("TRANSPORT_CONNECT_BASE_DELAY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1),
            ),
            connect_max_delay: Duration::from_secs(
                std::env::var("TRANSPORT_CONNECT_MAX_DELAY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            media_processor_url: std::env::var("MEDIA_PROCESSOR_URL")
                .unwrap_or(defaults.media_processor_url),
            processor_timeout: Duration::from_secs(
                std::env::var("PROCESSOR_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            webhook_timeout: Duration::from_secs(
                std::env::var("WEBHOOK_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }
}
