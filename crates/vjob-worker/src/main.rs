//! Media job dispatcher binary.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vjob_queue::{Backend, QueueConfig, RedisStreamTransport, TransportConfig};
use vjob_worker::{
    metrics, retry_async, Dispatcher, HttpProcessor, HttpWebhookNotifier, RetryConfig,
    RetryResult, WorkerConfig, WorkerError,
};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for rediss:// and HTTPS webhooks)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    if let Err(e) = run().await {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

/// Colored output for dev, JSON for production.
fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vjob_worker=info,vjob_queue=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();
    info!("Starting vjob-worker: {:?}", config);

    if let Some(port) = config.metrics_port {
        metrics::init_metrics(port)?;
        info!("Prometheus metrics listening on port {}", port);
    }

    let queue_config = QueueConfig::from_env();
    let backend = Backend::connect(&queue_config).await;
    let queue = Arc::new(backend.task_queue(&queue_config));
    let status = Arc::new(backend.status_store(&queue_config));

    let transport = connect_transport(&config).await?;

    let processor = HttpProcessor::new(&config.media_processor_url, config.processor_timeout)
        .context("Failed to build processor client")?;
    let webhook = HttpWebhookNotifier::new(config.webhook_timeout)
        .context("Failed to build webhook client")?;

    let dispatcher = Dispatcher::new(
        config.family,
        Arc::new(transport),
        queue,
        status,
        Arc::new(processor),
        Arc::new(webhook),
    )
    .with_receive_block(config.receive_block)
    .with_reclaim(config.claim_interval, config.claim_min_idle);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

    tokio::select! {
        finished = &mut handle => {
            // Loop ended on its own; only a startup error gets here
            finished??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal, finishing current job");
            let _ = shutdown_tx.send(true);
        }
    }

    handle.await??;
    Ok(())
}

/// Connect to the transport with bounded exponential backoff.
async fn connect_transport(config: &WorkerConfig) -> Result<RedisStreamTransport, WorkerError> {
    let transport_config = TransportConfig::from_env(config.consumer_name.clone());
    let retry = RetryConfig::new("transport connection")
        .with_max_retries(config.connect_attempts.saturating_sub(1))
        .with_base_delay(config.connect_base_delay)
        .with_max_delay(config.connect_max_delay);

    match retry_async(&retry, || RedisStreamTransport::connect(&transport_config)).await {
        RetryResult::Success(transport) => Ok(transport),
        RetryResult::Failed { error, attempts } => Err(WorkerError::transport_unavailable(
            format!("giving up after {} attempts: {}", attempts, error),
        )),
    }
}
