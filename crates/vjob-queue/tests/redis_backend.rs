//! Redis backend integration tests.

use std::time::Duration;

use vjob_models::{JobId, JobKind, JobStatus};
use vjob_queue::{
    Backend, QueueConfig, RedisStreamTransport, StatusUpdate, Transport, TransportConfig,
};

fn redis_config() -> QueueConfig {
    dotenvy::dotenv().ok();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    QueueConfig::default().with_redis_url(url)
}

/// Random topic so runs do not see each other's entries.
fn scratch_topic() -> String {
    format!("test_{}", JobId::new())
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_backend_selected() {
    let backend = Backend::connect(&redis_config()).await;
    assert!(backend.is_distributed());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_priority_then_fifo_ordering() {
    let config = redis_config();
    let backend = Backend::connect(&config).await;
    let queue = backend.task_queue(&config);
    let topic = scratch_topic();

    let low = JobId::new().to_string();
    let high_a = JobId::new().to_string();
    let high_b = JobId::new().to_string();
    assert!(queue.enqueue(&low, &topic, 2).await);
    assert!(queue.enqueue(&high_a, &topic, 9).await);
    assert!(queue.enqueue(&high_b, &topic, 9).await);

    assert_eq!(queue.position(&high_a).await, Some(0));
    assert_eq!(queue.len(&topic).await, 3);

    let drained = queue.dequeue_batch(&topic, 5).await;
    assert_eq!(drained, vec![high_a, high_b, low]);
    assert!(queue.is_distributed());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_remove_and_duplicate_policy() {
    let config = redis_config();
    let queue = Backend::connect(&config).await.task_queue(&config);
    let topic = scratch_topic();
    let job_id = JobId::new().to_string();

    assert!(queue.enqueue(&job_id, &topic, 5).await);
    assert!(!queue.enqueue(&job_id, &topic, 5).await);

    assert!(queue.remove(&job_id).await);
    assert!(!queue.remove(&job_id).await);
    assert_eq!(queue.dequeue(&topic).await, None);
    assert_eq!(queue.position(&job_id).await, None);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_cancel_marker_and_resubmit() {
    let config = redis_config();
    let queue = Backend::connect(&config).await.task_queue(&config);
    let topic = scratch_topic();
    let job_id = JobId::new().to_string();

    assert!(queue.enqueue(&job_id, &topic, 5).await);
    assert!(queue.cancel(&job_id).await);
    assert!(!queue.cancel(&job_id).await);
    assert_eq!(queue.dequeue(&topic).await, None);
    assert!(queue.take_cancelled(&job_id).await);
    assert!(!queue.take_cancelled(&job_id).await);

    // Re-enqueueing after a cancel clears the marker
    assert!(queue.enqueue(&job_id, &topic, 5).await);
    assert!(queue.cancel(&job_id).await);
    assert!(queue.enqueue(&job_id, &topic, 5).await);
    assert!(!queue.take_cancelled(&job_id).await);
    assert_eq!(queue.dequeue(&topic).await, Some(job_id.clone()));

    // Popping frees the id for another enqueue
    assert!(queue.enqueue(&job_id, &topic, 5).await);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_status_round_trip() {
    let config = redis_config();
    let store = Backend::connect(&config).await.status_store(&config);
    let job_id = JobId::new().to_string();

    assert!(store.ping().await);

    store.update_progress(JobKind::VideoTrimJoin, &job_id, 42).await;
    let record = store
        .get_status(JobKind::VideoTrimJoin, &job_id)
        .await
        .expect("record should exist");
    assert_eq!(record.status, JobStatus::Processing);
    assert_eq!(record.progress, 42);

    store
        .set_status(
            JobKind::VideoTrimJoin,
            &job_id,
            StatusUpdate::completed(serde_json::json!({"output_url": "https://cdn.example.com/o.mp4"})),
        )
        .await;
    let record = store
        .get_status(JobKind::VideoTrimJoin, &job_id)
        .await
        .expect("record should exist");
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.progress, 100);

    store.delete(JobKind::VideoTrimJoin, &job_id).await;
    assert!(store.get_status(JobKind::VideoTrimJoin, &job_id).await.is_none());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stream_publish_receive_reject() {
    dotenvy::dotenv().ok();
    let config = TransportConfig::from_env("test-consumer");
    let transport = RedisStreamTransport::connect(&config)
        .await
        .expect("Failed to connect transport");
    let topic = scratch_topic();

    transport.prepare(&topic).await.expect("Failed to prepare");
    transport.prepare(&topic).await.expect("prepare should be idempotent");

    transport.publish(&topic, b"good", 1).await.expect("Failed to publish");
    transport.publish(&topic, b"{bad", 1).await.expect("Failed to publish");

    let good = transport
        .receive(&topic, Duration::from_millis(500))
        .await
        .expect("Failed to receive")
        .expect("message expected");
    assert_eq!(good.payload, b"good");
    transport.ack(&topic, &good).await.expect("Failed to ack");

    let bad = transport
        .receive(&topic, Duration::from_millis(500))
        .await
        .expect("Failed to receive")
        .expect("message expected");
    transport
        .reject(&topic, &bad, "undecodable payload")
        .await
        .expect("Failed to reject");

    assert_eq!(transport.pending(&topic).await.unwrap(), 0);
    assert_eq!(transport.dlq_len(&topic).await.unwrap(), 1);

    let idle = transport
        .receive(&topic, Duration::from_millis(100))
        .await
        .expect("Failed to receive");
    assert!(idle.is_none());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stream_priority_and_reclaim() {
    dotenvy::dotenv().ok();
    let config = TransportConfig::from_env("test-consumer-a");
    let transport = RedisStreamTransport::connect(&config)
        .await
        .expect("Failed to connect transport");
    let topic = scratch_topic();
    transport.prepare(&topic).await.expect("Failed to prepare");

    transport.publish(&topic, b"backlog", 1).await.expect("Failed to publish");
    transport.publish(&topic, b"urgent", 10).await.expect("Failed to publish");

    let first = transport
        .receive(&topic, Duration::from_millis(500))
        .await
        .expect("Failed to receive")
        .expect("message expected");
    assert_eq!(first.payload, b"urgent");
    assert_eq!(first.priority, 10);
    transport.ack(&topic, &first).await.expect("Failed to ack");

    // Received but never settled, as if the consumer died mid-job
    let abandoned = transport
        .receive(&topic, Duration::from_millis(500))
        .await
        .expect("Failed to receive")
        .expect("message expected");
    assert_eq!(abandoned.payload, b"backlog");

    let other = RedisStreamTransport::connect(&TransportConfig::from_env("test-consumer-b"))
        .await
        .expect("Failed to connect transport");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let claimed = other
        .reclaim(&topic, Duration::from_millis(20), 10)
        .await
        .expect("Failed to reclaim");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, abandoned.id);

    other.ack(&topic, &claimed[0]).await.expect("Failed to ack");
    assert_eq!(transport.pending(&topic).await.unwrap(), 0);
}
