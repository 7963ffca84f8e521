//! In-process transport.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Delivery, Transport};
use crate::error::{QueueError, QueueResult};

/// A rejected message kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub topic: String,
    pub delivery: Delivery,
    pub reason: String,
}

struct InFlight {
    topic: String,
    delivery: Delivery,
    delivered_at: Instant,
}

#[derive(Default)]
struct TransportState {
    /// topic -> priority -> FIFO of messages
    ready: HashMap<String, BTreeMap<u8, VecDeque<Delivery>>>,
    /// message id -> delivered but unacknowledged message
    in_flight: HashMap<String, InFlight>,
    dead_letters: Vec<DeadLetter>,
}

/// Per-topic priority transport for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<TransportState>,
    notify: Notify,
    next_id: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages rejected so far, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_take(&self, topic: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let delivery = state
            .ready
            .get_mut(topic)?
            .values_mut()
            .rev()
            .find_map(VecDeque::pop_front)?;

        state.in_flight.insert(
            delivery.id.clone(),
            InFlight {
                topic: topic.to_string(),
                delivery: delivery.clone(),
                delivered_at: Instant::now(),
            },
        );
        Some(delivery)
    }

    /// Drop a delivery from the in-flight set, returning the still-held lock.
    fn settle(&self, topic: &str, delivery: &Delivery) -> QueueResult<MutexGuard<'_, TransportState>> {
        let mut state = self.lock();
        match state.in_flight.remove(&delivery.id) {
            Some(held) if held.topic == topic => Ok(state),
            Some(held) => {
                state.in_flight.insert(delivery.id.clone(), held);
                Err(QueueError::transport_closed(format!(
                    "message {} was not delivered on {}",
                    delivery.id, topic
                )))
            }
            None => Err(QueueError::transport_closed(format!(
                "message {} is not in flight",
                delivery.id
            ))),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn prepare(&self, topic: &str) -> QueueResult<()> {
        self.lock().ready.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], priority: u8) -> QueueResult<String> {
        let id = format!("{}-0", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock()
            .ready
            .entry(topic.to_string())
            .or_default()
            .entry(priority)
            .or_default()
            .push_back(Delivery::new(id.clone(), payload).with_priority(priority));
        self.notify.notify_waiters();

        debug!(topic, priority, message_id = %id, "Published message");
        Ok(id)
    }

    async fn receive(&self, topic: &str, block: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so a publish in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(topic) {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn reclaim(
        &self,
        topic: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut state = self.lock();
        let now = Instant::now();

        let mut stale: Vec<&mut InFlight> = state
            .in_flight
            .values_mut()
            .filter(|held| held.topic == topic && now.duration_since(held.delivered_at) >= min_idle)
            .collect();
        stale.sort_by_key(|held| held.delivered_at);

        let claimed: Vec<Delivery> = stale
            .into_iter()
            .take(count)
            .map(|held| {
                held.delivered_at = now;
                held.delivery.clone()
            })
            .collect();

        if !claimed.is_empty() {
            info!(topic, count = claimed.len(), "Reclaimed idle messages");
        }
        Ok(claimed)
    }

    async fn ack(&self, topic: &str, delivery: &Delivery) -> QueueResult<()> {
        self.settle(topic, delivery)?;
        Ok(())
    }

    async fn reject(&self, topic: &str, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        let mut state = self.settle(topic, delivery)?;
        state.dead_letters.push(DeadLetter {
            topic: topic.to_string(),
            delivery: delivery.clone(),
            reason: reason.to_string(),
        });

        warn!(topic, message_id = %delivery.id, "Moved message to dead letters: {}", reason);
        Ok(())
    }

    async fn pending(&self, topic: &str) -> QueueResult<u64> {
        let state = self.lock();
        let ready: usize = state
            .ready
            .get(topic)
            .map(|levels| levels.values().map(VecDeque::len).sum())
            .unwrap_or(0);
        let in_flight = state.in_flight.values().filter(|held| held.topic == topic).count();
        Ok((ready + in_flight) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TOPIC: &str = "audio_processing";

    async fn next(transport: &MemoryTransport, topic: &str) -> Option<Delivery> {
        transport
            .receive(topic, Duration::from_millis(10))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let transport = MemoryTransport::new();
        transport.prepare(TOPIC).await.unwrap();

        transport.publish(TOPIC, b"first", 1).await.unwrap();
        transport.publish(TOPIC, b"second", 1).await.unwrap();
        assert_eq!(transport.pending(TOPIC).await.unwrap(), 2);

        let first = next(&transport, TOPIC).await.unwrap();
        assert_eq!(first.payload, b"first");
        // Delivered but unacknowledged messages still count as pending
        assert_eq!(transport.pending(TOPIC).await.unwrap(), 2);

        transport.ack(TOPIC, &first).await.unwrap();
        assert_eq!(transport.pending(TOPIC).await.unwrap(), 1);
        assert!(transport.ack(TOPIC, &first).await.is_err());
    }

    #[tokio::test]
    async fn test_higher_priority_is_delivered_first() {
        let transport = MemoryTransport::new();
        transport.publish(TOPIC, b"backlog-1", 1).await.unwrap();
        transport.publish(TOPIC, b"backlog-2", 1).await.unwrap();
        transport.publish(TOPIC, b"urgent", 10).await.unwrap();

        let order: Vec<Vec<u8>> = [
            next(&transport, TOPIC).await.unwrap(),
            next(&transport, TOPIC).await.unwrap(),
            next(&transport, TOPIC).await.unwrap(),
        ]
        .into_iter()
        .map(|d| d.payload)
        .collect();

        assert_eq!(
            order,
            vec![b"urgent".to_vec(), b"backlog-1".to_vec(), b"backlog-2".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_topic() {
        let transport = MemoryTransport::new();
        let received = transport
            .receive("video_processing", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_blocked_receiver_wakes_on_publish() {
        let transport = Arc::new(MemoryTransport::new());

        let receiver = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.receive(TOPIC, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.publish(TOPIC, b"wake", 10).await.unwrap();

        let delivery = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.payload, b"wake");
        assert_eq!(delivery.priority, 10);
    }

    #[tokio::test]
    async fn test_reject_dead_letters_and_settles() {
        let transport = MemoryTransport::new();
        transport.publish(TOPIC, b"{not json", 1).await.unwrap();

        let delivery = next(&transport, TOPIC).await.unwrap();
        transport
            .reject(TOPIC, &delivery, "undecodable payload")
            .await
            .unwrap();

        assert_eq!(transport.pending(TOPIC).await.unwrap(), 0);
        let dead = transport.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].delivery.payload, b"{not json");
        assert_eq!(dead[0].reason, "undecodable payload");
    }

    #[tokio::test]
    async fn test_reclaim_returns_only_idle_unsettled_messages() {
        let transport = MemoryTransport::new();
        transport.publish(TOPIC, b"abandoned", 1).await.unwrap();
        transport.publish(TOPIC, b"settled", 1).await.unwrap();

        let abandoned = next(&transport, TOPIC).await.unwrap();
        let settled = next(&transport, TOPIC).await.unwrap();
        transport.ack(TOPIC, &settled).await.unwrap();

        // Not idle long enough yet
        let early = transport
            .reclaim(TOPIC, Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let claimed = transport
            .reclaim(TOPIC, Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert_eq!(claimed, vec![abandoned.clone()]);
        assert!(transport
            .reclaim("video_processing", Duration::ZERO, 10)
            .await
            .unwrap()
            .is_empty());

        // A reclaimed message is settled like any other delivery
        transport.ack(TOPIC, &claimed[0]).await.unwrap();
        assert_eq!(transport.pending(TOPIC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let transport = MemoryTransport::new();
        transport.publish("video_processing", b"v", 1).await.unwrap();

        assert!(next(&transport, TOPIC).await.is_none());
        assert!(next(&transport, "video_processing").await.is_some());
    }
}
