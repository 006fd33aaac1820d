//! In-process pub/sub hub for pipeline events.
//!
//! Two topic kinds: per-device topics and a firehose that sees every event.
//! Publishing never blocks; each subscription is a bounded broadcast queue
//! and slow subscribers lose their oldest events rather than slowing anyone
//! else down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;
use vigil_domain::BusEvent;

/// Default bound for each subscriber queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Counters surfaced by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
    pub device_topics: usize,
}

pub struct EventBus {
    capacity: usize,
    firehose: broadcast::Sender<BusEvent>,
    devices: RwLock<HashMap<String, broadcast::Sender<BusEvent>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            capacity,
            firehose,
            devices: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish to the event's device topic (if anyone is listening) and to
    /// the firehose. Never blocks; send failures only mean nobody is
    /// subscribed.
    pub fn publish(&self, event: BusEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let device_id = event.device_id().to_string();
        let gone = {
            let topics = self.devices.read().expect("bus topic table poisoned");
            match topics.get(&device_id) {
                Some(sender) if sender.receiver_count() > 0 => {
                    let _ = sender.send(event.clone());
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if gone {
            // Last subscriber left; garbage-collect the topic.
            let mut topics = self.devices.write().expect("bus topic table poisoned");
            if topics
                .get(&device_id)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                topics.remove(&device_id);
                debug!(device_id = %device_id, "removed idle device topic");
            }
        }

        let _ = self.firehose.send(event);
    }

    /// Subscribe to a single device's events.
    pub fn subscribe_device(&self, device_id: &str) -> broadcast::Receiver<BusEvent> {
        let mut topics = self.devices.write().expect("bus topic table poisoned");
        topics
            .entry(device_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to every event irrespective of device.
    pub fn subscribe_firehose(&self) -> broadcast::Receiver<BusEvent> {
        self.firehose.subscribe()
    }

    /// Record events a lagging subscriber lost. Called by the subscription
    /// gateway when it observes a lag.
    pub fn note_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            device_topics: self.devices.read().expect("bus topic table poisoned").len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::broadcast::error::RecvError;
    use vigil_domain::Point;

    fn metric_event(device_id: &str, seq: i64) -> BusEvent {
        BusEvent::MetricNew {
            device_id: device_id.to_string(),
            metric: Point {
                id: Some(seq),
                device_id: device_id.to_string(),
                ts: Utc::now(),
                temperature_c: 22.0,
                vibration_g: 0.1,
                humidity_pct: 40.0,
                voltage_v: 12.0,
            },
        }
    }

    fn point_id(event: &BusEvent) -> i64 {
        match event {
            BusEvent::MetricNew { metric, .. } => metric.id.unwrap(),
            _ => panic!("expected metric event"),
        }
    }

    #[tokio::test]
    async fn test_device_topic_receives_only_its_device() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_device("dev-1");

        bus.publish(metric_event("dev-1", 1));
        bus.publish(metric_event("dev-2", 2));
        bus.publish(metric_event("dev-1", 3));

        assert_eq!(point_id(&rx.recv().await.unwrap()), 1);
        assert_eq!(point_id(&rx.recv().await.unwrap()), 3);
    }

    #[tokio::test]
    async fn test_firehose_sees_everything_in_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_firehose();

        for seq in 0..5 {
            bus.publish(metric_event("dev-1", seq));
        }
        for seq in 0..5 {
            assert_eq!(point_id(&rx.recv().await.unwrap()), seq);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block_or_fail() {
        let bus = EventBus::default();
        bus.publish(metric_event("dev-1", 1));
        assert_eq!(bus.stats().published, 1);
    }

    #[tokio::test]
    async fn test_idle_device_topic_is_garbage_collected() {
        let bus = EventBus::default();
        let rx = bus.subscribe_device("dev-1");
        assert_eq!(bus.stats().device_topics, 1);

        drop(rx);
        bus.publish(metric_event("dev-1", 1));
        assert_eq!(bus.stats().device_topics, 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_stalling_fast_one() {
        let bus = std::sync::Arc::new(EventBus::new(8));
        let mut stalled = bus.subscribe_firehose();
        let mut fast = bus.subscribe_firehose();

        let total = 100i64;
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < total as usize {
                match fast.recv().await {
                    Ok(event) => seen.push(point_id(&event)),
                    Err(RecvError::Lagged(_)) => panic!("fast subscriber lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
            seen
        });

        for seq in 0..total {
            bus.publish(metric_event("dev-1", seq));
            // Publishing is non-blocking; yield so the consumer keeps up.
            tokio::task::yield_now().await;
        }

        let seen = collector.await.unwrap();
        assert_eq!(seen, (0..total).collect::<Vec<_>>());

        // The stalled subscriber lost its oldest events.
        match stalled.recv().await {
            Err(RecvError::Lagged(skipped)) => {
                assert!(skipped > 0);
                bus.note_dropped(skipped);
            }
            other => panic!("expected lag, got {:?}", other.map(|e| point_id(&e))),
        }
        assert!(bus.stats().dropped > 0);
    }
}
