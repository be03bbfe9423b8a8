//! Notification bus abstraction and the in-process broadcast implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// One delivered message.
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
    acker: Option<Box<dyn FnOnce() + Send>>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            acker: None,
        }
    }

    /// Attach the transport's acknowledgement callback.
    pub fn with_ack(mut self, ack: impl FnOnce() + Send + 'static) -> Self {
        self.acker = Some(Box::new(ack));
        self
    }

    /// Acknowledge delivery. Later calls are no-ops.
    pub fn ack(&mut self) {
        if let Some(ack) = self.acker.take() {
            ack();
        }
    }
}

impl std::fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMessage")
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .field("acked", &self.acker.is_none())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Nothing arrived within the poll window. Not a failure.
    #[error("timed out waiting for a message")]
    Timeout,

    #[error("subscriber fell behind and lost {0} messages")]
    Lagged(u64),

    #[error("disconnected: {0}")]
    Disconnected(String),
}

/// An open subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `timeout` for the next message on the subscribed topic.
    async fn next_message(&mut self, timeout: Duration) -> Result<BusMessage, BusError>;
}

/// A publish/subscribe transport.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, BusError>;
}

/// AMQP-style topic match: words separated by `.`, `*` matches exactly one
/// word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    fn matches(pattern: &[&str], topic: &[&str]) -> bool {
        match pattern.split_first() {
            None => topic.is_empty(),
            Some((&"#", rest)) => (0..=topic.len()).any(|skip| matches(rest, &topic[skip..])),
            Some((&word, rest)) => match topic.split_first() {
                Some((&head, tail)) => (word == "*" || word == head) && matches(rest, tail),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    matches(&pattern, &topic)
}

#[derive(Debug, Clone)]
struct Published {
    topic: String,
    payload: Value,
}

/// In-process bus over a tokio broadcast channel.
///
/// Messages published while nobody is subscribed are dropped, and a
/// subscriber that falls more than `capacity` messages behind gets
/// [`BusError::Lagged`].
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<Published>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a message. Returns the number of subscribers it reached.
    pub fn publish(&self, topic: impl Into<String>, payload: Value) -> usize {
        self.tx
            .send(Published {
                topic: topic.into(),
                payload,
            })
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl NotificationBus for BroadcastBus {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, BusError> {
        Ok(Box::new(BroadcastSubscription {
            pattern: topic.to_string(),
            rx: self.tx.subscribe(),
        }))
    }
}

struct BroadcastSubscription {
    pattern: String,
    rx: broadcast::Receiver<Published>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    async fn next_message(&mut self, timeout: Duration) -> Result<BusMessage, BusError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Err(BusError::Timeout),
                Ok(Ok(published)) => {
                    if topic_matches(&self.pattern, &published.topic) {
                        return Ok(BusMessage::new(published.topic, published.payload));
                    }
                }
                Ok(Err(RecvError::Lagged(n))) => return Err(BusError::Lagged(n)),
                Ok(Err(RecvError::Closed)) => {
                    return Err(BusError::Disconnected("bus closed".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("change.#", "change.mozilla-central"));
        assert!(topic_matches("change.#", "change"));
        assert!(topic_matches("change.#", "change.a.b.c"));
        assert!(!topic_matches("change.#", "build.mozilla-central"));
        assert!(topic_matches("change.*", "change.try"));
        assert!(!topic_matches("change.*", "change.try.extra"));
        assert!(!topic_matches("change.*", "change"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.try", "change.try"));
        assert!(topic_matches("change.try", "change.try"));
        assert!(!topic_matches("change.try", "change.trybot"));
    }

    #[test]
    fn test_ack_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut message = BusMessage::new("change.try", json!({})).with_ack(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        message.ack();
        message.ack();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_filters_topics() {
        let bus = BroadcastBus::new(16);
        let mut sub = bus.subscribe("change.#").await.unwrap();

        bus.publish("build.finished", json!({"n": 1}));
        bus.publish("change.try", json!({"n": 2}));

        let message = sub.next_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(message.topic, "change.try");
        assert_eq!(message.payload["n"], 2);
    }

    #[tokio::test]
    async fn test_broadcast_times_out() {
        let bus = BroadcastBus::new(16);
        let mut sub = bus.subscribe("change.#").await.unwrap();

        let result = sub.next_message(Duration::from_millis(10)).await;
        assert_eq!(result.unwrap_err(), BusError::Timeout);
    }

    #[tokio::test]
    async fn test_broadcast_reports_lag() {
        let bus = BroadcastBus::new(2);
        let mut sub = bus.subscribe("#").await.unwrap();

        for n in 0..5 {
            bus.publish("change.try", json!({ "n": n }));
        }

        let result = sub.next_message(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BusError::Lagged(_))));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = BroadcastBus::default();
        assert_eq!(bus.publish("change.try", json!({})), 0);
        assert_eq!(bus.subscriber_count(), 0);

        let _sub = bus.subscribe("#").await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish("change.try", json!({})), 1);
    }
}
