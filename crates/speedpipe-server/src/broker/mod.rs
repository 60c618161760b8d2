//! Message broker client.
//!
//! One process-wide connection is shared by publishing and by the echo
//! subscription. [`MessageBroker`] is the seam: [`MqttBroker`] talks to a real
//! MQTT broker, [`MemoryBroker`] loops publishes back in-process.

mod acks;
pub mod memory;
pub mod mqtt;

pub use memory::MemoryBroker;
pub use mqtt::MqttBroker;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("broker did not acknowledge within {0:?}")]
    AckTimeout(Duration),
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("broker client error: {0}")]
    Client(String),
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Callback invoked once per received message.
///
/// Runs on the broker's delivery path, so implementations must not block.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: BrokerMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(BrokerMessage) + Send + Sync,
{
    fn on_message(&self, message: BrokerMessage) {
        self(message)
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish `payload` to `topic` and wait for the broker's acknowledgement.
    ///
    /// Never retries; the caller decides what to do with a failure.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Register `handler` for every message matching `filter` and wait until
    /// the broker confirms the subscription.
    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError>;

    /// Close the connection. Further publishes fail.
    async fn disconnect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Whether publishes can currently reach the broker.
    fn is_connected(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

/// Whether `topic` is matched by the subscription `filter`.
///
/// Supports the MQTT wildcards: `+` matches exactly one level, a trailing `#`
/// matches the parent level and everything below it. Topics starting with `$`
/// are never matched by a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    filter: String,
    handler: Arc<dyn MessageHandler>,
}

/// Registered handlers, shared by the broker front-end and its delivery task.
#[derive(Clone, Default)]
pub(crate) struct Subscriptions {
    inner: Arc<RwLock<Vec<Subscription>>>,
}

impl Subscriptions {
    pub(crate) fn add(&self, filter: &str, handler: Arc<dyn MessageHandler>) {
        self.inner.write().push(Subscription {
            filter: filter.to_string(),
            handler,
        });
    }

    pub(crate) fn remove_last(&self, filter: &str) {
        let mut subs = self.inner.write();
        if let Some(pos) = subs.iter().rposition(|s| s.filter == filter) {
            subs.remove(pos);
        }
    }

    /// Distinct filters, in first-registration order.
    pub(crate) fn filters(&self) -> Vec<String> {
        let subs = self.inner.read();
        let mut seen = HashSet::new();
        subs.iter()
            .filter(|s| seen.insert(s.filter.as_str()))
            .map(|s| s.filter.clone())
            .collect()
    }

    /// Hand `message` to every matching handler. Returns how many ran.
    pub(crate) fn dispatch(&self, message: &BrokerMessage) -> usize {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .inner
            .read()
            .iter()
            .filter(|s| topic_matches(&s.filter, &message.topic))
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in &handlers {
            handler.on_message(message.clone());
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn exact_topics_match() {
        assert!(topic_matches("speed_topic", "speed_topic"));
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/c"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("+/b", "a/b"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(topic_matches("a/+", "a/"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(!topic_matches("a/#", "b/c"));
        assert!(!topic_matches("a/#/c", "a/b/c"));
    }

    #[test]
    fn system_topics_hidden_from_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/uptime"));
        assert!(!topic_matches("+/uptime", "$SYS/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn dispatch_reaches_only_matching_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let subs = Subscriptions::default();
        let counter = Arc::clone(&hits);
        subs.add(
            "speed/+",
            Arc::new(move |_msg: BrokerMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        subs.add("other", Arc::new(|_msg: BrokerMessage| {}));

        let delivered = subs.dispatch(&BrokerMessage {
            topic: "speed/1".into(),
            payload: vec![],
        });
        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(subs.filters(), vec!["speed/+".to_string(), "other".to_string()]);

        subs.remove_last("other");
        assert_eq!(subs.filters(), vec!["speed/+".to_string()]);
    }

    #[test]
    fn repeated_filters_are_listed_once() {
        let subs = Subscriptions::default();
        subs.add("speed_topic", Arc::new(|_msg: BrokerMessage| {}));
        subs.add("other", Arc::new(|_msg: BrokerMessage| {}));
        subs.add("speed_topic", Arc::new(|_msg: BrokerMessage| {}));

        assert_eq!(
            subs.filters(),
            vec!["speed_topic".to_string(), "other".to_string()]
        );

        subs.remove_last("speed_topic");
        assert_eq!(
            subs.filters(),
            vec!["speed_topic".to_string(), "other".to_string()]
        );
    }
}
