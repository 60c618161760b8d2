//! In-process loopback broker.
//!
//! Every publish is delivered to the matching handlers before `publish`
//! returns. Used by tests and by `mqtt.backend = "memory"`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;

use super::{BrokerError, BrokerMessage, MessageBroker, MessageHandler, Subscriptions};

#[derive(Default)]
pub struct MemoryBroker {
    subscriptions: Subscriptions,
    published: AtomicU64,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages accepted so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ConnectionLost("broker disconnected".into()));
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        let delivered = self.subscriptions.dispatch(&BrokerMessage {
            topic: topic.to_string(),
            payload,
        });
        tracing::trace!(topic, delivered, "memory broker publish");
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ConnectionLost("broker disconnected".into()));
        }
        self.subscriptions.add(filter, handler);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn loops_publishes_back_to_subscribers() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        broker
            .subscribe(
                "speed_topic",
                Arc::new(move |msg: BrokerMessage| sink.lock().push(msg.payload)),
            )
            .await
            .unwrap();

        broker.publish("speed_topic", b"a".to_vec()).await.unwrap();
        broker.publish("elsewhere", b"b".to_vec()).await.unwrap();

        assert_eq!(*seen.lock(), vec![b"a".to_vec()]);
        assert_eq!(broker.published(), 2);
    }

    #[tokio::test]
    async fn publish_after_disconnect_fails() {
        let broker = MemoryBroker::new();
        broker.disconnect().await.unwrap();
        assert!(matches!(
            broker.publish("t", vec![]).await,
            Err(BrokerError::ConnectionLost(_))
        ));
    }
}
