//! Echo subscription: readings coming back from the broker.
//!
//! The broker delivers messages on its own task, so [`EchoSink`] only queues
//! them on a bounded channel. [`EchoListener`] drains that channel, stores
//! each reading in the cache and releases the request waiting for it.

pub mod registry;

pub use registry::{EchoOutcome, EchoRegistry, EchoStats, EchoTicket, EchoWaitError};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerMessage, MessageHandler};
use crate::cache::LatestValueCache;
use crate::reading::EchoEnvelope;

/// Subscription handler that forwards messages to the listener.
pub struct EchoSink {
    tx: mpsc::Sender<BrokerMessage>,
    dropped: AtomicU64,
}

impl EchoSink {
    /// Sink plus the receiving end for [`EchoListener::spawn`].
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<BrokerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
        });
        (sink, rx)
    }

    /// Messages discarded because the listener fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MessageHandler for EchoSink {
    fn on_message(&self, message: BrokerMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %message.topic, "echo queue full, dropping message");
            }
            Err(TrySendError::Closed(message)) => {
                debug!(topic = %message.topic, "echo listener stopped, dropping message");
            }
        }
    }
}

pub struct EchoListener {
    cache: LatestValueCache,
    registry: Arc<EchoRegistry>,
}

impl EchoListener {
    pub fn new(cache: LatestValueCache, registry: Arc<EchoRegistry>) -> Self {
        Self { cache, registry }
    }

    /// Process messages one at a time until the channel closes or `cancel`
    /// fires.
    pub fn spawn(
        self,
        mut rx: mpsc::Receiver<BrokerMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("echo listener cancelled");
                        break;
                    }
                    message = rx.recv() => match message {
                        Some(message) => self.handle(message).await,
                        None => break,
                    },
                }
            }
            info!("echo listener stopped");
        })
    }

    /// Store one echoed reading and hand the outcome to its waiter.
    pub async fn handle(&self, message: BrokerMessage) {
        let (reading, correlation_id) = match EchoEnvelope::decode(&message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "dropping undecodable echo");
                return;
            }
        };

        let outcome = match self.cache.set(&reading).await {
            Ok(()) => {
                info!(
                    speed = reading.speed(),
                    correlation_id = ?correlation_id,
                    "data stored successfully in cache"
                );
                Ok(reading)
            }
            Err(e) => {
                error!(
                    speed = reading.speed(),
                    correlation_id = ?correlation_id,
                    error = %e,
                    "failed to store echoed reading"
                );
                Err(e)
            }
        };

        self.registry.complete(correlation_id, outcome);
    }
}
