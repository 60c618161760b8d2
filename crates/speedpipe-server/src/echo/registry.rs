//! Echo registry: hands each echoed reading to the request waiting for it.
//!
//! Flow:
//! 1. The publish pipeline calls `register()` (or `register_any()`) and gets
//!    an [`EchoTicket`] before it publishes.
//! 2. The echo listener stores the echo and calls `complete()` with the
//!    outcome of the cache write.
//! 3. The pipeline awaits the ticket with a timeout. Dropping the ticket
//!    unregisters the waiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::cache::CacheError;
use crate::reading::Reading;

/// What the listener reports to a waiter: the stored reading or the reason
/// the cache write failed.
pub type EchoOutcome = Result<Reading, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum EchoWaitError {
    #[error("no echo received within {0:?}")]
    Timeout(Duration),
    #[error("echo listener stopped")]
    Closed,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterKey {
    Correlated(Uuid),
    Any(u64),
}

struct AnyWaiter {
    id: u64,
    sender: oneshot::Sender<EchoOutcome>,
}

/// Statistics for the echo registry
#[derive(Debug, Default)]
pub struct EchoStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    /// Waiters dropped before their echo arrived (timeout or disconnect)
    pub total_abandoned: AtomicU64,
    /// Echoes that found nobody waiting
    pub total_unclaimed: AtomicU64,
}

#[derive(Default)]
pub struct EchoRegistry {
    correlated: DashMap<Uuid, oneshot::Sender<EchoOutcome>>,
    /// Waiters taking the next echo no correlated waiter claims, oldest first
    any: Mutex<VecDeque<AnyWaiter>>,
    next_any_id: AtomicU64,
    stats: EchoStats,
}

impl EchoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the echo carrying a fresh correlation id.
    pub fn register(self: &Arc<Self>) -> EchoTicket {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.correlated.insert(correlation_id, tx);
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %correlation_id, "Registered echo waiter");
        EchoTicket {
            registry: Arc::clone(self),
            key: WaiterKey::Correlated(correlation_id),
            receiver: Some(rx),
        }
    }

    /// Wait for the next echo not claimed by a correlated waiter.
    pub fn register_any(self: &Arc<Self>) -> EchoTicket {
        let id = self.next_any_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.any.lock().push_back(AnyWaiter { id, sender: tx });
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        EchoTicket {
            registry: Arc::clone(self),
            key: WaiterKey::Any(id),
            receiver: Some(rx),
        }
    }

    /// Deliver an echo outcome.
    ///
    /// The waiter registered for `correlation_id` wins; otherwise the oldest
    /// live "any" waiter gets it. Returns false when nobody took it.
    pub fn complete(&self, correlation_id: Option<Uuid>, outcome: EchoOutcome) -> bool {
        let mut outcome = outcome;
        if let Some(id) = correlation_id
            && let Some((_, sender)) = self.correlated.remove(&id)
        {
            match sender.send(outcome) {
                Ok(()) => {
                    self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                    debug!(correlation_id = %id, "Completed echo waiter");
                    return true;
                }
                // Receiver went away between lookup and send; offer it on.
                Err(returned) => outcome = returned,
            }
        }

        let mut any = self.any.lock();
        while let Some(waiter) = any.pop_front() {
            match waiter.sender.send(outcome) {
                Ok(()) => {
                    self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                    debug!(waiter = waiter.id, "Completed shared echo waiter");
                    return true;
                }
                Err(returned) => outcome = returned,
            }
        }
        drop(any);

        self.stats.total_unclaimed.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = ?correlation_id, "Echo had no waiter");
        false
    }

    fn forget(&self, key: WaiterKey) {
        let removed = match key {
            WaiterKey::Correlated(id) => self.correlated.remove(&id).is_some(),
            WaiterKey::Any(id) => {
                let mut any = self.any.lock();
                let before = any.len();
                any.retain(|w| w.id != id);
                any.len() != before
            }
        };
        if removed {
            self.stats.total_abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(waiter = ?key, "Echo waiter abandoned");
        }
    }

    /// Get number of currently waiting requests
    pub fn pending_count(&self) -> usize {
        self.correlated.len() + self.any.lock().len()
    }

    pub fn stats(&self) -> &EchoStats {
        &self.stats
    }
}

/// A registered wait for one echo. Dropping it unregisters the waiter; the
/// echo itself is still stored by the listener when it arrives.
pub struct EchoTicket {
    registry: Arc<EchoRegistry>,
    key: WaiterKey,
    receiver: Option<oneshot::Receiver<EchoOutcome>>,
}

impl EchoTicket {
    /// Correlation id to embed in the published payload, if any.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self.key {
            WaiterKey::Correlated(id) => Some(id),
            WaiterKey::Any(_) => None,
        }
    }

    /// Wait for the echo and the outcome of storing it.
    pub async fn wait(mut self, timeout: Duration) -> Result<Reading, EchoWaitError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(EchoWaitError::Closed);
        };
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(reading))) => Ok(reading),
            Ok(Ok(Err(e))) => Err(EchoWaitError::Cache(e)),
            Ok(Err(_)) => Err(EchoWaitError::Closed),
            Err(_) => Err(EchoWaitError::Timeout(timeout)),
        }
    }
}

impl Drop for EchoTicket {
    fn drop(&mut self) {
        self.registry.forget(self.key);
    }
}
