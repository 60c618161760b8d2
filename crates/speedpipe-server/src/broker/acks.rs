//! Matching client requests to broker acknowledgements.
//!
//! The MQTT client assigns packet ids only when a packet is written, and it
//! writes requests in the order they were queued. A tracker therefore keeps
//! one FIFO slot per queued request, binds the front slot to a packet id when
//! the client reports the write, and resolves it when the matching ack
//! arrives. Every queued request consumes exactly one slot, even when its
//! waiter is gone, so the queue never drifts out of step with the client.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::BrokerError;

pub(crate) type AckResult = Result<(), BrokerError>;

#[derive(Default)]
struct TrackerState {
    /// Queued to the client, not written yet. `None` when nobody waits.
    queued: VecDeque<Option<oneshot::Sender<AckResult>>>,
    /// Written, waiting for the broker's ack.
    in_flight: HashMap<u16, oneshot::Sender<AckResult>>,
    /// Packet ids failed on connection loss that the client will write again
    /// after reconnecting. Their writes must not consume a queued slot.
    replays: HashSet<u16>,
}

pub(crate) struct AckTracker {
    kind: &'static str,
    replays_on_reconnect: bool,
    state: Mutex<TrackerState>,
}

impl AckTracker {
    pub(crate) fn new(kind: &'static str, replays_on_reconnect: bool) -> Self {
        Self {
            kind,
            replays_on_reconnect,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Reserve a slot and hand the request to the client in one step.
    ///
    /// `send` runs under the tracker lock so slots stay in the order the
    /// client received the requests. It must not block.
    pub(crate) fn submit<E>(
        &self,
        send: impl FnOnce() -> Result<(), E>,
    ) -> Result<oneshot::Receiver<AckResult>, E> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        send()?;
        state.queued.push_back(Some(tx));
        Ok(rx)
    }

    /// Like [`AckTracker::submit`] for requests nobody waits on.
    pub(crate) fn submit_detached<E>(&self, send: impl FnOnce() -> Result<(), E>) -> Result<(), E> {
        let mut state = self.state.lock();
        send()?;
        state.queued.push_back(None);
        Ok(())
    }

    /// The client wrote the front request with packet id `pkid`.
    ///
    /// With `complete_now` (QoS 0) the waiter is resolved immediately;
    /// otherwise it waits for [`AckTracker::acknowledge`].
    pub(crate) fn on_written(&self, pkid: u16, complete_now: bool) {
        let mut state = self.state.lock();
        if state.replays.remove(&pkid) {
            tracing::debug!(kind = self.kind, pkid, "replayed packet written");
            return;
        }
        state.replays.clear();
        let Some(slot) = state.queued.pop_front() else {
            tracing::debug!(kind = self.kind, pkid, "write without a queued request");
            return;
        };
        let Some(tx) = slot else { return };
        if complete_now || pkid == 0 {
            let _ = tx.send(Ok(()));
        } else {
            state.in_flight.insert(pkid, tx);
        }
    }

    /// The broker acknowledged packet `pkid`.
    pub(crate) fn acknowledge(&self, pkid: u16, result: AckResult) {
        let waiter = self.state.lock().in_flight.remove(&pkid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::warn!(kind = self.kind, pkid, error = %e, "unclaimed negative ack");
                }
            }
        }
    }

    /// Fail every waiter after the connection dropped.
    ///
    /// Queued slots stay in place (their requests are still in the client's
    /// queue and will be written later) but their waiters are released.
    pub(crate) fn fail_all(&self, reason: &str) {
        let mut state = self.state.lock();
        let mut failed = 0usize;
        let in_flight: Vec<(u16, oneshot::Sender<AckResult>)> = state.in_flight.drain().collect();
        for (pkid, tx) in in_flight {
            if self.replays_on_reconnect {
                state.replays.insert(pkid);
            }
            let _ = tx.send(Err(BrokerError::ConnectionLost(reason.to_string())));
            failed += 1;
        }
        for slot in state.queued.iter_mut() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Err(BrokerError::ConnectionLost(reason.to_string())));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::warn!(kind = self.kind, failed, "failed pending requests after connection loss");
        }
    }

    #[cfg(test)]
    fn pending(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.queued.len(), state.in_flight.len())
    }
}
