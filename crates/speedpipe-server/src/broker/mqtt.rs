//! MQTT broker client on top of rumqttc.
//!
//! A single event-loop task owns the connection. It dispatches incoming
//! publishes to the registered handlers, resolves publish and subscribe
//! acknowledgements, and reconnects on its own after a failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::acks::{AckResult, AckTracker};
use super::{BrokerError, BrokerMessage, MessageBroker, MessageHandler, Subscriptions};
use crate::config::MqttConfig;

const DEFAULT_PORT: u16 = 1883;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Host and port parsed from a `tcp://` or `mqtt://` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn parse(address: &str) -> Result<Self, BrokerError> {
        let url = url::Url::parse(address)
            .map_err(|e| BrokerError::InvalidAddress(format!("{address}: {e}")))?;
        if !matches!(url.scheme(), "tcp" | "mqtt") {
            return Err(BrokerError::InvalidAddress(format!(
                "{address}: unsupported scheme '{}', expected tcp or mqtt",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BrokerError::InvalidAddress(format!("{address}: missing host")))?;
        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

pub fn qos_from_level(level: u8) -> Result<QoS, BrokerError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BrokerError::Client(format!("invalid qos level {other}"))),
    }
}

/// State shared between the client front-end and the event-loop task.
struct Shared {
    qos: QoS,
    publishes: AckTracker,
    subscribes: AckTracker,
    subscriptions: Subscriptions,
}

pub struct MqttBroker {
    client: AsyncClient,
    shared: Arc<Shared>,
    connected: watch::Receiver<bool>,
    ack_timeout: Duration,
    subscribe_timeout: Duration,
    event_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttBroker {
    /// Connect to the configured broker and wait for the first CONNACK.
    ///
    /// The event loop keeps running until `cancel` fires or
    /// [`MessageBroker::disconnect`] is called.
    pub async fn connect(
        config: &MqttConfig,
        cancel: CancellationToken,
    ) -> Result<Self, BrokerError> {
        let address = BrokerAddress::parse(&config.broker)?;
        let qos = qos_from_level(config.qos)?;

        let mut opts = MqttOptions::new(&config.client_id, &address.host, address.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        opts.set_clean_session(true);

        let (client, event_loop) = AsyncClient::new(opts, config.channel_capacity);
        let shared = Arc::new(Shared {
            qos,
            publishes: AckTracker::new("publish", true),
            subscribes: AckTracker::new("subscribe", false),
            subscriptions: Subscriptions::default(),
        });
        let (connected_tx, mut connected_rx) = watch::channel(false);

        tracing::info!(
            host = %address.host,
            port = address.port,
            client_id = %config.client_id,
            qos = config.qos,
            "Connecting to MQTT broker"
        );

        let event_task = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            Arc::clone(&shared),
            connected_tx,
            cancel.clone(),
        ));

        match tokio::time::timeout(
            config.connect_timeout(),
            connected_rx.wait_for(|connected| *connected),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                event_task.abort();
                return Err(BrokerError::ConnectionLost(
                    "event loop stopped before connecting".into(),
                ));
            }
            Err(_) => {
                event_task.abort();
                return Err(BrokerError::ConnectionLost(format!(
                    "no CONNACK from {}:{} within {:?}",
                    address.host,
                    address.port,
                    config.connect_timeout()
                )));
            }
        }
        tracing::info!(host = %address.host, port = address.port, "✓ Connected to MQTT broker");

        Ok(Self {
            client,
            shared,
            connected: connected_rx,
            ack_timeout: config.ack_timeout(),
            subscribe_timeout: config.connect_timeout(),
            event_task: parking_lot::Mutex::new(Some(event_task)),
        })
    }

    async fn await_ack(
        rx: oneshot::Receiver<AckResult>,
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::ConnectionLost("event loop stopped".into())),
            Err(_) => Err(BrokerError::AckTimeout(timeout)),
        }
    }
}

#[async_trait]
impl MessageBroker for MqttBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let rx = self
            .shared
            .publishes
            .submit(|| {
                self.client
                    .try_publish(topic, self.shared.qos, false, payload)
            })
            .map_err(|e| BrokerError::Client(e.to_string()))?;
        Self::await_ack(rx, self.ack_timeout).await
    }

    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        self.shared.subscriptions.add(filter, handler);
        let submitted = self
            .shared
            .subscribes
            .submit(|| self.client.try_subscribe(filter, self.shared.qos));
        let rx = match submitted {
            Ok(rx) => rx,
            Err(e) => {
                self.shared.subscriptions.remove_last(filter);
                return Err(BrokerError::Client(e.to_string()));
            }
        };
        match Self::await_ack(rx, self.subscribe_timeout).await {
            Ok(()) => {
                tracing::info!(filter, "Subscribed to MQTT topic");
                Ok(())
            }
            Err(e) => {
                self.shared.subscriptions.remove_last(filter);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Client(e.to_string()));
        let handle = self.event_task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.subscribe_timeout, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("MQTT event loop did not stop in time; aborting");
                handle.abort();
            }
        }
        tracing::info!("Disconnected from MQTT broker");
        result
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let complete_on_write = shared.qos == QoS::AtMostOnce;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("MQTT loop cancelled");
                break;
            }
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ConnAck {
                session_present, ..
            }))) => {
                let was_connected = connected.send_replace(true);
                tracing::debug!(session_present, was_connected, "CONNACK received");
                if !session_present {
                    resubscribe(&client, &shared);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BrokerMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                let delivered = shared.subscriptions.dispatch(&message);
                if delivered == 0 {
                    tracing::debug!(topic = %message.topic, "message without a matching handler");
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if shared.qos == QoS::AtLeastOnce {
                    shared.publishes.acknowledge(ack.pkid, Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                shared.publishes.acknowledge(comp.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if rejected {
                    Err(BrokerError::Rejected("SUBACK returned failure".into()))
                } else {
                    Ok(())
                };
                shared.subscribes.acknowledge(ack.pkid, result);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                shared.publishes.on_written(pkid, complete_on_write);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.subscribes.on_written(pkid, false);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("DISCONNECT written");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let reason = e.to_string();
                if connected.send_replace(false) {
                    tracing::warn!(error = %reason, "MQTT connection lost");
                } else {
                    tracing::debug!(error = %reason, "MQTT connection attempt failed");
                }
                shared.publishes.fail_all(&reason);
                shared.subscribes.fail_all(&reason);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    connected.send_replace(false);
    shared.publishes.fail_all("MQTT event loop stopped");
    shared.subscribes.fail_all("MQTT event loop stopped");
}

/// Re-issue every registered filter on a fresh session.
///
/// Uses the non-blocking client calls: the request queue is drained by this
/// very loop, so it must never wait on it.
fn resubscribe(client: &AsyncClient, shared: &Shared) {
    for filter in shared.subscriptions.filters() {
        let submitted = shared
            .subscribes
            .submit_detached(|| client.try_subscribe(filter.as_str(), shared.qos));
        match submitted {
            Ok(()) => tracing::info!(filter = %filter, "Re-subscribing after reconnect"),
            Err(e) => tracing::warn!(filter = %filter, error = %e, "Re-subscribe failed"),
        }
    }
}
