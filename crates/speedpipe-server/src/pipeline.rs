//! Publish pipeline: publish a validated reading and wait for its echo.

use std::sync::Arc;
use std::time::Duration;

use speedpipe_api::{ApiError, TransactionId};
use tracing::{error, info, warn};

use crate::broker::{BrokerError, MessageBroker};
use crate::cache::CacheError;
use crate::config::ConfirmMode;
use crate::echo::{EchoRegistry, EchoTicket, EchoWaitError};
use crate::reading::{EchoEnvelope, Reading};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// The echo arrived but could not be stored.
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("no echo received within {0:?}")]
    EchoTimeout(Duration),
    #[error("echo listener stopped")]
    ListenerStopped,
}

impl From<EchoWaitError> for PipelineError {
    fn from(err: EchoWaitError) -> Self {
        match err {
            EchoWaitError::Timeout(after) => Self::EchoTimeout(after),
            EchoWaitError::Closed => Self::ListenerStopped,
            EchoWaitError::Cache(e) => Self::Cache(e),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Broker(_)
            | PipelineError::EchoTimeout(_)
            | PipelineError::ListenerStopped => {
                ApiError::broker(format!("Unable to send the speed data on the topic, err {err}"))
            }
            PipelineError::Cache(_) => {
                ApiError::cache(format!("Unable to store the speed data, err {err}"))
            }
        }
    }
}

/// Upper bounds for the two waits of a publish.
///
/// A publish never takes longer than `ack + echo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishTimeouts {
    /// Broker acknowledgement of the publish
    pub ack: Duration,
    /// Echo stored after the acknowledgement
    pub echo: Duration,
}

impl PublishTimeouts {
    pub fn total(&self) -> Duration {
        self.ack.saturating_add(self.echo)
    }
}

pub struct PublishPipeline {
    broker: Arc<dyn MessageBroker>,
    registry: Arc<EchoRegistry>,
    topic: String,
    confirm: ConfirmMode,
    timeouts: PublishTimeouts,
}

impl PublishPipeline {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        registry: Arc<EchoRegistry>,
        topic: impl Into<String>,
        confirm: ConfirmMode,
        timeouts: PublishTimeouts,
    ) -> Self {
        Self {
            broker,
            registry,
            topic: topic.into(),
            confirm,
            timeouts,
        }
    }

    pub fn confirm_mode(&self) -> ConfirmMode {
        self.confirm
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<EchoRegistry> {
        &self.registry
    }

    /// Publish `reading` and, unless confirmation is off, wait until an echo
    /// has been stored. Bounded by [`PublishTimeouts::total`].
    ///
    /// Returns the reading that was confirmed. In `any` mode it may belong to
    /// a different request; in `none` mode it is `reading` itself.
    pub async fn publish(
        &self,
        reading: &Reading,
        transaction_id: &TransactionId,
    ) -> Result<Reading, PipelineError> {
        // Register first so the echo cannot arrive before its waiter.
        let ticket: Option<EchoTicket> = match self.confirm {
            ConfirmMode::Correlated => Some(self.registry.register()),
            ConfirmMode::Any => Some(self.registry.register_any()),
            ConfirmMode::None => None,
        };
        let correlation_id = ticket.as_ref().and_then(EchoTicket::correlation_id);

        let payload = EchoEnvelope::new(*reading, correlation_id)
            .encode()
            .map_err(CacheError::from)?;

        // Ack wait is bounded here whatever the broker implementation does.
        let published = tokio::time::timeout(
            self.timeouts.ack,
            self.broker.publish(&self.topic, payload),
        )
        .await
        .unwrap_or(Err(BrokerError::AckTimeout(self.timeouts.ack)));
        if let Err(e) = published {
            error!(
                transaction_id = %transaction_id,
                topic = %self.topic,
                error = %e,
                "unable to publish the message on the topic"
            );
            return Err(e.into());
        }
        info!(
            transaction_id = %transaction_id,
            topic = %self.topic,
            speed = reading.speed(),
            correlation_id = ?correlation_id,
            "successfully published the message on the topic"
        );

        let Some(ticket) = ticket else {
            return Ok(*reading);
        };

        match ticket.wait(self.timeouts.echo).await {
            Ok(stored) => {
                info!(
                    transaction_id = %transaction_id,
                    speed = stored.speed(),
                    "echo stored"
                );
                Ok(stored)
            }
            Err(e) => {
                warn!(
                    transaction_id = %transaction_id,
                    correlation_id = ?correlation_id,
                    error = %e,
                    "echo confirmation failed"
                );
                Err(e.into())
            }
        }
    }
}
