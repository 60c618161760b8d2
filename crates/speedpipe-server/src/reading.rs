//! Speed readings and their wire shapes.
//!
//! A [`Reading`] is always within `0..=100`; the only ways to build one are
//! [`Reading::new`] and the decoders in this module, which all check the
//! range.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MIN_SPEED: i64 = 0;
pub const MAX_SPEED: i64 = 100;

/// Input rejected before anything is published.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The body parsed but has no `speed` field.
    #[error("invalid request received")]
    MissingSpeed,
    /// The body is not JSON of the expected shape.
    #[error("invalid body")]
    InvalidBody,
    #[error("speed should be range between 0 and 100")]
    OutOfRange(i64),
}

/// A validated speed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reading {
    speed: i64,
}

impl Reading {
    pub fn new(speed: i64) -> Result<Self, ValidationError> {
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            return Err(ValidationError::OutOfRange(speed));
        }
        Ok(Self { speed })
    }

    pub fn speed(&self) -> i64 {
        self.speed
    }

    /// Bytes stored in the cache slot: `{"speed":<n>}`.
    pub fn to_cache_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes the cache slot, checking the range again.
    pub fn from_cache_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawReading = serde_json::from_slice(bytes)?;
        Ok(Self::new(raw.speed)?)
    }
}

#[derive(Deserialize)]
struct RawReading {
    speed: i64,
}

/// Body of `POST /v1/publish`. `speed` is optional so a missing field can be
/// told apart from a malformed body.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub speed: Option<i64>,
}

impl PublishRequest {
    pub fn into_reading(self) -> Result<Reading, ValidationError> {
        let speed = self.speed.ok_or(ValidationError::MissingSpeed)?;
        Reading::new(speed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Payload published to and echoed back from the broker.
///
/// Producers other than this service send only `{"speed": n}`; the
/// correlation id is then absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoEnvelope {
    pub speed: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl EchoEnvelope {
    pub fn new(reading: Reading, correlation_id: Option<Uuid>) -> Self {
        Self {
            speed: reading.speed(),
            correlation_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a broker payload into its reading and optional correlation id.
    pub fn decode(payload: &[u8]) -> Result<(Reading, Option<Uuid>), DecodeError> {
        let envelope: EchoEnvelope = serde_json::from_slice(payload)?;
        let reading = Reading::new(envelope.speed)?;
        Ok((reading, envelope.correlation_id))
    }
}
