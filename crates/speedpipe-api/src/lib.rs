use std::convert::Infallible;
use std::fmt;

use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the per-request correlation identifier.
pub const TRANSACTION_ID_HEADER: &str = "transaction-id";

// -------------------------
// Transaction id
// -------------------------

/// Opaque correlation identifier attached to every inbound request.
///
/// The transaction-id middleware stores one in the request extensions; the
/// extractor falls back to the raw header (or a fresh id) when the middleware
/// did not run, so handlers can always rely on having one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    /// Generate a fresh v4 transaction id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept the header value when it is a valid UUID, otherwise generate one.
    pub fn from_header(value: Option<&HeaderValue>) -> Self {
        value
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(|id| Self(id.to_string()))
            .unwrap_or_else(Self::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.0).ok()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S> FromRequestParts<S> for TransactionId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(id) = parts.extensions.get::<TransactionId>() {
            return Ok(id.clone());
        }
        Ok(Self::from_header(parts.headers.get(TRANSACTION_ID_HEADER)))
    }
}

// -------------------------
// Error model
// -------------------------

/// Wire shape of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    /// Transaction id of the failing request
    pub trace: String,
    /// HTTP status code, repeated in the body
    pub code: u16,
    /// Human-readable description
    pub message: String,
}

/// High-level API errors to be mapped to HTTP responses
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Broker(String),
    #[error("{0}")]
    Cache(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Broker(_) | ApiError::Cache(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Attach the transaction id of the request that produced this error.
    pub fn traced(self, trace: &TransactionId) -> TracedError {
        TracedError {
            trace: trace.clone(),
            error: self,
        }
    }
}

/// An [`ApiError`] bound to the transaction id it is reported under.
#[derive(Debug, Error)]
#[error("{error} (trace {trace})")]
pub struct TracedError {
    pub trace: TransactionId,
    pub error: ApiError,
}

impl TracedError {
    pub fn status_code(&self) -> StatusCode {
        self.error.status_code()
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            trace: self.trace.to_string(),
            code: self.status_code().as_u16(),
            message: self.error.to_string(),
        }
    }
}

impl IntoResponse for TracedError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self.to_body())).into_response()
    }
}
