use std::sync::atomic::Ordering;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use speedpipe_api::{ApiError, TracedError, TransactionId};
use speedpipe_auth::{BearerAuth, validate_email};
use tracing::{debug, error, info};

use crate::config::ConfirmMode;
use crate::reading::{PublishRequest, ValidationError};
use crate::server::AppState;

pub const PUBLISHED_MESSAGE: &str = "Published speed data to MQTT Pipeline";
pub const NO_DATA_MESSAGE: &str = "No speed data found";

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub message: String,
}

/// `latest_speed` is the number when present, the no-data message otherwise.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LatestSpeed {
    Value(i64),
    Missing(String),
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct LatestSpeedResponse {
    pub latest_speed: LatestSpeed,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Readiness of the store and the broker, plus echo path counters.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub cache: &'static str,
    pub broker: &'static str,
    pub confirm: ConfirmMode,
    pub echo: EchoReport,
}

#[derive(Debug, Serialize)]
pub struct EchoReport {
    pub pending: usize,
    pub completed: u64,
    pub abandoned: u64,
    pub unclaimed: u64,
    /// Echoes discarded because the listener queue was full
    pub dropped: u64,
}

pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let cache_ok = match state.cache.ping().await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "readiness check failed: cache");
            false
        }
    };
    let broker = state.pipeline.broker();
    let broker_ok = broker.is_connected();
    if !broker_ok {
        error!(broker = broker.name(), "readiness check failed: broker disconnected");
    }

    let registry = state.pipeline.registry();
    let stats = registry.stats();
    let report = ReadinessResponse {
        status: if cache_ok && broker_ok { "ready" } else { "unavailable" },
        cache: if cache_ok { "ok" } else { "unavailable" },
        broker: if broker_ok { "connected" } else { "disconnected" },
        confirm: state.pipeline.confirm_mode(),
        echo: EchoReport {
            pending: registry.pending_count(),
            completed: stats.total_completed.load(Ordering::Relaxed),
            abandoned: stats.total_abandoned.load(Ordering::Relaxed),
            unclaimed: stats.total_unclaimed.load(Ordering::Relaxed),
            dropped: state.echo_sink.dropped(),
        },
    };
    let status = if cache_ok && broker_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// `POST /v1`: exchange an email address for a bearer token.
pub async fn issue_token(
    State(state): State<AppState>,
    trace: TransactionId,
    body: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, TracedError> {
    let Json(request) = body.map_err(|rejection| {
        debug!(transaction_id = %trace, error = %rejection, "unreadable token request");
        ApiError::validation(ValidationError::InvalidBody.to_string()).traced(&trace)
    })?;
    let Some(email) = request.email.filter(|e| !e.trim().is_empty()) else {
        return Err(ApiError::validation("invalid request received").traced(&trace));
    };
    let email = validate_email(&email).map_err(|e| ApiError::from(e).traced(&trace))?;

    let issued = state.auth.jwt_service.issue(&email).map_err(|e| {
        error!(transaction_id = %trace, error = %e, "unable to generate a token");
        ApiError::internal(format!("Unable to generate the token, err {e}")).traced(&trace)
    })?;
    info!(transaction_id = %trace, "token issued");
    Ok(Json(TokenResponse {
        token: issued.token,
    }))
}

/// `POST /v1/publish`: publish a reading and wait for its confirmation.
pub async fn publish(
    BearerAuth(claims): BearerAuth,
    trace: TransactionId,
    State(state): State<AppState>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> Result<Json<PublishResponse>, TracedError> {
    let Json(request) = body.map_err(|rejection| {
        debug!(transaction_id = %trace, error = %rejection, "unreadable publish request");
        ApiError::validation(ValidationError::InvalidBody.to_string()).traced(&trace)
    })?;
    let reading = request
        .into_reading()
        .map_err(|e| ApiError::validation(e.to_string()).traced(&trace))?;

    info!(
        transaction_id = %trace,
        email = %claims.email,
        speed = reading.speed(),
        "received request to publish the speed"
    );
    state
        .pipeline
        .publish(&reading, &trace)
        .await
        .map_err(|e| ApiError::from(e).traced(&trace))?;

    Ok(Json(PublishResponse {
        message: PUBLISHED_MESSAGE.to_string(),
    }))
}

/// `GET /v1`: the most recently stored reading.
pub async fn latest_speed(
    BearerAuth(_claims): BearerAuth,
    trace: TransactionId,
    State(state): State<AppState>,
) -> Result<Json<LatestSpeedResponse>, TracedError> {
    let latest = state.cache.get().await.map_err(|e| {
        error!(transaction_id = %trace, error = %e, "unable to read the latest speed");
        ApiError::cache(format!("Unable to fetch the speed data, err {e}")).traced(&trace)
    })?;

    let latest_speed = match latest {
        Some(reading) => LatestSpeed::Value(reading.speed()),
        None => LatestSpeed::Missing(NO_DATA_MESSAGE.to_string()),
    };
    Ok(Json(LatestSpeedResponse { latest_speed }))
}

