//! Bearer token authentication extractor.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use speedpipe_api::{ApiError, TracedError, TransactionId};

use crate::error::AuthError;
use crate::token::jwt::{JwtService, TokenClaims};

// =============================================================================
// Auth State
// =============================================================================

/// State required for bearer token authentication.
///
/// Include it in the application state and expose it to [`BearerAuth`]
/// via `FromRef`:
///
/// ```ignore
/// impl FromRef<AppState> for AuthState {
///     fn from_ref(state: &AppState) -> Self {
///         state.auth.clone()
///     }
/// }
/// ```
#[derive(Clone)]
pub struct AuthState {
    /// JWT service for token validation.
    pub jwt_service: Arc<JwtService>,
}

impl AuthState {
    /// Creates a new auth state.
    pub fn new(jwt_service: Arc<JwtService>) -> Self {
        Self { jwt_service }
    }

    /// Checks a raw token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns `TokenExpired`, `InvalidToken` or `Internal` per the
    /// verification outcome.
    pub fn authenticate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.jwt_service.verify(token).map_err(AuthError::from)
    }
}

// =============================================================================
// Bearer Auth Extractor
// =============================================================================

/// Axum extractor that validates the bearer token and yields its claims.
///
/// The token is read from the `Authorization` header, either as
/// `Bearer <token>` or as the bare token. Rejections are reported through
/// the shared `{trace, code, message}` error body.
pub struct BearerAuth(pub TokenClaims);

impl<S> FromRequestParts<S> for BearerAuth
where
    S: Send + Sync,
    AuthState: FromRef<S>,
{
    type Rejection = TracedError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let trace = match TransactionId::from_request_parts(parts, state).await {
            Ok(id) => id,
            Err(never) => match never {},
        };
        let auth_state = AuthState::from_ref(state);

        let result = extract_token(&parts.headers)
            .ok_or(AuthError::MissingToken)
            .and_then(|token| auth_state.authenticate(token));

        match result {
            Ok(claims) => Ok(BearerAuth(claims)),
            Err(e) => {
                if e.is_client_error() {
                    tracing::debug!(transaction_id = %trace, error = %e, "Rejected bearer token");
                } else {
                    tracing::error!(transaction_id = %trace, error = %e, "Token verification failed");
                }
                Err(ApiError::from(e).traced(&trace))
            }
        }
    }
}

/// Pulls the token out of the `Authorization` header.
///
/// Returns `None` when the header is absent, not valid UTF-8, or empty once
/// the optional `Bearer ` prefix is stripped.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim_start();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Request, StatusCode};

    fn state() -> AuthState {
        AuthState::new(Arc::new(JwtService::new(
            b"test-secret",
            time::Duration::minutes(5),
        )))
    }

    fn parts_with_auth(value: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/v1");
        if let Some(v) = value {
            builder = builder.header(AUTHORIZATION, v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn extract_token_accepts_bearer_and_raw_forms() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(extract_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("abc.def.ghi"));
        assert_eq!(extract_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_token(&headers), None);

        assert_eq!(extract_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn valid_token_yields_claims() {
        let state = state();
        let issued = state.jwt_service.issue("a@b.com").unwrap();
        let mut parts = parts_with_auth(Some(&format!("Bearer {}", issued.token)));

        let BearerAuth(claims) = BearerAuth::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert_eq!(claims.email, "a@b.com");
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let mut parts = parts_with_auth(None);
        let Err(err) = BearerAuth::from_request_parts(&mut parts, &state()).await else {
            panic!("expected rejection");
        };
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn expired_token_reports_token_expired() {
        let state = state();
        let minted = time::OffsetDateTime::now_utc() - time::Duration::minutes(10);
        let issued = state.jwt_service.issue_at("a@b.com", minted).unwrap();
        let mut parts = parts_with_auth(Some(&issued.token));

        let Err(err) = BearerAuth::from_request_parts(&mut parts, &state).await else {
            panic!("expected rejection");
        };
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.error.to_string(), "token expired");
    }
}
