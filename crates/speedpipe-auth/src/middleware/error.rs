//! Mapping from authentication failures to the shared HTTP error model.

use speedpipe_api::ApiError;

use crate::error::AuthError;

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidEmail { .. } => ApiError::validation(err.to_string()),
            AuthError::MissingToken | AuthError::TokenExpired => {
                ApiError::unauthorized(err.to_string())
            }
            AuthError::InvalidToken { .. } => ApiError::unauthorized("invalid token"),
            AuthError::Internal { .. } => ApiError::internal("error while parsing token"),
        }
    }
}
