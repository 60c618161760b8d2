//! Authentication error types.

use crate::token::JwtError;

/// Errors that can occur while issuing or checking bearer tokens.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("authorization header is empty")]
    MissingToken,

    /// The token's `exp` claim is in the past.
    #[error("token expired")]
    TokenExpired,

    /// The token is malformed, badly signed, or carries invalid claims.
    #[error("invalid token: {message}")]
    InvalidToken {
        /// Description of why the token is invalid.
        message: String,
    },

    /// The email presented for token issuance is not well-formed.
    #[error("invalid email found: {message}")]
    InvalidEmail {
        /// Description of why the email was rejected.
        message: String,
    },

    /// Verification or signing failed for a reason unrelated to the token
    /// contents (key or crypto backend failure).
    #[error("error while processing token: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `InvalidToken` error.
    #[must_use]
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidEmail` error.
    #[must_use]
    pub fn invalid_email(message: impl Into<String>) -> Self {
        Self::InvalidEmail {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if the caller is at fault (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Internal { .. })
    }
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => Self::TokenExpired,
            JwtError::InvalidSignature
            | JwtError::DecodingError { .. }
            | JwtError::InvalidClaims { .. } => Self::invalid_token(err.to_string()),
            JwtError::EncodingError { .. } | JwtError::Verification { .. } => {
                Self::internal(err.to_string())
            }
        }
    }
}
