//! JWT token generation and validation.
//!
//! ## Example
//!
//! ```ignore
//! use speedpipe_auth::token::JwtService;
//!
//! let jwt = JwtService::new(b"secret", time::Duration::minutes(5));
//! let issued = jwt.issue("a@b.com")?;
//! let claims = jwt.verify(&issued.token)?;
//! assert_eq!(claims.email, "a@b.com");
//! ```

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::AuthConfig;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during JWT operations.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    /// Failed to encode a token.
    #[error("Failed to encode token: {message}")]
    EncodingError {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a token.
    #[error("Failed to decode token: {message}")]
    DecodingError {
        /// Description of the decoding error.
        message: String,
    },

    /// The token has expired.
    #[error("Token expired")]
    Expired,

    /// The token signature is invalid.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The token claims are invalid.
    #[error("Invalid claims: {message}")]
    InvalidClaims {
        /// Description of why claims are invalid.
        message: String,
    },

    /// The key or crypto backend failed while verifying.
    #[error("Verification failed: {message}")]
    Verification {
        /// Description of the failure.
        message: String,
    },
}

impl JwtError {
    /// Creates a new `EncodingError`.
    #[must_use]
    pub fn encoding_error(message: impl Into<String>) -> Self {
        Self::EncodingError {
            message: message.into(),
        }
    }

    /// Creates a new `DecodingError`.
    #[must_use]
    pub fn decoding_error(message: impl Into<String>) -> Self {
        Self::DecodingError {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidClaims` error.
    #[must_use]
    pub fn invalid_claims(message: impl Into<String>) -> Self {
        Self::InvalidClaims {
            message: message.into(),
        }
    }

    /// Creates a new `Verification` error.
    #[must_use]
    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification {
            message: message.into(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidToken
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::MissingAlgorithm
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Self::decoding_error(err.to_string()),
            ErrorKind::ImmatureSignature
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidSubject
            | ErrorKind::MissingRequiredClaim(_) => Self::invalid_claims(err.to_string()),
            _ => Self::verification(err.to_string()),
        }
    }
}

// ============================================================================
// Claims
// ============================================================================

/// Claims embedded in every issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Email the token was issued to.
    pub email: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// A freshly signed token together with the claims it carries.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TokenClaims,
}

// ============================================================================
// JWT Service
// ============================================================================

/// Service for issuing and verifying HS256 tokens.
///
/// This service is thread-safe (`Send + Sync`) and can be shared across
/// async tasks.
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl JwtService {
    /// Creates a new JWT service.
    ///
    /// # Arguments
    /// * `secret` - HMAC secret shared by signing and verification
    /// * `ttl` - Validity window of issued tokens
    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Creates a service from the `[auth]` configuration section.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let ttl = Duration::seconds(i64::try_from(config.token_ttl_secs).unwrap_or(i64::MAX));
        Self::new(config.secret.as_bytes(), ttl)
    }

    /// Issues a token for `email`, valid from now for the configured window.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn issue(&self, email: &str) -> Result<IssuedToken, JwtError> {
        self.issue_at(email, OffsetDateTime::now_utc())
    }

    /// Issues a token as if it had been minted at `issued_at`.
    ///
    /// # Errors
    /// Returns an error if the expiry is not representable or signing fails.
    pub fn issue_at(
        &self,
        email: &str,
        issued_at: OffsetDateTime,
    ) -> Result<IssuedToken, JwtError> {
        let expires_at = issued_at.checked_add(self.ttl).ok_or_else(|| {
            JwtError::encoding_error(format!("token lifetime {} overflows the expiry", self.ttl))
        })?;
        let claims = TokenClaims {
            email: email.to_string(),
            iat: issued_at.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
        };
        let token = self.encode(&claims)?;
        Ok(IssuedToken { token, claims })
    }

    /// Encodes claims into a JWT string.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn encode<T: Serialize>(&self, claims: &T) -> Result<String, JwtError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| JwtError::encoding_error(e.to_string()))
    }

    /// Decodes a JWT string and checks its signature and expiry.
    ///
    /// Expiry is checked without leeway: a token is rejected the second its
    /// window closes.
    ///
    /// # Errors
    /// Returns an error if decoding or validation fails.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(JwtError::from)
    }
}
