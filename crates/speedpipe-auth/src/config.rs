//! Authentication configuration.

use serde::{Deserialize, Serialize};

/// Secret used by the development defaults. Startup warns when it is in use.
pub const DEV_SECRET: &str = "speedpipe-development-secret-change-me";

/// Longest accepted token lifetime: 30 days.
pub const MAX_TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Token signing configuration.
///
/// # Example (TOML)
///
/// ```toml
/// [auth]
/// secret = "a-long-random-string"
/// token_ttl_secs = 300
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret used to sign and verify tokens.
    pub secret: String,

    /// Token validity window in seconds, counted from issuance.
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: DEV_SECRET.to_string(),
            token_ttl_secs: 300,
        }
    }
}

impl AuthConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is empty or the token lifetime is zero
    /// or above [`MAX_TOKEN_TTL_SECS`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::invalid("auth.secret", "must not be empty"));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::invalid("auth.token_ttl_secs", "must be > 0"));
        }
        if self.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(ConfigError::invalid(
                "auth.token_ttl_secs",
                format!("must be at most {MAX_TOKEN_TTL_SECS}"),
            ));
        }
        Ok(())
    }

    /// Returns `true` when the built-in development secret is configured.
    #[must_use]
    pub fn uses_dev_secret(&self) -> bool {
        self.secret == DEV_SECRET
    }
}

/// Errors found while validating [`AuthConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
