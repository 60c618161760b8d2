//! # speedpipe-auth
//!
//! Bearer token support for the speedpipe HTTP surface.
//!
//! This crate provides:
//! - Short-lived HS256 tokens carrying the caller's email
//! - Syntactic email validation for the token issuance endpoint
//! - An Axum extractor that gates handlers on a valid bearer token
//!
//! ## Modules
//!
//! - [`config`] - Signing secret and token lifetime
//! - [`email`] - RFC 5322 address syntax check
//! - [`token`] - JWT encoding and verification
//! - [`middleware`] - `BearerAuth` extractor and error mapping

pub mod config;
pub mod email;
pub mod error;
pub mod middleware;
pub mod token;

pub use config::{AuthConfig, ConfigError};
pub use email::validate_email;
pub use error::AuthError;
pub use middleware::{AuthState, BearerAuth};
pub use token::{IssuedToken, JwtError, JwtService, TokenClaims};
