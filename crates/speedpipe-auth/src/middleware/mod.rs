//! HTTP middleware for bearer token authentication.
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::get};
//! use speedpipe_auth::middleware::{AuthState, BearerAuth};
//!
//! async fn protected_handler(BearerAuth(claims): BearerAuth) -> String {
//!     format!("Hello, {}!", claims.email)
//! }
//!
//! let app = Router::new()
//!     .route("/protected", get(protected_handler))
//!     .with_state(AuthState::new(jwt_service));
//! ```

pub mod auth;
pub mod error;

pub use auth::{AuthState, BearerAuth, extract_token};
