//! Token generation and validation.
//!
//! Tokens are stateless HS256 JWTs carrying the caller's email; no
//! server-side session or revocation store exists.

pub mod jwt;

pub use jwt::{IssuedToken, JwtError, JwtService, TokenClaims};
