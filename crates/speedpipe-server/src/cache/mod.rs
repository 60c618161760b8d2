//! Single-slot cache holding the most recent reading.
//!
//! Every write overwrites the slot unconditionally (last write wins). There
//! is no versioning or compare-and-swap, so concurrent writers are not
//! linearizable: the surviving value is whichever write landed last.

pub mod backend;

pub use backend::{StoreBackend, StoredEntry};

use std::time::Duration;

use crate::reading::{DecodeError, Reading};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backing store could not be reached or refused the command.
    #[error("cache store error: {0}")]
    Store(String),
    /// The slot holds bytes that are not a valid reading.
    #[error("cached value is corrupt: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to encode reading: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }
}

#[derive(Clone)]
pub struct LatestValueCache {
    backend: StoreBackend,
    key: String,
    ttl: Option<Duration>,
}

impl LatestValueCache {
    pub fn new(backend: StoreBackend, key: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            backend,
            key: key.into(),
            ttl,
        }
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Overwrite the slot with `reading`.
    pub async fn set(&self, reading: &Reading) -> Result<(), CacheError> {
        let bytes = reading.to_cache_bytes()?;
        self.backend.set(&self.key, bytes, self.ttl).await
    }

    /// Read the slot. `Ok(None)` means it was never written (or expired);
    /// undecodable bytes are an error, not a miss.
    pub async fn get(&self) -> Result<Option<Reading>, CacheError> {
        match self.backend.get(&self.key).await? {
            Some(bytes) => Ok(Some(Reading::from_cache_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }
}
