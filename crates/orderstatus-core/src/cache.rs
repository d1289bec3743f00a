//! Cache trait for storing fetched upstream data.
//!
//! This module defines the [`CacheStore`] trait: durable key/value storage
//! with a per-key write timestamp. Freshness policy lives in the caller,
//! never in the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{error::Result, types::CacheEntry};

/// Key/value storage for fetched payloads.
///
/// Implementations must never expose a partial write: a concurrent `get`
/// sees either the old entry or the new one in full.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Retrieves the entry for `key`.
    ///
    /// Returns `Ok(Some(entry))` if cached, `Ok(None)` if not.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Stores `value` under `key`, replacing any previous entry.
    async fn set(&self, key: &str, value: &serde_json::Value, written_at: DateTime<Utc>)
    -> Result<()>;

    /// Removes the listed keys, or every entry when `keys` is `None`.
    ///
    /// Returns the number of entries removed.
    async fn clear(&self, keys: Option<&[String]>) -> Result<usize>;
}
