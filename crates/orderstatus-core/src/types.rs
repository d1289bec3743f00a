//! Core data types for order-status fetching.
//!
//! This module defines the fundamental data structures:
//!
//! - [`Instance`] - Upstream tenant identifier
//! - [`Query`] - Endpoint plus OData filter conditions
//! - [`Row`] - One upstream record
//! - [`CacheEntry`] - Cached payload with its write timestamp
//! - [`Source`] - Whether a result came from upstream or from cache
//! - [`FetchOutcome`] - Transient result of a sourcing decision
//! - [`Fetched`] - Rows returned to callers with their provenance

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StatusError;

/// One upstream record, as returned in the OData `value` array.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// An upstream instance identifier (e.g. `DD`, `CBR`).
///
/// Instances are automatically uppercased on creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct Instance(String);

impl Instance {
    /// Creates a new instance identifier, converting to uppercase.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().trim().to_uppercase())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Instance {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for Instance {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Instance {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// An upstream query: an endpoint and the filter conditions applied to it.
///
/// Conditions are combined with ` and ` into a single OData `$filter`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    /// Endpoint name relative to the instance root (e.g. `JobsScheduleDetailed`).
    pub endpoint: String,
    /// Filter conditions, already in OData syntax.
    pub filters: Vec<String>,
}

impl Query {
    /// Creates a query for an endpoint with no filters.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            filters: Vec::new(),
        }
    }

    /// Adds a filter condition.
    #[must_use]
    pub fn filter(mut self, condition: impl Into<String>) -> Self {
        self.filters.push(condition.into());
        self
    }

    /// Returns the combined `$filter` expression.
    #[must_use]
    pub fn filter_expression(&self) -> String {
        self.filters.join(" and ")
    }
}

/// A cached payload and the time it was written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Unique cache key.
    pub key: String,
    /// Opaque serialized payload.
    pub value: serde_json::Value,
    /// When the payload was last written.
    pub written_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates a new cache entry.
    #[must_use]
    pub fn new(key: impl Into<String>, value: serde_json::Value, written_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            value,
            written_at,
        }
    }

    /// Age of the entry at `now`. Never negative.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.written_at).max(Duration::zero())
    }

    /// Returns true if the entry is older than `max_age`.
    ///
    /// A zero or negative `max_age` treats every entry as old.
    #[must_use]
    pub fn is_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        max_age <= Duration::zero() || self.age(now) > max_age
    }

    /// Decodes the payload as a list of rows.
    ///
    /// # Errors
    /// Returns [`StatusError::Parse`] if the payload is not an array of objects.
    pub fn rows(&self) -> Result<Vec<Row>, StatusError> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| StatusError::Parse(format!("cache entry {}: {e}", self.key)))
    }
}

/// Which path produced a fetch result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Fresh data from the upstream.
    Live,
    /// Previously cached data, possibly stale.
    Cache,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

/// Why a request was served from cache instead of upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The scheduled blackout window is in effect.
    Blackout,
    /// The instance recently failed and is cooling down.
    Cooldown,
    /// The live attempt timed out.
    Timeout,
    /// The live attempt returned 5xx or 429.
    UpstreamUnavailable,
    /// The live attempt failed at the transport level.
    ConnectionError,
}

impl FallbackReason {
    /// Maps a fallback-eligible error to its reason.
    ///
    /// Returns `None` for errors that must not fall back.
    #[must_use]
    pub const fn from_error(error: &StatusError) -> Option<Self> {
        match error {
            StatusError::Timeout { .. } => Some(Self::Timeout),
            StatusError::UpstreamUnavailable { .. } => Some(Self::UpstreamUnavailable),
            StatusError::Connection(_) => Some(Self::ConnectionError),
            _ => None,
        }
    }

    /// Returns true if the fallback was caused by a newly observed failure.
    #[must_use]
    pub const fn is_observed_failure(&self) -> bool {
        !matches!(self, Self::Blackout | Self::Cooldown)
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Blackout => "blackout",
            Self::Cooldown => "cooldown",
            Self::Timeout => "timeout",
            Self::UpstreamUnavailable => "upstream unavailable",
            Self::ConnectionError => "connection error",
        };
        f.write_str(s)
    }
}

/// Transient result of one sourcing decision. Never persisted.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The upstream answered.
    Live(Vec<Row>),
    /// The cache answered because the live path was skipped or failed.
    CachedFallback(CacheEntry, FallbackReason),
    /// Nothing could be served.
    Failed(StatusError),
}

/// Rows returned by a fetch, tagged with where they came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fetched {
    /// The rows.
    pub rows: Vec<Row>,
    /// Live or cache.
    pub source: Source,
    /// When the rows were obtained from upstream.
    pub written_at: DateTime<Utc>,
    /// Set for cache-sourced results.
    pub fallback: Option<FallbackReason>,
}

impl Fetched {
    /// Returns true if the rows came from cache and may be stale.
    #[must_use]
    pub fn is_possibly_stale(&self) -> bool {
        self.source == Source::Cache
    }
}
