//! Error types for order-status operations.
//!
//! This module defines [`StatusError`] which covers every failure that can occur
//! when fetching from an upstream instance, reading or writing the cache, or
//! running background jobs.

use std::fmt;

use thiserror::Error;

use crate::types::Instance;

/// The phase of an HTTP exchange in which a timeout fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeoutPhase {
    /// No connection could be established within the short bound.
    Connect,
    /// The request was sent but the response did not complete within the long bound.
    Read,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// Errors that can occur during order-status operations.
#[derive(Error, Debug)]
pub enum StatusError {
    /// The upstream did not answer in time.
    #[error("Upstream {instance} timed out during {phase}")]
    Timeout {
        /// The instance that timed out.
        instance: Instance,
        /// Which bound was exceeded.
        phase: TimeoutPhase,
    },

    /// The upstream answered with a 5xx or 429 status.
    #[error("Upstream {instance} unavailable (HTTP {status})")]
    UpstreamUnavailable {
        /// The instance that is unavailable.
        instance: Instance,
        /// The HTTP status returned.
        status: u16,
    },

    /// The upstream refused the request with a non-retryable 4xx status.
    #[error("Upstream {instance} rejected the request (HTTP {status}): {message}")]
    UpstreamRejected {
        /// The instance that rejected the request.
        instance: Instance,
        /// The HTTP status returned.
        status: u16,
        /// Response body or reason, for diagnostics.
        message: String,
    },

    /// Transport failure before any response arrived.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A fallback was needed but nothing has ever been cached under the key.
    #[error("Upstream unavailable and no cached data exists for {cache_key}")]
    NoDataAvailable {
        /// The cache key that was looked up.
        cache_key: String,
    },

    /// A unit of work executed by the job engine failed.
    #[error("Job failed: {0}")]
    Job(String),

    /// No job exists with the given id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job already reached a terminal state and can no longer change.
    #[error("Job {0} is finished and cannot be modified")]
    JobFinalized(String),

    /// A status change that the job lifecycle does not permit.
    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// No endpoint or credentials are configured for the instance.
    #[error("Instance not configured: {0}")]
    InstanceNotConfigured(String),

    /// Error interacting with the cache or job store.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Error parsing data from the upstream or from storage.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StatusError {
    /// Returns true for failures that signal upstream unavailability.
    ///
    /// These are absorbed by the fetch orchestrator: they start a cooldown and
    /// the request is served from cache. Everything else is raised to the caller.
    #[must_use]
    pub const fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::UpstreamUnavailable { .. } | Self::Connection(_)
        )
    }
}

/// Result type alias using [`StatusError`].
pub type Result<T> = std::result::Result<T, StatusError>;
