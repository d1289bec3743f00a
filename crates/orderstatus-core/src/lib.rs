#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/watsonblinds/orderstatus/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core traits and types for resilient order-status fetching.
//!
//! This crate provides the foundational abstractions:
//!
//! - [`RemoteClient`](remote::RemoteClient) - Queries one upstream instance
//! - [`CacheStore`](cache::CacheStore) - Key/value cache with write timestamps
//! - [`JobStore`](jobs::JobStore) - Persistence for background job records
//! - [`Clock`](clock::Clock) - Injectable time source
//! - [`ResilienceConfig`](config::ResilienceConfig) - Timeouts, windows and limits

/// Cache trait for storing fetched data.
pub mod cache;
/// Injectable time source.
pub mod clock;
/// Resilience configuration.
pub mod config;
/// Error types for order-status operations.
pub mod error;
/// Job records and the job store trait.
pub mod jobs;
/// Remote client trait for upstream queries.
pub mod remote;
/// Core data types (Instance, Query, CacheEntry, etc.).
pub mod types;

// Re-export commonly used items at crate root
pub use cache::CacheStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BlackoutConfig, ResilienceConfig};
pub use error::{Result, StatusError, TimeoutPhase};
pub use jobs::{Job, JobId, JobState, JobStatus, JobStore, JobUpdate, JobView, LogEntry};
pub use remote::RemoteClient;
pub use types::{CacheEntry, FallbackReason, FetchOutcome, Fetched, Instance, Query, Row, Source};
