#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/watsonblinds/orderstatus/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Storage backends for orderstatus.
//!
//! This crate provides implementations of the [`CacheStore`] and [`JobStore`]
//! traits from `orderstatus-core`:
//!
//! - [`InMemoryCache`], [`InMemoryJobStore`] - In-memory stores for testing
//! - [`SqliteCache`], [`SqliteJobStore`] - Persistent SQLite stores (requires `sqlite` feature)

/// In-memory store implementations.
pub mod memory;

/// SQLite-based store implementations.
#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-export the traits for convenience
pub use orderstatus_core::{CacheStore, JobStore};

// Re-export implementations
pub use memory::{InMemoryCache, InMemoryJobStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteCache, SqliteJobStore};
