#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/watsonblinds/orderstatus/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Resilient order-status reporting.
//!
//! This crate ties the workspace together. It re-exports the core types,
//! the storage backends, the fetch layer and the job engine, and provides a
//! [`ReportService`] that runs multi-instance reports as background jobs.
//!
//! # Features
//!
//! - `buz` - Buz Manager OData client
//! - `sqlite` - SQLite-backed cache and job store
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use orderstatus::{
//!     BuzClient, FetchOrchestrator, JobEngine, Query, ReportRequest, ReportService,
//!     ResilienceConfig, SqliteCache, SqliteJobStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> orderstatus::Result<()> {
//!     let config = ResilienceConfig::from_env()?;
//!     let remote = Arc::new(BuzClient::from_env(&config)?);
//!     let cache = Arc::new(SqliteCache::new("orderstatus.db")?);
//!     let jobs = Arc::new(SqliteJobStore::new("orderstatus.db")?);
//!
//!     let service = ReportService::new(
//!         Arc::new(FetchOrchestrator::new(remote, cache, &config)),
//!         JobEngine::new(jobs, &config),
//!     );
//!
//!     let request = ReportRequest::new(
//!         "wip",
//!         Query::new("JobsScheduleDetailed").filter("OrderStatus eq 'Work in Progress'"),
//!     )
//!     .instance("DD")
//!     .instance("CBR");
//!
//!     let job_id = service.request_report(request).await?;
//!     println!("{:?}", service.job_status(&job_id).await?);
//!     Ok(())
//! }
//! ```

// Core types and traits
pub use orderstatus_core::*;

// Storage backends
pub use orderstatus_store::{InMemoryCache, InMemoryJobStore};
#[cfg(feature = "sqlite")]
pub use orderstatus_store::{SqliteCache, SqliteJobStore};

// Remote client
#[cfg(feature = "buz")]
pub use orderstatus_buz::{BuzClient, InstanceEndpoint};

// Fetch layer and job engine
pub use orderstatus_fetch::{BlackoutCalendar, CooldownTracker, FetchOrchestrator};
pub use orderstatus_jobs::{JobContext, JobEngine, ProgressListener};

mod reports;
pub use reports::{Report, ReportFailure, ReportRequest, ReportSection, ReportService};
