#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/watsonblinds/orderstatus/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Background job execution.
//!
//! [`JobEngine`] hands units of work to a bounded pool, records each job's
//! progress, log and outcome in a [`JobStore`](orderstatus_core::JobStore),
//! and contains any failure or panic at the job boundary so a poller always
//! sees a terminal state.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use orderstatus_core::ResilienceConfig;
//! use orderstatus_jobs::JobEngine;
//! use orderstatus_store::InMemoryJobStore;
//!
//! # async fn example() -> orderstatus_core::Result<()> {
//! let engine = JobEngine::new(Arc::new(InMemoryJobStore::new()), &ResilienceConfig::default());
//! let id = engine.create_job().await?;
//! engine.schedule(id.clone(), |ctx| async move {
//!     ctx.progress(50, "Halfway").await;
//!     Ok(serde_json::json!({"ok": true}))
//! });
//! let view = engine.job_view(&id).await?;
//! # Ok(())
//! # }
//! ```

/// Job engine, context and listener trait.
pub mod engine;

pub use engine::{JobContext, JobEngine, ProgressListener, SHUTDOWN_MESSAGE};
