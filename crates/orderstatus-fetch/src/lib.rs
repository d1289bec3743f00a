#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/watsonblinds/orderstatus/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Live-or-cached fetching for order-status data.
//!
//! [`FetchOrchestrator::fetch_or_cached`] decides per call whether to query
//! the upstream or serve the last cached copy:
//!
//! 1. Inside the [`BlackoutCalendar`] window, or while the instance is in
//!    [`CooldownTracker`] cooldown, the cache answers without a live call.
//! 2. Otherwise the upstream is queried. Success refreshes the cache and ends
//!    any cooldown.
//! 3. A timeout, 5xx/429 or connection failure starts a cooldown and falls
//!    back to the cache, however old.
//! 4. Any other failure is returned as-is.
//!
//! `force_refresh` skips step 1 only.

/// Daily blackout window.
pub mod blackout;
/// Per-instance cooldown.
pub mod cooldown;
/// The fetch decision algorithm.
pub mod orchestrator;

pub use blackout::BlackoutCalendar;
pub use cooldown::CooldownTracker;
pub use orchestrator::FetchOrchestrator;
