//! Remote client trait for querying upstream instances.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::{
    error::Result,
    types::{Instance, Query, Row},
};

/// Executes a single query against one upstream instance.
///
/// Implementations classify failures into the [`StatusError`](crate::StatusError)
/// taxonomy:
///
/// - `Timeout`, `UpstreamUnavailable`, `Connection` signal the upstream is
///   unreachable and callers may fall back to cached data;
/// - `UpstreamRejected` and everything else are hard failures.
#[async_trait]
pub trait RemoteClient: Send + Sync + Debug {
    /// Returns the name of this client (e.g. "Buz OData").
    fn name(&self) -> &str;

    /// Runs `query` against `instance` and returns the rows.
    async fn fetch(&self, instance: &Instance, query: &Query) -> Result<Vec<Row>>;
}
