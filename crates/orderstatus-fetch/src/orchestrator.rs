//! Live-or-cached decision for one upstream instance.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use orderstatus_core::{
    CacheStore, Clock, FallbackReason, FetchOutcome, Fetched, Instance, Query, RemoteClient,
    ResilienceConfig, Result, Row, Source, StatusError, SystemClock,
};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::{BlackoutCalendar, CooldownTracker};

/// Decides per call whether to query the upstream or serve the cache, and
/// keeps the cache and cooldown state in step with what it observes.
///
/// The orchestrator is cheap to share behind an `Arc`; all mutable state
/// lives in the cache store and the cooldown tracker.
pub struct FetchOrchestrator {
    remote: Arc<dyn RemoteClient>,
    cache: Arc<dyn CacheStore>,
    cooldown: Arc<CooldownTracker>,
    blackout: BlackoutCalendar,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("remote", &self.remote.name())
            .field("cooldown", &self.cooldown)
            .field("blackout", &self.blackout)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl FetchOrchestrator {
    /// Creates an orchestrator using the system clock and the blackout and
    /// cooldown settings from `config`.
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        cache: Arc<dyn CacheStore>,
        config: &ResilienceConfig,
    ) -> Self {
        Self {
            remote,
            cache,
            cooldown: Arc::new(CooldownTracker::new(config.cooldown)),
            blackout: BlackoutCalendar::new(config.blackout),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the cooldown tracker, e.g. to share one between orchestrators.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Arc<CooldownTracker>) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Returns the cooldown tracker.
    #[must_use]
    pub fn cooldown(&self) -> &Arc<CooldownTracker> {
        &self.cooldown
    }

    /// Returns the cache store.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Returns the blackout calendar.
    #[must_use]
    pub const fn blackout(&self) -> &BlackoutCalendar {
        &self.blackout
    }

    /// Fetches rows for `instance`, falling back to the cache under
    /// `cache_key` when the live path is skipped or fails softly.
    ///
    /// `force_refresh` bypasses the blackout and cooldown checks but still
    /// falls back to the cache if the live attempt fails softly.
    ///
    /// # Errors
    /// - [`StatusError::NoDataAvailable`] if a fallback was needed and
    ///   nothing is cached under `cache_key`.
    /// - Hard upstream failures such as [`StatusError::UpstreamRejected`]
    ///   are returned unchanged.
    pub async fn fetch_or_cached(
        &self,
        instance: &Instance,
        query: &Query,
        cache_key: &str,
        force_refresh: bool,
    ) -> Result<Fetched> {
        let now = self.clock.now();
        match self
            .resolve_at(now, instance, query, cache_key, force_refresh)
            .await
        {
            FetchOutcome::Live(rows) => Ok(Fetched {
                rows,
                source: Source::Live,
                written_at: now,
                fallback: None,
            }),
            FetchOutcome::CachedFallback(entry, reason) => Ok(Fetched {
                rows: entry.rows()?,
                source: Source::Cache,
                written_at: entry.written_at,
                fallback: Some(reason),
            }),
            FetchOutcome::Failed(e) => Err(e),
        }
    }

    /// Runs the decision algorithm and reports which path produced the
    /// answer.
    pub async fn resolve(
        &self,
        instance: &Instance,
        query: &Query,
        cache_key: &str,
        force_refresh: bool,
    ) -> FetchOutcome {
        self.resolve_at(self.clock.now(), instance, query, cache_key, force_refresh)
            .await
    }

    /// Decides at `now`; live rows are cached with `now` as `written_at`.
    #[instrument(skip(self, query), fields(instance = %instance))]
    async fn resolve_at(
        &self,
        now: DateTime<Utc>,
        instance: &Instance,
        query: &Query,
        cache_key: &str,
        force_refresh: bool,
    ) -> FetchOutcome {
        if !force_refresh {
            if self.blackout.is_blackout(now) {
                debug!("Inside blackout window, skipping live fetch");
                return self.fallback(cache_key, FallbackReason::Blackout).await;
            }
            if self.cooldown.is_cooling_down(instance, now) {
                debug!(
                    until = ?self.cooldown.cooling_until(instance),
                    "Instance cooling down, skipping live fetch"
                );
                return self.fallback(cache_key, FallbackReason::Cooldown).await;
            }
        }

        match self.remote.fetch(instance, query).await {
            Ok(rows) => {
                self.store(cache_key, &rows, now).await;
                self.cooldown.clear(instance);
                FetchOutcome::Live(rows)
            }
            Err(e) => match FallbackReason::from_error(&e) {
                Some(reason) => {
                    warn!(error = %e, "Live fetch failed, falling back to cache");
                    self.cooldown.mark_failure(instance, self.clock.now());
                    self.fallback(cache_key, reason).await
                }
                None => {
                    warn!(error = %e, "Live fetch failed hard");
                    FetchOutcome::Failed(e)
                }
            },
        }
    }

    async fn store(&self, cache_key: &str, rows: &[Row], now: DateTime<Utc>) {
        let value = Value::Array(rows.iter().cloned().map(Value::Object).collect());
        if let Err(e) = self.cache.set(cache_key, &value, now).await {
            warn!(cache_key, error = %e, "Failed to cache live rows");
        }
    }

    async fn fallback(&self, cache_key: &str, reason: FallbackReason) -> FetchOutcome {
        match self.cache.get(cache_key).await {
            Ok(Some(entry)) => {
                info!(
                    cache_key,
                    %reason,
                    written_at = %entry.written_at,
                    "Serving cached data"
                );
                FetchOutcome::CachedFallback(entry, reason)
            }
            Ok(None) => FetchOutcome::Failed(StatusError::NoDataAvailable {
                cache_key: cache_key.to_string(),
            }),
            Err(e) => FetchOutcome::Failed(e),
        }
    }
}
