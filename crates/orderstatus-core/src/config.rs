//! Resilience settings consumed at construction time.
//!
//! [`ResilienceConfig`] carries every tunable the fetch and job layers use:
//! HTTP timeouts, retry policy, the blackout window, cooldown length, stall
//! threshold and worker pool size. Nothing in the algorithms hardcodes these.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, StatusError};

/// Prefix for environment overrides read by [`ResilienceConfig::from_env`].
pub const ENV_PREFIX: &str = "ORDERSTATUS_";

/// Daily window during which live upstream calls are avoided.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutConfig {
    /// Local start time (inclusive).
    pub start: NaiveTime,
    /// Local end time (exclusive).
    pub end: NaiveTime,
    /// Zone in which `start` and `end` are interpreted.
    pub zone: Tz,
}

impl Default for BlackoutConfig {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(10, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
            zone: chrono_tz::Australia::Sydney,
        }
    }
}

/// Tunables for the fetch orchestrator, remote client and job engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Bound on establishing a connection. Also the window within which a
    /// 5xx answer is considered cheap enough to retry.
    pub connect_timeout: Duration,
    /// Bound on the whole request including the response body.
    pub read_timeout: Duration,
    /// Automatic retries for a quick `UpstreamUnavailable`.
    pub max_retries: u32,
    /// Pause between retry attempts.
    pub retry_backoff: Duration,
    /// Longest GET URL before switching to POST.
    pub max_url_length: usize,
    /// Scheduled blackout window.
    pub blackout: BlackoutConfig,
    /// How long live calls to a failed instance are suppressed.
    pub cooldown: Duration,
    /// Silence after which a running job is reported as stalled.
    pub stall_threshold: Duration,
    /// Maximum number of units of work running at once.
    pub worker_pool_size: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(20),
            max_retries: 1,
            retry_backoff: Duration::from_millis(500),
            max_url_length: 2000,
            blackout: BlackoutConfig::default(),
            cooldown: Duration::from_secs(10 * 60),
            stall_threshold: Duration::from_secs(30),
            worker_pool_size: 4,
        }
    }
}

impl ResilienceConfig {
    /// Sets the connect and read timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    /// Sets the retry count and pause.
    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Sets the GET URL length limit.
    #[must_use]
    pub const fn with_max_url_length(mut self, max_url_length: usize) -> Self {
        self.max_url_length = max_url_length;
        self
    }

    /// Sets the blackout window.
    #[must_use]
    pub const fn with_blackout(mut self, blackout: BlackoutConfig) -> Self {
        self.blackout = blackout;
        self
    }

    /// Sets the cooldown duration.
    #[must_use]
    pub const fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the stall threshold.
    #[must_use]
    pub const fn with_stall_threshold(mut self, stall_threshold: Duration) -> Self {
        self.stall_threshold = stall_threshold;
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub const fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Defaults overlaid with `ORDERSTATUS_*` environment variables.
    ///
    /// # Errors
    /// Returns [`StatusError::Config`] if a variable is set but malformed, or
    /// the resulting config fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by the full
    /// variable name (e.g. `ORDERSTATUS_COOLDOWN_SECS`).
    ///
    /// # Errors
    /// Returns [`StatusError::Config`] on a malformed value or invalid result.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));
        let mut config = Self::default();

        if let Some(v) = get("CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(parse_var("CONNECT_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("READ_TIMEOUT_SECS") {
            config.read_timeout = Duration::from_secs(parse_var("READ_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("MAX_RETRIES") {
            config.max_retries = parse_var("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(parse_var("RETRY_BACKOFF_MS", &v)?);
        }
        if let Some(v) = get("MAX_URL_LENGTH") {
            config.max_url_length = parse_var("MAX_URL_LENGTH", &v)?;
        }
        if let Some(v) = get("BLACKOUT_START") {
            config.blackout.start = parse_time("BLACKOUT_START", &v)?;
        }
        if let Some(v) = get("BLACKOUT_END") {
            config.blackout.end = parse_time("BLACKOUT_END", &v)?;
        }
        if let Some(v) = get("BLACKOUT_TZ") {
            config.blackout.zone = parse_var("BLACKOUT_TZ", &v)?;
        }
        if let Some(v) = get("COOLDOWN_SECS") {
            config.cooldown = Duration::from_secs(parse_var("COOLDOWN_SECS", &v)?);
        }
        if let Some(v) = get("STALL_THRESHOLD_SECS") {
            config.stall_threshold = Duration::from_secs(parse_var("STALL_THRESHOLD_SECS", &v)?);
        }
        if let Some(v) = get("WORKER_POOL_SIZE") {
            config.worker_pool_size = parse_var("WORKER_POOL_SIZE", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    /// Returns [`StatusError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(StatusError::Config("timeouts must be non-zero".into()));
        }
        if self.connect_timeout > self.read_timeout {
            return Err(StatusError::Config(format!(
                "connect timeout {:?} exceeds read timeout {:?}",
                self.connect_timeout, self.read_timeout
            )));
        }
        if self.worker_pool_size == 0 {
            return Err(StatusError::Config(
                "worker pool needs at least one worker".into(),
            ));
        }
        if self.max_url_length == 0 {
            return Err(StatusError::Config("max URL length must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| StatusError::Config(format!("{ENV_PREFIX}{key}={value}: {e}")))
}

fn parse_time(key: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| StatusError::Config(format!("{ENV_PREFIX}{key}={value}: {e}")))
}
