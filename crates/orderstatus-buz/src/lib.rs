#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/watsonblinds/orderstatus/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Buz Manager OData remote client.
//!
//! This crate provides [`BuzClient`], the [`RemoteClient`] implementation for
//! the Buz Manager reporting API. Each upstream [`Instance`] has its own
//! root URL and HTTP Basic credentials.
//!
//! # Features
//!
//! - Separate connect (short) and overall read (long) timeouts
//! - One automatic retry for a quick 5xx/429 answer
//! - Transparent GET → POST `$query` switch for long filters
//! - Failure classification into soft (fall back) and hard (fatal) errors
//! - A forced-503 switch for exercising fallback paths without the network
//!
//! # Example
//!
//! ```no_run
//! use orderstatus_buz::BuzClient;
//! use orderstatus_core::{Instance, Query, RemoteClient, ResilienceConfig};
//!
//! # async fn example() -> orderstatus_core::Result<()> {
//! let client = BuzClient::from_env(&ResilienceConfig::default())?;
//! let query = Query::new("JobsScheduleDetailed")
//!     .filter("OrderStatus eq 'Work in Progress'");
//!
//! let rows = client.fetch(&Instance::new("DD"), &query).await?;
//! println!("Fetched {} rows", rows.len());
//! # Ok(())
//! # }
//! ```

mod odata;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use orderstatus_core::{
    Instance, Query, RemoteClient, ResilienceConfig, Result, Row, StatusError, TimeoutPhase,
};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::odata::PreparedRequest;

/// Root URL of the `DD` instance.
pub const DD_ROOT_URL: &str = "http://api.buzmanager.com/reports/DESDR";

/// Root URL of the `CBR` instance.
pub const CBR_ROOT_URL: &str = "http://api.buzmanager.com/reports/WATSO";

/// Environment variable that forces every fetch to fail with a synthetic 503.
pub const FORCE_UNAVAILABLE_VAR: &str = "BUZ_FORCE_503";

/// Longest slice of an error body kept in [`StatusError::UpstreamRejected`].
const MAX_ERROR_BODY: usize = 500;

/// Connection details for one upstream instance.
#[derive(Clone)]
pub struct InstanceEndpoint {
    root_url: String,
    username: String,
    password: String,
}

impl InstanceEndpoint {
    /// Creates endpoint details.
    #[must_use]
    pub fn new(
        root_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            root_url: root_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the root URL.
    #[must_use]
    pub fn root_url(&self) -> &str {
        &self.root_url
    }
}

impl fmt::Debug for InstanceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceEndpoint")
            .field("root_url", &self.root_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Buz Manager OData client.
///
/// Implements [`RemoteClient`].
#[derive(Debug)]
pub struct BuzClient {
    client: reqwest::Client,
    endpoints: HashMap<Instance, InstanceEndpoint>,
    connect_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    max_url_length: usize,
    force_unavailable: bool,
}

impl BuzClient {
    /// Create a client with no instances registered.
    ///
    /// # Errors
    /// Returns [`StatusError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &ResilienceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|e| StatusError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, config))
    }

    /// Create a client around an existing HTTP client.
    ///
    /// The caller is responsible for the client's timeouts.
    #[must_use]
    pub fn with_client(client: reqwest::Client, config: &ResilienceConfig) -> Self {
        Self {
            client,
            endpoints: HashMap::new(),
            connect_timeout: config.connect_timeout,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            max_url_length: config.max_url_length,
            force_unavailable: false,
        }
    }

    /// Create a client for the `DD` and `CBR` instances from the environment.
    ///
    /// Reads `BUZ_<INSTANCE>_USERNAME`, `BUZ_<INSTANCE>_PASSWORD` and the
    /// optional `BUZ_<INSTANCE>_URL`. An instance without a username is left
    /// unregistered. `BUZ_FORCE_503=1` enables the forced-failure switch.
    ///
    /// # Errors
    /// Returns [`StatusError::Config`] if the HTTP client cannot be built.
    pub fn from_env(config: &ResilienceConfig) -> Result<Self> {
        Self::from_lookup(config, |name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    ///
    /// # Errors
    /// Returns [`StatusError::Config`] if the HTTP client cannot be built.
    pub fn from_lookup(
        config: &ResilienceConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut client = Self::new(config)?;
        for (name, default_url) in [("DD", DD_ROOT_URL), ("CBR", CBR_ROOT_URL)] {
            let Some(username) = lookup(&format!("BUZ_{name}_USERNAME")) else {
                debug!(instance = name, "No credentials configured, skipping");
                continue;
            };
            let password = lookup(&format!("BUZ_{name}_PASSWORD")).unwrap_or_default();
            let url = lookup(&format!("BUZ_{name}_URL")).unwrap_or_else(|| default_url.to_string());
            client = client.with_instance(name, InstanceEndpoint::new(url, username, password));
        }
        let forced = lookup(FORCE_UNAVAILABLE_VAR)
            .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"));
        Ok(client.with_forced_failure(forced))
    }

    /// Register an instance.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<Instance>, endpoint: InstanceEndpoint) -> Self {
        self.endpoints.insert(instance.into(), endpoint);
        self
    }

    /// Make every fetch fail with a synthetic 503, without touching the network.
    ///
    /// Intended for tests and drills of the cache fallback path.
    #[must_use]
    pub const fn with_forced_failure(mut self, on: bool) -> Self {
        self.force_unavailable = on;
        self
    }

    /// Returns the registered instances.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.endpoints.keys()
    }

    fn endpoint(&self, instance: &Instance) -> Result<&InstanceEndpoint> {
        self.endpoints
            .get(instance)
            .ok_or_else(|| StatusError::InstanceNotConfigured(instance.to_string()))
    }

    /// Sends one attempt and classifies the outcome.
    async fn execute(
        &self,
        instance: &Instance,
        endpoint: &InstanceEndpoint,
        request: &PreparedRequest,
    ) -> Result<Vec<Row>> {
        let builder = match request {
            PreparedRequest::Get { url } => self.client.get(url),
            PreparedRequest::Post { url, body } => self
                .client
                .post(url)
                .header(CONTENT_TYPE, "text/plain")
                .body(body.clone()),
        };

        let response = builder
            .basic_auth(&endpoint.username, Some(&endpoint.password))
            .send()
            .await
            .map_err(|e| classify_transport(instance, &e))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(StatusError::UpstreamUnavailable {
                instance: instance.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(
                message
                    .char_indices()
                    .nth(MAX_ERROR_BODY)
                    .map_or(message.len(), |(i, _)| i),
            );
            return Err(StatusError::UpstreamRejected {
                instance: instance.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(instance, &e))?;
        odata::parse_rows(instance, &body)
    }
}

/// Maps a reqwest failure onto the error taxonomy.
fn classify_transport(instance: &Instance, error: &reqwest::Error) -> StatusError {
    if error.is_timeout() {
        let phase = if error.is_connect() {
            TimeoutPhase::Connect
        } else {
            TimeoutPhase::Read
        };
        return StatusError::Timeout {
            instance: instance.clone(),
            phase,
        };
    }
    StatusError::Connection(format!("{instance}: {error}"))
}

#[async_trait]
impl RemoteClient for BuzClient {
    fn name(&self) -> &str {
        "Buz OData"
    }

    #[instrument(skip(self, query), fields(instance = %instance, endpoint = %query.endpoint))]
    async fn fetch(&self, instance: &Instance, query: &Query) -> Result<Vec<Row>> {
        if self.force_unavailable {
            warn!("Forced upstream failure is enabled, not calling upstream");
            return Err(StatusError::UpstreamUnavailable {
                instance: instance.clone(),
                status: 503,
            });
        }

        let endpoint = self.endpoint(instance)?;
        let request = odata::prepare(&endpoint.root_url, query, self.max_url_length);
        if matches!(request, PreparedRequest::Post { .. }) {
            debug!(url = request.url(), "Query too long for GET, using POST");
        }

        let mut retries = 0;
        loop {
            let started = Instant::now();
            match self.execute(instance, endpoint, &request).await {
                Err(StatusError::UpstreamUnavailable { status, .. })
                    if retries < self.max_retries && started.elapsed() <= self.connect_timeout =>
                {
                    retries += 1;
                    warn!(status, retries, "Upstream unavailable, retrying");
                    sleep(self.retry_backoff).await;
                }
                Ok(rows) => {
                    debug!(rows = rows.len(), "Fetched rows");
                    return Ok(rows);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, body_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const JOBS_PATH: &str = "/reports/DESDR/JobsScheduleDetailed";

    fn test_config() -> ResilienceConfig {
        ResilienceConfig::default()
            .with_timeouts(Duration::from_millis(250), Duration::from_secs(2))
            .with_retries(1, Duration::ZERO)
    }

    fn client_for(server: &MockServer, config: &ResilienceConfig) -> BuzClient {
        BuzClient::new(config).unwrap().with_instance(
            "DD",
            InstanceEndpoint::new(format!("{}/reports/DESDR", server.uri()), "user", "secret"),
        )
    }

    fn wip_query() -> Query {
        Query::new("JobsScheduleDetailed").filter("OrderStatus eq 'Work in Progress'")
    }

    fn odata_body() -> serde_json::Value {
        json!({"value": [{"RefNo": "A1", "ProductionStatus": "Cutting"}]})
    }

    #[tokio::test]
    async fn test_fetch_success_uses_get_with_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JOBS_PATH))
            .and(query_param("$filter", "OrderStatus eq 'Work in Progress'"))
            .and(basic_auth("user", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(odata_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, &test_config());
        let rows = client.fetch(&Instance::new("DD"), &wip_query()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["RefNo"], "A1");
        assert_eq!(rows[0]["Instance"], "DD");
    }

    #[tokio::test]
    async fn test_long_query_posts_same_filter() {
        let server = MockServer::start().await;
        let names: Vec<String> = (0..100).map(|i| format!("'Customer {i}'")).collect();
        let query = wip_query().filter(format!("Customer in ({})", names.join(", ")));

        Mock::given(method("POST"))
            .and(path(format!("{JOBS_PATH}/$query")))
            .and(body_string(odata::query_string(&query)))
            .respond_with(ResponseTemplate::new(200).set_body_json(odata_body()))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config().with_max_url_length(300);
        let client = client_for(&server, &config);
        let rows = client.fetch(&Instance::new("DD"), &query).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_quick_503_is_retried_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JOBS_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(JOBS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(odata_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, &test_config());
        let rows = client.fetch(&Instance::new("DD"), &wip_query()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_503_gives_up_after_one_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JOBS_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server, &test_config());
        let err = client
            .fetch(&Instance::new("DD"), &wip_query())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StatusError::UpstreamUnavailable { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn test_slow_503_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JOBS_PATH))
            .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(600)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, &test_config());
        let err = client
            .fetch(&Instance::new("DD"), &wip_query())
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_429_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server, &test_config().with_retries(0, Duration::ZERO));
        let err = client
            .fetch(&Instance::new("DD"), &wip_query())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StatusError::UpstreamUnavailable { status: 429, .. }
        ));
    }

    #[tokio::test]
    async fn test_400_is_rejected_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Invalid $filter"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, &test_config());
        let err = client
            .fetch(&Instance::new("DD"), &wip_query())
            .await
            .unwrap_err();
        match err {
            StatusError::UpstreamRejected {
                status, message, ..
            } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid $filter");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_body_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(odata_body())
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, &test_config());
        let err = client
            .fetch(&Instance::new("DD"), &wip_query())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StatusError::Timeout {
                phase: TimeoutPhase::Read,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        let client = BuzClient::new(&test_config())
            .unwrap()
            .with_instance("DD", InstanceEndpoint::new("http://127.0.0.1:1/reports/DESDR", "u", "p"));
        let err = client
            .fetch(&Instance::new("DD"), &wip_query())
            .await
            .unwrap_err();
        assert!(err.is_fallback_eligible(), "got {err:?}");
        assert!(!matches!(err, StatusError::UpstreamRejected { .. }));
    }

    #[tokio::test]
    async fn test_forced_failure_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(odata_body()))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server, &test_config()).with_forced_failure(true);
        let err = client
            .fetch(&Instance::new("DD"), &wip_query())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StatusError::UpstreamUnavailable { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_instance_is_hard_failure() {
        let client = BuzClient::new(&test_config()).unwrap();
        let err = client
            .fetch(&Instance::new("XYZ"), &wip_query())
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::InstanceNotConfigured(_)));
        assert!(!err.is_fallback_eligible());
    }

    #[test]
    fn test_from_lookup_registers_configured_instances() {
        let vars: HashMap<&str, &str> = [
            ("BUZ_DD_USERNAME", "dd-user"),
            ("BUZ_DD_PASSWORD", "dd-pass"),
            ("BUZ_FORCE_503", "1"),
        ]
        .into_iter()
        .collect();
        let client = BuzClient::from_lookup(&ResilienceConfig::default(), |k| {
            vars.get(k).map(|v| (*v).to_string())
        })
        .unwrap();

        let instances: Vec<_> = client.instances().collect();
        assert_eq!(instances, [&Instance::new("DD")]);
        assert_eq!(client.endpoint(&Instance::new("DD")).unwrap().root_url(), DD_ROOT_URL);
        assert!(client.force_unavailable);
    }

    #[test]
    fn test_debug_redacts_password() {
        let endpoint = InstanceEndpoint::new("http://h", "user", "hunter2");
        let debug_str = format!("{endpoint:?}");
        assert!(!debug_str.contains("hunter2"));
        assert!(debug_str.contains("[REDACTED]"));
    }
}
