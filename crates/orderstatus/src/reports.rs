//! Multi-instance reports run as background jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use orderstatus_core::{
    CacheStore, Instance, JobId, JobView, Query, Result, Row, Source, StatusError,
};
use orderstatus_fetch::FetchOrchestrator;
use orderstatus_jobs::{JobContext, JobEngine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// First progress value reported by a report job.
const PROGRESS_START: u8 = 5;
/// Last progress value reported before the job completes.
const PROGRESS_END: u8 = 95;

/// A report to build across one or more instances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    /// Report name, also the cache key prefix (`<name>:<instance>`).
    pub name: String,
    /// Instances to query, in order.
    pub instances: Vec<Instance>,
    /// Query sent to every instance.
    pub query: Query,
    /// Bypass blackout and cooldown for this run.
    #[serde(default)]
    pub force_refresh: bool,
}

impl ReportRequest {
    /// Creates a request with no instances.
    #[must_use]
    pub fn new(name: impl Into<String>, query: Query) -> Self {
        Self {
            name: name.into(),
            instances: Vec::new(),
            query,
            force_refresh: false,
        }
    }

    /// Adds an instance.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<Instance>) -> Self {
        self.instances.push(instance.into());
        self
    }

    /// Sets `force_refresh`.
    #[must_use]
    pub const fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    /// Cache key used for `instance`.
    #[must_use]
    pub fn cache_key(&self, instance: &Instance) -> String {
        format!("{}:{}", self.name, instance)
    }
}

/// One instance's rows within a report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    /// Instance the rows came from.
    pub instance: Instance,
    /// Live or cache.
    pub source: Source,
    /// When the rows were obtained from upstream.
    pub written_at: DateTime<Utc>,
    /// True for cache-sourced rows.
    pub stale: bool,
    /// The rows.
    pub rows: Vec<Row>,
}

/// An instance that produced no data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFailure {
    /// The instance.
    pub instance: Instance,
    /// What went wrong.
    pub error: String,
}

/// Result payload of a finished report job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Report name.
    pub name: String,
    /// Sections for instances that produced data.
    pub sections: Vec<ReportSection>,
    /// Instances that did not.
    pub failures: Vec<ReportFailure>,
}

/// Starts report jobs and answers status polls.
#[derive(Clone, Debug)]
pub struct ReportService {
    orchestrator: Arc<FetchOrchestrator>,
    engine: JobEngine,
}

impl ReportService {
    /// Creates a service over an orchestrator and a job engine.
    #[must_use]
    pub const fn new(orchestrator: Arc<FetchOrchestrator>, engine: JobEngine) -> Self {
        Self {
            orchestrator,
            engine,
        }
    }

    /// Returns the job engine.
    #[must_use]
    pub const fn engine(&self) -> &JobEngine {
        &self.engine
    }

    /// Creates a job for `request`, schedules it and returns its id without
    /// waiting.
    ///
    /// # Errors
    /// Returns [`StatusError::Job`] for a request with no instances, or the
    /// job store's error if the job cannot be created.
    #[instrument(skip(self, request), fields(report = %request.name))]
    pub async fn request_report(&self, request: ReportRequest) -> Result<JobId> {
        if request.instances.is_empty() {
            return Err(StatusError::Job(format!(
                "report {} names no instances",
                request.name
            )));
        }

        let job_id = self.engine.create_job().await?;
        let orchestrator = Arc::clone(&self.orchestrator);
        self.engine.schedule(job_id.clone(), move |ctx| async move {
            let report = build_report(&ctx, &orchestrator, &request).await?;
            serde_json::to_value(report).map_err(|e| StatusError::Parse(e.to_string()))
        });
        info!(job_id = %job_id, "Report scheduled");
        Ok(job_id)
    }

    /// Returns the job's current view, or `None` for an unknown id.
    ///
    /// # Errors
    /// Returns the job store's error if the lookup fails.
    pub async fn job_status(&self, job_id: &JobId) -> Result<Option<JobView>> {
        self.engine.job_view(job_id).await
    }

    /// Removes cached data for `keys`, or everything when `None`.
    ///
    /// # Errors
    /// Returns the cache store's error.
    pub async fn clear_cache(&self, keys: Option<&[String]>) -> Result<usize> {
        let cache: &Arc<dyn CacheStore> = self.orchestrator.cache();
        cache.clear(keys).await
    }
}

/// The unit of work behind a report job.
async fn build_report(
    ctx: &JobContext,
    orchestrator: &FetchOrchestrator,
    request: &ReportRequest,
) -> Result<Report> {
    let total = request.instances.len();
    let mut sections = Vec::with_capacity(total);
    let mut failures = Vec::new();

    for (i, instance) in request.instances.iter().enumerate() {
        if ctx.is_cancelled() {
            return Err(StatusError::Job("report cancelled".into()));
        }
        let step = usize::from(PROGRESS_END - PROGRESS_START) * i / total;
        let pct = PROGRESS_START + u8::try_from(step).unwrap_or(0);
        ctx.progress(pct, format!("Fetching {instance}")).await;

        let cache_key = request.cache_key(instance);
        match orchestrator
            .fetch_or_cached(instance, &request.query, &cache_key, request.force_refresh)
            .await
        {
            Ok(fetched) => {
                let stale = fetched.is_possibly_stale();
                if stale {
                    ctx.log(format!(
                        "{instance}: served cached data from {}",
                        fetched.written_at
                    ))
                    .await;
                } else {
                    ctx.log(format!("{instance}: live data")).await;
                }
                sections.push(ReportSection {
                    instance: instance.clone(),
                    source: fetched.source,
                    written_at: fetched.written_at,
                    stale,
                    rows: fetched.rows,
                });
            }
            Err(e) => {
                warn!(instance = %instance, error = %e, "Report section failed");
                ctx.log(format!("{instance}: {e}")).await;
                failures.push(ReportFailure {
                    instance: instance.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    if sections.is_empty() {
        let joined = failures
            .iter()
            .map(|f| format!("{}: {}", f.instance, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(StatusError::Job(joined));
    }

    ctx.progress(PROGRESS_END, "Report ready").await;
    debug!(
        sections = sections.len(),
        failures = failures.len(),
        "Report built"
    );
    Ok(Report {
        name: request.name.clone(),
        sections,
        failures,
    })
}
