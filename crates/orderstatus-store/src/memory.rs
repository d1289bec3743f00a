//! In-memory cache and job store implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orderstatus_core::{
    CacheEntry, CacheStore, Job, JobId, JobStore, JobUpdate, Result, StatusError,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Simple in-memory cache for tests and single-process deployments.
///
/// Entries are stored in a `RwLock`-protected `HashMap` and are lost when the
/// cache is dropped. A `set` swaps the whole entry under the write lock, so
/// readers never observe a partial value.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    /// Create a new empty in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let cache = self.entries.read().await;
        match cache.get(key) {
            Some(entry) => {
                debug!("Cache hit");
                Ok(Some(entry.clone()))
            }
            None => {
                debug!("Cache miss");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, value))]
    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        written_at: DateTime<Utc>,
    ) -> Result<()> {
        let entry = CacheEntry::new(key, value.clone(), written_at);
        self.entries.write().await.insert(key.to_string(), entry);
        debug!("Cached entry");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear(&self, keys: Option<&[String]>) -> Result<usize> {
        let mut cache = self.entries.write().await;
        let removed = match keys {
            Some(keys) => keys.iter().filter(|k| cache.remove(*k).is_some()).count(),
            None => {
                let n = cache.len();
                cache.clear();
                n
            }
        };
        debug!("Cleared {} cache entries", removed);
        Ok(removed)
    }
}

/// In-memory job store.
///
/// Each `update` reads, applies and writes the job under one write lock.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    /// Create a new empty job store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn create(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StatusError::Cache(format!("Job {} already exists", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        debug!("Created job");
        Ok(())
    }

    #[instrument(skip(self, update), fields(job_id = %id))]
    async fn update(&self, id: &JobId, update: &JobUpdate, now: DateTime<Utc>) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StatusError::JobNotFound(id.to_string()))?;
        job.apply(update, now)?;
        Ok(job.clone())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }
}
