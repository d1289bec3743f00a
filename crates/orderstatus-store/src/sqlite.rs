//! SQLite-based cache and job store implementations.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use orderstatus_core::{
    CacheEntry, CacheStore, Job, JobId, JobStatus, JobStore, JobUpdate, LogEntry, Result,
    StatusError,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument};

fn open(path: impl AsRef<Path>) -> Result<Connection> {
    Connection::open(path).map_err(|e| StatusError::Cache(e.to_string()))
}

fn open_in_memory() -> Result<Connection> {
    Connection::open_in_memory().map_err(|e| StatusError::Cache(e.to_string()))
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| StatusError::Cache(e.to_string()))
}

fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StatusError::Parse(format!("Invalid timestamp {s}: {e}")))
}

/// SQLite-based cache for upstream payloads.
///
/// Stores one row per key; every write is a single upsert statement, so a
/// reader sees either the previous payload or the new one, never a mix.
#[derive(Debug)]
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Create a new SQLite cache at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema creation fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let cache = Self {
            conn: Mutex::new(open(path)?),
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    /// Create an in-memory SQLite cache.
    ///
    /// Useful for testing; data is lost when the cache is dropped.
    ///
    /// # Errors
    /// Returns an error if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let cache = Self {
            conn: Mutex::new(open_in_memory()?),
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache (
                cache_key TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                written_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StatusError::Cache(e.to_string()))?;

        debug!("SQLite cache schema initialized");
        Ok(())
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT payload_json, written_at FROM cache WHERE cache_key = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| StatusError::Cache(e.to_string()))?;

        match row {
            Some((json, written_at)) => {
                let value =
                    serde_json::from_str(&json).map_err(|e| StatusError::Parse(e.to_string()))?;
                debug!("Cache hit");
                Ok(Some(CacheEntry::new(key, value, from_db_time(&written_at)?)))
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
        let json = serde_json::to_string(value).map_err(|e| StatusError::Parse(e.to_string()))?;
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO cache (cache_key, payload_json, written_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(cache_key) DO UPDATE SET
                payload_json = excluded.payload_json,
                written_at = excluded.written_at",
            params![key, json, to_db_time(written_at)],
        )
        .map_err(|e| StatusError::Cache(e.to_string()))?;

        debug!("Cached entry");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear(&self, keys: Option<&[String]>) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let removed = match keys {
            Some(keys) => {
                let tx = conn
                    .unchecked_transaction()
                    .map_err(|e| StatusError::Cache(e.to_string()))?;
                let mut removed = 0usize;
                for key in keys {
                    removed += tx
                        .execute("DELETE FROM cache WHERE cache_key = ?1", params![key])
                        .map_err(|e| StatusError::Cache(e.to_string()))?;
                }
                tx.commit().map_err(|e| StatusError::Cache(e.to_string()))?;
                removed
            }
            None => conn
                .execute("DELETE FROM cache", [])
                .map_err(|e| StatusError::Cache(e.to_string()))?,
        };

        debug!("Cleared {} cache entries", removed);
        Ok(removed)
    }
}

/// SQLite-based job store.
///
/// Updates run inside a transaction: the row is read, passed through
/// [`Job::apply`], and written back before the lock is released.
#[derive(Debug)]
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Create a new SQLite job store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema creation fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(open(path)?),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite job store.
    ///
    /// # Errors
    /// Returns an error if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(open_in_memory()?),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                log_json TEXT NOT NULL DEFAULT '[]',
                result_json TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StatusError::Cache(e.to_string()))?;

        debug!("SQLite job schema initialized");
        Ok(())
    }

    fn read_job(conn: &Connection, id: &JobId) -> Result<Option<Job>> {
        let raw = conn
            .query_row(
                "SELECT id, status, progress, log_json, result_json, error, created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![id.as_str()],
                RawJob::from_row,
            )
            .optional()
            .map_err(|e| StatusError::Cache(e.to_string()))?;
        raw.map(RawJob::into_job).transpose()
    }

    fn write_job(conn: &Connection, job: &Job) -> Result<()> {
        let log_json =
            serde_json::to_string(&job.log).map_err(|e| StatusError::Parse(e.to_string()))?;
        let result_json = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StatusError::Parse(e.to_string()))?;

        conn.execute(
            "UPDATE jobs
                SET status = ?2, progress = ?3, log_json = ?4, result_json = ?5,
                    error = ?6, updated_at = ?7
              WHERE id = ?1",
            params![
                job.id.as_str(),
                job.status.as_str(),
                job.progress,
                log_json,
                result_json,
                job.error,
                to_db_time(job.updated_at),
            ],
        )
        .map_err(|e| StatusError::Cache(e.to_string()))?;
        Ok(())
    }
}

/// Column values of one `jobs` row before decoding.
struct RawJob {
    id: String,
    status: String,
    progress: u8,
    log_json: String,
    result_json: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            progress: row.get(2)?,
            log_json: row.get(3)?,
            result_json: row.get(4)?,
            error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let log: Vec<LogEntry> =
            serde_json::from_str(&self.log_json).map_err(|e| StatusError::Parse(e.to_string()))?;
        let result = self
            .result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StatusError::Parse(e.to_string()))?;

        Ok(Job {
            id: JobId::new(self.id),
            status: self.status.parse::<JobStatus>()?,
            progress: self.progress,
            log,
            result,
            error: self.error,
            created_at: from_db_time(&self.created_at)?,
            updated_at: from_db_time(&self.updated_at)?,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn create(&self, job: &Job) -> Result<()> {
        let log_json =
            serde_json::to_string(&job.log).map_err(|e| StatusError::Parse(e.to_string()))?;
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO jobs (id, status, progress, log_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id.as_str(),
                job.status.as_str(),
                job.progress,
                log_json,
                to_db_time(job.created_at),
                to_db_time(job.updated_at),
            ],
        )
        .map_err(|e| StatusError::Cache(e.to_string()))?;

        debug!("Created job");
        Ok(())
    }

    #[instrument(skip(self, update), fields(job_id = %id))]
    async fn update(&self, id: &JobId, update: &JobUpdate, now: DateTime<Utc>) -> Result<Job> {
        let conn = lock(&self.conn)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StatusError::Cache(e.to_string()))?;

        let mut job =
            Self::read_job(&tx, id)?.ok_or_else(|| StatusError::JobNotFound(id.to_string()))?;
        job.apply(update, now)?;
        Self::write_job(&tx, &job)?;

        tx.commit().map_err(|e| StatusError::Cache(e.to_string()))?;
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let conn = lock(&self.conn)?;
        Self::read_job(&conn, id)
    }
}
