//! Background job records and the store that persists them.
//!
//! A [`Job`] moves through `pending → running → done | error`. All mutation
//! goes through [`Job::apply`], which both [`JobStore`] backends call while
//! holding their write lock, so lifecycle rules live in one place.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StatusError};

/// Opaque unique job identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps an existing id string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored job status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, work not yet started.
    Pending,
    /// A worker is executing the unit of work.
    Running,
    /// Finished successfully; `result` is set.
    Done,
    /// Finished with a failure; `error` is set.
    Error,
}

impl JobStatus {
    /// Returns true for `Done` and `Error`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Returns true if the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Error)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Error)
        )
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(StatusError::Parse(format!("Invalid job status: {other}"))),
        }
    }
}

/// One timestamped log line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line was appended.
    pub at: DateTime<Utc>,
    /// The message.
    pub message: String,
}

/// A background job record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: JobId,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Progress percentage, 0 to 100.
    pub progress: u8,
    /// Append-only log.
    pub log: Vec<LogEntry>,
    /// Result payload, present only when done.
    pub result: Option<serde_json::Value>,
    /// Failure message, present only on error.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a pending job.
    #[must_use]
    pub const fn pending(id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            progress: 0,
            log: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merges an update into the record.
    ///
    /// Log lines are appended, never replaced. `updated_at` always moves
    /// forward, even if `now` has not.
    ///
    /// # Errors
    /// Returns [`StatusError::JobFinalized`] if the job is already terminal and
    /// [`StatusError::InvalidTransition`] for a status change the lifecycle
    /// does not allow. The record is left untouched on error.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(StatusError::JobFinalized(self.id.to_string()));
        }

        if let Some(expected) = update.expected {
            if self.status != expected {
                return Err(StatusError::InvalidTransition {
                    from: self.status.to_string(),
                    to: update.status.unwrap_or(self.status).to_string(),
                });
            }
        }

        if let Some(next) = update.status {
            if next != self.status && !self.status.can_transition_to(next) {
                return Err(StatusError::InvalidTransition {
                    from: self.status.to_string(),
                    to: next.to_string(),
                });
            }
        }

        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        };

        if let Some(pct) = update.progress {
            self.progress = pct.min(100);
        }
        if let Some(message) = update.message.as_deref().map(str::trim) {
            if !message.is_empty() {
                self.log.push(LogEntry {
                    at: self.updated_at,
                    message: message.to_string(),
                });
            }
        }
        if let Some(next) = update.status {
            self.status = next;
        }
        match self.status {
            JobStatus::Done => {
                self.progress = 100;
                self.result = update.result.clone();
            }
            JobStatus::Error => {
                self.error = update.error.clone();
            }
            JobStatus::Pending | JobStatus::Running => {}
        }
        Ok(())
    }

    /// Derives the poller-facing view at `now`.
    ///
    /// A running job with no update for longer than `stall_threshold` is
    /// reported as [`JobState::Stalled`].
    #[must_use]
    pub fn view(&self, now: DateTime<Utc>, stall_threshold: Duration) -> JobView {
        let state = match self.status {
            JobStatus::Pending => JobState::Pending,
            JobStatus::Running if now - self.updated_at > stall_threshold => JobState::Stalled,
            JobStatus::Running => JobState::Running,
            JobStatus::Done => JobState::Done,
            JobStatus::Error => JobState::Error,
        };
        JobView {
            id: self.id.clone(),
            state,
            done: self.status.is_terminal(),
            progress: self.progress,
            log: self.log.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// A set of fields to merge into a job.
///
/// Built with the constructor methods so that `result` only travels with
/// `done` and `error` only with the error status.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobUpdate {
    status: Option<JobStatus>,
    expected: Option<JobStatus>,
    progress: Option<u8>,
    message: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl JobUpdate {
    /// An empty update (touches `updated_at` only).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the job as running.
    #[must_use]
    pub fn running() -> Self {
        Self {
            status: Some(JobStatus::Running),
            ..Self::default()
        }
    }

    /// Claims a pending job for a worker.
    ///
    /// Unlike [`running`](Self::running) this fails once another worker has
    /// claimed the job.
    #[must_use]
    pub fn start() -> Self {
        Self::running().only_if(JobStatus::Pending)
    }

    /// Marks the job as done with a result.
    #[must_use]
    pub fn done(result: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Done),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Marks the job as failed.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Sets the progress percentage.
    #[must_use]
    pub const fn with_progress(mut self, pct: u8) -> Self {
        self.progress = Some(pct);
        self
    }

    /// Appends a log message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Applies only while the job is in `status`; otherwise the update
    /// fails with [`StatusError::InvalidTransition`].
    #[must_use]
    pub const fn only_if(mut self, status: JobStatus) -> Self {
        self.expected = Some(status);
        self
    }

    /// Requested status, if any.
    #[must_use]
    pub const fn status(&self) -> Option<JobStatus> {
        self.status
    }
}

/// Poller-facing job state, including the derived `Stalled` state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Not started yet.
    Pending,
    /// Running and recently updated.
    Running,
    /// Running but silent for longer than the stall threshold.
    Stalled,
    /// Finished successfully.
    Done,
    /// Finished with a failure.
    Error,
}

/// Snapshot of a job for pollers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    /// Job id.
    pub id: JobId,
    /// Derived state.
    pub state: JobState,
    /// True once the job is done or failed.
    pub done: bool,
    /// Progress percentage.
    pub progress: u8,
    /// Log lines in order.
    pub log: Vec<LogEntry>,
    /// Result payload.
    pub result: Option<serde_json::Value>,
    /// Failure message.
    pub error: Option<String>,
    /// Time of the last update.
    pub updated_at: DateTime<Utc>,
}

/// Persistence for job records.
///
/// Implementations must make `update` atomic per job: read, [`Job::apply`],
/// and write happen under one lock or transaction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job.
    ///
    /// Returns an error if a job with the same id already exists.
    async fn create(&self, job: &Job) -> Result<()>;

    /// Merges `update` into the job and returns the new record.
    async fn update(&self, id: &JobId, update: &JobUpdate, now: DateTime<Utc>) -> Result<Job>;

    /// Reads a job by id.
    async fn get(&self, id: &JobId) -> Result<Option<Job>>;
}
