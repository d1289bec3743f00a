//! Bounded background execution of report jobs.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use orderstatus_core::{
    Clock, Job, JobId, JobStatus, JobStore, JobUpdate, JobView, ResilienceConfig, Result,
    StatusError, SystemClock,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Error recorded for queued work that never started.
pub const SHUTDOWN_MESSAGE: &str = "job engine shut down";

/// Observer notified of every progress report.
///
/// Errors and panics raised by a listener are logged and otherwise ignored.
#[async_trait]
pub trait ProgressListener: Send + Sync {
    /// Called after a unit of work reports progress.
    async fn on_progress(&self, job_id: &JobId, progress: u8, message: &str) -> Result<()>;
}

/// Runs units of work on a bounded pool and records their lifecycle in a
/// [`JobStore`].
///
/// The engine is cheap to clone; clones share the pool, store and liveness
/// flag.
#[derive(Clone)]
pub struct JobEngine {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    stall_threshold: chrono::Duration,
    shut_down: Arc<AtomicBool>,
    listeners: Vec<Arc<dyn ProgressListener>>,
}

impl fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEngine")
            .field("available_workers", &self.permits.available_permits())
            .field("stall_threshold", &self.stall_threshold)
            .field("shut_down", &self.is_shut_down())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl JobEngine {
    /// Creates an engine with `config.worker_pool_size` workers.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, config: &ResilienceConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            permits: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            stall_threshold: chrono::Duration::from_std(config.stall_threshold)
                .unwrap_or(chrono::Duration::MAX),
            shut_down: Arc::new(AtomicBool::new(false)),
            listeners: Vec::new(),
        }
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adds a progress listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Allocates a pending job.
    ///
    /// # Errors
    /// Returns the store's error if the record cannot be created.
    pub async fn create_job(&self) -> Result<JobId> {
        let id = JobId::generate();
        self.store.create(&Job::pending(id.clone(), self.clock.now())).await?;
        debug!(job_id = %id, "Created job");
        Ok(id)
    }

    /// Queues `work` for `job_id` and returns without waiting for it.
    ///
    /// The engine marks the job running when a worker picks it up, then done
    /// with the returned value or error with the returned error. A panic
    /// inside `work` is recorded as an error.
    pub fn schedule<F, Fut>(&self, job_id: JobId, work: F) -> JoinHandle<()>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(job_id, work).await })
    }

    #[instrument(skip(self, work), fields(job_id = %job_id))]
    async fn run<F, Fut>(self, job_id: JobId, work: F)
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits).acquire_owned().await;
        let _permit = match permit {
            Ok(permit) if !self.is_shut_down() => permit,
            _ => {
                let update = JobUpdate::failed(SHUTDOWN_MESSAGE).only_if(JobStatus::Pending);
                self.finish(&job_id, update).await;
                return;
            }
        };

        match self.update_job(&job_id, &JobUpdate::start()).await {
            Ok(_) => {}
            Err(e @ (StatusError::InvalidTransition { .. } | StatusError::JobFinalized(_))) => {
                warn!(error = %e, "Job already claimed, skipping");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Could not start job");
                let update = JobUpdate::failed(format!("could not start job: {e}"))
                    .only_if(JobStatus::Pending);
                self.finish(&job_id, update).await;
                return;
            }
        }

        let ctx = JobContext {
            job_id: job_id.clone(),
            engine: self.clone(),
        };
        let outcome = AssertUnwindSafe(async move { work(ctx).await })
            .catch_unwind()
            .await;

        let update = match outcome {
            Ok(Ok(result)) => JobUpdate::done(result),
            Ok(Err(e)) => {
                warn!(error = %e, "Job failed");
                JobUpdate::failed(e.to_string())
            }
            Err(panic) => {
                let message = format!("job panicked: {}", panic_message(panic.as_ref()));
                warn!(%message, "Job failed");
                JobUpdate::failed(message)
            }
        };
        self.finish(&job_id, update).await;
    }

    async fn finish(&self, job_id: &JobId, update: JobUpdate) {
        if let Err(e) = self.update_job(job_id, &update).await {
            warn!(job_id = %job_id, error = %e, "Could not record job outcome");
        }
    }

    /// Merges `update` into the job record.
    ///
    /// # Errors
    /// Returns [`orderstatus_core::StatusError::JobNotFound`],
    /// [`orderstatus_core::StatusError::JobFinalized`] or
    /// [`orderstatus_core::StatusError::InvalidTransition`] from the store.
    pub async fn update_job(&self, job_id: &JobId, update: &JobUpdate) -> Result<Job> {
        self.store.update(job_id, update, self.clock.now()).await
    }

    /// Returns the raw job record.
    ///
    /// # Errors
    /// Returns the store's error if the lookup fails.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.store.get(job_id).await
    }

    /// Returns the poller-facing view, with stalled jobs flagged.
    ///
    /// # Errors
    /// Returns the store's error if the lookup fails.
    pub async fn job_view(&self, job_id: &JobId) -> Result<Option<JobView>> {
        let job = self.store.get(job_id).await?;
        Ok(job.map(|job| job.view(self.clock.now(), self.stall_threshold)))
    }

    /// Stops accepting work. Queued work that has not started is recorded as
    /// failed; running work sees [`JobContext::is_cancelled`] turn true.
    pub fn shutdown(&self) {
        debug!("Shutting down job engine");
        self.shut_down.store(true, Ordering::SeqCst);
        self.permits.close();
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn notify(&self, job_id: &JobId, progress: u8, message: &str) {
        for listener in &self.listeners {
            let call = AssertUnwindSafe(listener.on_progress(job_id, progress, message));
            match call.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "Progress listener failed"),
                Err(_) => warn!(job_id = %job_id, "Progress listener panicked"),
            }
        }
    }
}

/// Handle given to a running unit of work.
///
/// Reporting never fails from the caller's point of view: store or listener
/// errors are logged and dropped.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    engine: JobEngine,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    /// The job being worked on.
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Records progress (clamped to 100) and a log line.
    ///
    /// Listeners are only notified when the message is not blank, matching
    /// what lands in the job log.
    pub async fn progress(&self, pct: u8, message: impl Into<String>) {
        let message = message.into();
        let message = message.trim();
        let mut update = JobUpdate::new().with_progress(pct);
        if !message.is_empty() {
            update = update.with_message(message);
        }
        if let Err(e) = self.engine.update_job(&self.job_id, &update).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to record progress");
        }
        if !message.is_empty() {
            self.engine.notify(&self.job_id, pct.min(100), message).await;
        }
    }

    /// Appends a log line.
    pub async fn log(&self, message: impl Into<String>) {
        let update = JobUpdate::new().with_message(message);
        if let Err(e) = self.engine.update_job(&self.job_id, &update).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to record log line");
        }
    }

    /// True once the engine is shutting down.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.engine.is_shut_down()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use orderstatus_core::{JobState, ManualClock};
    use orderstatus_store::InMemoryJobStore;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn engine(pool: usize) -> JobEngine {
        JobEngine::new(
            Arc::new(InMemoryJobStore::new()),
            &ResilienceConfig::default().with_worker_pool_size(pool),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u8, String)>>,
    }

    #[async_trait]
    impl ProgressListener for Recorder {
        async fn on_progress(&self, _id: &JobId, progress: u8, message: &str) -> Result<()> {
            self.seen.lock().unwrap().push((progress, message.to_string()));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ProgressListener for Failing {
        async fn on_progress(&self, _id: &JobId, _progress: u8, _message: &str) -> Result<()> {
            Err(StatusError::Job("listener down".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl ProgressListener for Panicking {
        async fn on_progress(&self, _id: &JobId, _progress: u8, _message: &str) -> Result<()> {
            panic!("listener bug");
        }
    }

    /// Job store that refuses every update without a status change.
    struct NoProgressStore(InMemoryJobStore);

    #[async_trait]
    impl JobStore for NoProgressStore {
        async fn create(&self, job: &Job) -> Result<()> {
            self.0.create(job).await
        }

        async fn update(&self, id: &JobId, update: &JobUpdate, now: DateTime<Utc>) -> Result<Job> {
            if update.status().is_none() {
                return Err(StatusError::Cache("database is locked".into()));
            }
            self.0.update(id, update, now).await
        }

        async fn get(&self, id: &JobId) -> Result<Option<Job>> {
            self.0.get(id).await
        }
    }

    /// Job store whose first attempt to mark a job running fails.
    struct LockedOnStart {
        inner: InMemoryJobStore,
        refused: AtomicBool,
    }

    #[async_trait]
    impl JobStore for LockedOnStart {
        async fn create(&self, job: &Job) -> Result<()> {
            self.inner.create(job).await
        }

        async fn update(&self, id: &JobId, update: &JobUpdate, now: DateTime<Utc>) -> Result<Job> {
            if update.status() == Some(JobStatus::Running) && !self.refused.swap(true, Ordering::SeqCst)
            {
                return Err(StatusError::Cache("database is locked".into()));
            }
            self.inner.update(id, update, now).await
        }

        async fn get(&self, id: &JobId) -> Result<Option<Job>> {
            self.inner.get(id).await
        }
    }

    #[tokio::test]
    async fn test_create_job_is_pending() {
        let engine = engine(1);
        let id = engine.create_job().await.unwrap();
        let view = engine.job_view(&id).await.unwrap().unwrap();
        assert_eq!(view.state, JobState::Pending);
        assert!(!view.done);
        assert_eq!(view.progress, 0);
    }

    #[tokio::test]
    async fn test_successful_job_lifecycle() {
        let engine = engine(2);
        let id = engine.create_job().await.unwrap();
        engine
            .schedule(id.clone(), |ctx| async move {
                ctx.progress(50, "Fetched DD").await;
                Ok(json!({"rows": 3}))
            })
            .await
            .unwrap();

        let job = engine.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(json!({"rows": 3})));
        assert_eq!(job.log[0].message, "Fetched DD");
    }

    #[tokio::test]
    async fn test_failure_halfway_keeps_progress_and_log() {
        let engine = engine(2);
        let id = engine.create_job().await.unwrap();
        engine
            .schedule(id.clone(), |ctx| async move {
                ctx.progress(50, "Fetched DD").await;
                Err(StatusError::Job("CBR report failed".into()))
            })
            .await
            .unwrap();

        let view = engine.job_view(&id).await.unwrap().unwrap();
        assert_eq!(view.state, JobState::Error);
        assert!(view.done);
        assert_eq!(view.progress, 50);
        assert!(view.error.unwrap().contains("CBR report failed"));
        assert!(view.result.is_none());
        assert_eq!(view.log.len(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let engine = engine(1);
        let id = engine.create_job().await.unwrap();
        engine
            .schedule(id.clone(), |_ctx| async move {
                if true {
                    panic!("index out of bounds");
                }
                Ok(Value::Null)
            })
            .await
            .unwrap();

        let job = engine.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("job panicked: index out of bounds"));

        // The engine keeps working afterwards.
        let next = engine.create_job().await.unwrap();
        engine
            .schedule(next.clone(), |_ctx| async move { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(
            engine.get_job(&next).await.unwrap().unwrap().status,
            JobStatus::Done
        );
    }

    #[tokio::test]
    async fn test_listener_failures_do_not_abort_work() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine(1)
            .with_listener(Arc::new(Failing))
            .with_listener(Arc::new(Panicking))
            .with_listener(recorder.clone());
        let id = engine.create_job().await.unwrap();
        engine
            .schedule(id.clone(), |ctx| async move {
                ctx.progress(30, "Fetching DD").await;
                ctx.progress(150, "Fetching CBR").await;
                Ok(json!("ok"))
            })
            .await
            .unwrap();

        assert_eq!(
            engine.get_job(&id).await.unwrap().unwrap().status,
            JobStatus::Done
        );
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(30, "Fetching DD".to_string()), (100, "Fetching CBR".to_string())]
        );
    }

    #[tokio::test]
    async fn test_store_errors_while_reporting_are_swallowed() {
        let engine = JobEngine::new(
            Arc::new(NoProgressStore(InMemoryJobStore::new())),
            &ResilienceConfig::default(),
        );
        let id = engine.create_job().await.unwrap();
        engine
            .schedule(id.clone(), |ctx| async move {
                ctx.progress(40, "Fetching DD").await;
                ctx.log("still going").await;
                Ok(json!([]))
            })
            .await
            .unwrap();

        let job = engine.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.log.is_empty());
    }

    #[tokio::test]
    async fn test_log_lines_keep_order() {
        let engine = engine(1);
        let id = engine.create_job().await.unwrap();
        engine
            .schedule(id.clone(), |ctx| async move {
                for line in ["a", "", "b", "c"] {
                    ctx.log(line).await;
                }
                Ok(Value::Null)
            })
            .await
            .unwrap();

        let job = engine.get_job(&id).await.unwrap().unwrap();
        let lines: Vec<_> = job.log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(lines, ["a", "b", "c"]);
        assert!(job.log.windows(2).all(|w| w[0].at < w[1].at));
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let engine = engine(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let id = engine.create_job().await.unwrap();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(engine.schedule(id, move |_ctx| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_silent_running_job_is_stalled() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(1).with_clock(clock.clone());
        let id = engine.create_job().await.unwrap();
        engine.update_job(&id, &JobUpdate::running()).await.unwrap();

        clock.advance(chrono::Duration::seconds(10));
        let view = engine.job_view(&id).await.unwrap().unwrap();
        assert_eq!(view.state, JobState::Running);

        clock.advance(chrono::Duration::seconds(25));
        let view = engine.job_view(&id).await.unwrap().unwrap();
        assert_eq!(view.state, JobState::Stalled);
        assert!(!view.done);

        engine
            .update_job(&id, &JobUpdate::new().with_progress(60))
            .await
            .unwrap();
        let view = engine.job_view(&id).await.unwrap().unwrap();
        assert_eq!(view.state, JobState::Running);
    }

    #[tokio::test]
    async fn test_finalized_job_rejects_updates() {
        let engine = engine(1);
        let id = engine.create_job().await.unwrap();
        engine
            .schedule(id.clone(), |_ctx| async move { Ok(Value::Null) })
            .await
            .unwrap();

        let err = engine
            .update_job(&id, &JobUpdate::new().with_progress(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::JobFinalized(_)));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let engine = engine(1);
        let missing = JobId::new("missing");
        assert!(engine.job_view(&missing).await.unwrap().is_none());
        let err = engine
            .update_job(&missing, &JobUpdate::running())
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_work() {
        let engine = engine(1);
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = engine.create_job().await.unwrap();
        let first = engine.schedule(running.clone(), move |ctx| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(json!({"cancelled": ctx.is_cancelled()}))
        });
        started_rx.await.unwrap();

        let queued = engine.create_job().await.unwrap();
        let second = engine.schedule(queued.clone(), |_ctx| async move { Ok(Value::Null) });

        engine.shutdown();
        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();

        let job = engine.get_job(&running).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.result, Some(json!({"cancelled": true})));

        let job = engine.get_job(&queued).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some(SHUTDOWN_MESSAGE));
    }

    #[tokio::test]
    async fn test_job_scheduled_twice_runs_once() {
        let engine = engine(2);
        let id = engine.create_job().await.unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let runs = Arc::clone(&runs);
                engine.schedule(id.clone(), move |_ctx| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!("once"))
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let job = engine.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.result, Some(json!("once")));
    }

    #[tokio::test]
    async fn test_failed_start_is_recorded_as_error() {
        let engine = JobEngine::new(
            Arc::new(LockedOnStart {
                inner: InMemoryJobStore::new(),
                refused: AtomicBool::new(false),
            }),
            &ResilienceConfig::default(),
        );
        let id = engine.create_job().await.unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        engine
            .schedule(id.clone(), move |_ctx| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .await
            .unwrap();

        let job = engine.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.unwrap().contains("database is locked"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blank_progress_messages_skip_listeners() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine(1).with_listener(recorder.clone());
        let id = engine.create_job().await.unwrap();
        engine
            .schedule(id.clone(), |ctx| async move {
                ctx.progress(20, "   ").await;
                ctx.progress(40, "  Fetching CBR ").await;
                Ok(Value::Null)
            })
            .await
            .unwrap();

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(40, "Fetching CBR".to_string())]);
        let job = engine.get_job(&id).await.unwrap().unwrap();
        let lines: Vec<_> = job.log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(lines, ["Fetching CBR"]);
    }
}
