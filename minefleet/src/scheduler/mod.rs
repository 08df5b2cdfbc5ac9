//! The scheduler runs named jobs on independent fixed intervals.
//!
//! Each job gets its own timer task. A tick spawns one invocation; if the
//! previous invocation of the same job is still running the tick is
//! skipped, never queued. Invocations that fail or panic are logged and
//! recorded as audit events, and the schedule carries on. Only
//! [`Scheduler::cancel`] or [`Scheduler::shutdown`] stop a job.

mod device_lock;

pub use device_lock::DeviceLocks;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::store::Store;
use crate::tracing::prelude::*;
use crate::types::{Event, EventCategory, Severity};

pub type JobFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A job body. Called once per invocation.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("no job named {0:?}")]
    UnknownJob(String),

    #[error("job {0:?} is already scheduled")]
    AlreadyScheduled(String),

    #[error("job {0:?} needs a positive interval")]
    ZeroInterval(String),

    #[error("job {0:?} is busy")]
    Busy(String),

    #[error("job {name:?} failed: {message}")]
    Failed { name: String, message: String },

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

struct Entry {
    /// None for jobs that only run on demand.
    interval: Option<Duration>,
    job: JobFn,
    running: Arc<AsyncMutex<()>>,
    cancel: CancellationToken,
}

pub struct Scheduler {
    jobs: Mutex<HashMap<String, Entry>>,
    store: Arc<dyn Store>,
    tracker: TaskTracker,
    running: CancellationToken,
}

impl Scheduler {
    /// `store` receives an audit event for every failed invocation.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            store,
            tracker: TaskTracker::new(),
            running: CancellationToken::new(),
        }
    }

    /// Start running `job` every `interval`, beginning immediately.
    pub fn schedule(
        &self,
        name: &str,
        interval: Duration,
        job: JobFn,
    ) -> Result<(), SchedulerError> {
        self.schedule_with(name, interval, job, Arc::new(AsyncMutex::new(())))
    }

    /// `running` is the job's single-flight lock, shared with any
    /// invocation still in progress.
    fn schedule_with(
        &self,
        name: &str,
        interval: Duration,
        job: JobFn,
        running: Arc<AsyncMutex<()>>,
    ) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(name.to_string()));
        }
        if self.running.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(name) {
            return Err(SchedulerError::AlreadyScheduled(name.to_string()));
        }

        let entry = Entry {
            interval: Some(interval),
            job: job.clone(),
            running,
            cancel: self.running.child_token(),
        };
        self.tracker.spawn(timer_task(
            name.to_string(),
            interval,
            job,
            entry.running.clone(),
            entry.cancel.clone(),
            self.store.clone(),
            self.tracker.clone(),
        ));
        jobs.insert(name.to_string(), entry);

        debug!(job = name, ?interval, "Job scheduled");
        Ok(())
    }

    /// Register a job that has no timer and runs only through
    /// [`Scheduler::run_now`].
    pub fn register(&self, name: &str, job: JobFn) -> Result<(), SchedulerError> {
        if self.running.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(name) {
            return Err(SchedulerError::AlreadyScheduled(name.to_string()));
        }
        jobs.insert(
            name.to_string(),
            Entry {
                interval: None,
                job,
                running: Arc::new(AsyncMutex::new(())),
                cancel: self.running.child_token(),
            },
        );
        debug!(job = name, "Job registered for manual runs");
        Ok(())
    }

    /// Stop future ticks of a job. An invocation already running finishes.
    pub fn cancel(&self, name: &str) -> Result<(), SchedulerError> {
        let entry = self
            .jobs
            .lock()
            .remove(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        entry.cancel.cancel();
        debug!(job = name, "Job cancelled");
        Ok(())
    }

    /// Change a job's interval: cancel, then schedule again. An
    /// invocation still in flight keeps later ticks from overlapping it.
    pub fn reschedule(&self, name: &str, interval: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(name.to_string()));
        }
        let (job, running) = self
            .jobs
            .lock()
            .get(name)
            .map(|entry| (entry.job.clone(), entry.running.clone()))
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        self.cancel(name)?;
        self.schedule_with(name, interval, job, running)
    }

    /// Run a job immediately and wait for it. Fails with
    /// [`SchedulerError::Busy`] instead of overlapping a running
    /// invocation.
    pub async fn run_now(&self, name: &str) -> Result<(), SchedulerError> {
        if self.running.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let (job, running) = {
            let jobs = self.jobs.lock();
            let entry = jobs
                .get(name)
                .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
            (entry.job.clone(), entry.running.clone())
        };
        let _permit = running
            .try_lock_owned()
            .map_err(|_| SchedulerError::Busy(name.to_string()))?;

        info!(job = name, "Manual run");
        invoke(name, &job, self.store.as_ref())
            .await
            .map_err(|message| SchedulerError::Failed {
                name: name.to_string(),
                message,
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.jobs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn interval(&self, name: &str) -> Option<Duration> {
        self.jobs.lock().get(name).and_then(|entry| entry.interval)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.jobs
            .lock()
            .get(name)
            .is_some_and(|entry| entry.running.try_lock().is_err())
    }

    /// Cancel every job and wait for in-flight invocations to finish.
    pub async fn shutdown(&self) {
        self.running.cancel();
        self.jobs.lock().clear();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Scheduler stopped");
    }
}

async fn timer_task(
    name: String,
    interval: Duration,
    job: JobFn,
    running: Arc<AsyncMutex<()>>,
    cancel: CancellationToken,
    store: Arc<dyn Store>,
    tracker: TaskTracker,
) {
    trace!(job = %name, "Timer task started.");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            _ = ticker.tick() => {
                let Ok(permit) = running.clone().try_lock_owned() else {
                    debug!(job = %name, "Previous run still in progress, skipping tick");
                    continue;
                };
                let name = name.clone();
                let job = job.clone();
                let store = store.clone();
                tracker.spawn(async move {
                    let _permit = permit;
                    let _ = invoke(&name, &job, store.as_ref()).await;
                });
            }
        }
    }

    trace!(job = %name, "Timer task stopped.");
}

/// Run one invocation, turning errors and panics into an audit event.
async fn invoke(name: &str, job: &JobFn, store: &dyn Store) -> Result<(), String> {
    trace!(job = name, "Job run started");
    let outcome = AssertUnwindSafe((job.as_ref())()).catch_unwind().await;

    let message = match outcome {
        Ok(Ok(())) => {
            trace!(job = name, "Job run finished");
            return Ok(());
        }
        Ok(Err(e)) => {
            error!(job = name, error = %format!("{e:#}"), "Job failed");
            format!("{e:#}")
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(job = name, panic = %message, "Job panicked");
            format!("panicked: {message}")
        }
    };

    store.append_event(
        Event::new(
            EventCategory::Scheduler,
            Severity::Warning,
            format!("job {name} failed: {message}"),
        )
        .details(json!({ "job": name, "error": message })),
    );
    Err(message)
}

/// Wrap an async closure as a [`JobFn`].
pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}
