//! A rate limited, priority ordered scheduler for asynchronous analysis jobs.
//!
//! Jobs are submitted to a [`Scheduler`] together with a [`Priority`](job::Priority). A single
//! worker loop picks the next queued job (urgent before normal before background, oldest first
//! within a tier), admits it subject to two independent constraints, and hands it to the injected
//! [`Executor`]:
//!
//! - at most [`RateLimitConfig::max_concurrent`](config::RateLimitConfig) jobs are processing at
//!   any instant, and
//! - at most [`RateLimitConfig::max_per_minute`](config::RateLimitConfig) jobs are admitted within
//!   any trailing 60 second window.
//!
//! A failed attempt is put back in the queue, keeping its place within its tier, until the job's
//! retry budget is spent, at which point the job is marked as failed. Every change to the job table
//! is broadcast to subscribers as aggregate [`Stats`](notifier::Stats).
//!
//! # Example
//!
//! ```
//! # use analysis_queue::prelude::*;
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let config = SchedulerConfig::default().with_rate_limit(RateLimitConfig {
//!     max_concurrent: 2,
//!     max_per_minute: 30,
//!     delay_between_ms: 0,
//! });
//! let scheduler = Scheduler::builder(|job: Job| async move {
//!     ExecutionResult::done(serde_json::json!({ "subject": job.subject_key }))
//! })
//! .with_config(config)
//! .build()
//! .unwrap();
//!
//! let id = scheduler
//!     .submit(JobSpec::new("study-42").with_priority(Priority::Urgent))
//!     .unwrap();
//! scheduler.wait_until_idle().await;
//!
//! assert_eq!(scheduler.get_job(id).unwrap().status, JobStatus::Complete);
//! assert_eq!(scheduler.get_stats().progress_percent, 100);
//! # });
//! ```
use std::{
    any::Any,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

pub mod clock;
pub mod config;
pub mod executor;
pub mod job;
pub mod notifier;
pub mod prelude;
pub mod priority;
pub mod rate_limiter;
pub mod store;

use async_stream::stream;
use clock::{Clock, SystemClock};
use config::{RateLimitConfig, RateLimitUpdate, SchedulerConfig};
use executor::Executor;
use futures::Stream;
use job::{
    runner::{JobRunner, State},
    spec::JobSpec,
    Job, JobId, JobStatus, Priority,
};
use notifier::{Stats, Subscription};
use rate_limiter::RateLimiter;
use store::JobStore;
use thiserror::Error;
use tokio::sync::mpsc;

/// Schedules jobs onto an [`Executor`].
///
/// Cloning a [`Scheduler`] yields another handle to the same job table.
///
/// The worker loop is started on demand by any operation leaving a queued job behind, so those
/// operations must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    runner: Arc<JobRunner>,
}

pub struct SchedulerBuilder {
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
}

impl SchedulerBuilder {
    pub fn with_config(self, config: SchedulerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_clock(self, clock: impl Clock) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        self.config.validate()?;
        Ok(Scheduler::from_parts(self.executor, self.config, self.clock))
    }
}

impl Scheduler {
    /// Creates a scheduler with the default [`SchedulerConfig`] and the wall clock.
    pub fn new(executor: impl Executor) -> Self {
        Self::from_parts(
            Arc::new(executor),
            SchedulerConfig::default(),
            Arc::new(SystemClock),
        )
    }

    pub fn builder(executor: impl Executor) -> SchedulerBuilder {
        SchedulerBuilder {
            executor: Arc::new(executor),
            config: SchedulerConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    fn from_parts(
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = State {
            store: JobStore::new(config.max_retries, clock.clone()),
            limiter: RateLimiter::new(config.rate_limit.clone(), clock),
            is_processing: false,
        };
        Self {
            runner: Arc::new(JobRunner::new(state, executor, config.poll_interval())),
        }
    }

    /// Queues a job, failing with [`SchedulerError::InvalidJobSpec`] if the spec is malformed and
    /// with [`SchedulerError::ShutDown`] once [`Scheduler::shutdown`] has been called.
    pub fn submit(&self, spec: JobSpec) -> Result<JobId, SchedulerError> {
        self.ensure_running()?;
        self.runner
            .modify(|state| {
                let result = state.store.submit(spec);
                let changed = result.is_ok();
                (result, changed)
            })
            .inspect(|job_id| tracing::debug!(%job_id, "Submitted job {job_id}"))
    }

    /// Queues every spec with the given priority, overriding the priority of the specs.
    ///
    /// Either every job is queued or, if any spec is malformed, none is.
    pub fn batch_submit(
        &self,
        specs: impl IntoIterator<Item = JobSpec>,
        priority: Priority,
    ) -> Result<Vec<JobId>, SchedulerError> {
        self.ensure_running()?;
        self.runner
            .modify(|state| {
                let result = state.store.batch_submit(specs, priority);
                let changed = result.as_ref().is_ok_and(|ids| !ids.is_empty());
                (result, changed)
            })
            .inspect(|ids| tracing::debug!(count = ids.len(), ?priority, "Submitted batch"))
    }

    fn ensure_running(&self) -> Result<(), SchedulerError> {
        if self.runner.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        Ok(())
    }

    pub fn get_job(&self, id: JobId) -> Option<Job> {
        lock(&self.runner.state).store.get(id).cloned()
    }

    /// Every job, in submission order.
    pub fn list_jobs(&self) -> Vec<Job> {
        lock(&self.runner.state).store.jobs().to_vec()
    }

    pub fn jobs_for_subject(&self, subject_key: &str) -> Vec<Job> {
        lock(&self.runner.state)
            .store
            .jobs()
            .iter()
            .filter(|job| job.subject_key == subject_key)
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> Stats {
        lock(&self.runner.state).store.stats()
    }

    /// Registers `callback` to be called with fresh [`Stats`] after every change to the job table.
    ///
    /// Callbacks are invoked in registration order. A panicking callback is logged and does not
    /// prevent delivery to the others.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Stats) + Send + Sync + 'static,
    {
        self.runner.notifier.subscribe_fn(callback)
    }

    /// A stream of the [`Stats`] published after subscribing.
    ///
    /// The subscription is removed once the stream is dropped.
    pub fn stats_stream(&self) -> impl Stream<Item = Stats> + Send + 'static {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let _subscription = self.runner.notifier.subscribe(sender);
        stream! {
            while let Some(stats) = receiver.recv().await {
                yield stats;
            }
        }
    }

    /// Removes a job that has not started yet.
    ///
    /// Returns `false` if the job does not exist or is no longer queued, a running attempt cannot
    /// be interrupted.
    pub fn cancel_job(&self, id: JobId) -> bool {
        let removed = self.runner.modify(|state| {
            let removed = state.store.remove(id);
            (removed, removed)
        });
        if removed {
            tracing::debug!(job_id = %id, "Cancelled job {id}");
        }
        removed
    }

    /// Removes every queued job, leaving processing jobs to finish.
    pub fn cancel_all(&self) -> usize {
        self.runner.modify(|state| {
            let removed = state.store.remove_queued();
            (removed, removed > 0)
        })
    }

    /// Removes every complete and failed job.
    pub fn clear_completed(&self) -> usize {
        self.runner.modify(|state| {
            let removed = state.store.clear_completed();
            (removed, removed > 0)
        })
    }

    /// Puts every failed job back in the queue with a fresh retry budget.
    pub fn retry_failed(&self) -> usize {
        self.runner.modify(|state| {
            let requeued = state.store.retry_failed();
            (requeued, requeued > 0)
        })
    }

    /// Removes every job.
    ///
    /// Jobs which are processing keep their concurrency slot until their attempt returns, the
    /// outcome of that attempt is discarded.
    pub fn clear(&self) -> usize {
        self.runner.modify(|state| {
            let removed = state.store.clear();
            (removed, removed > 0)
        })
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        lock(&self.runner.state).limiter.config().clone()
    }

    /// Applies a partial update to the rate limits, returning the resulting configuration.
    ///
    /// The update is rejected as a whole if the resulting configuration is invalid.
    pub fn set_rate_limit_config(
        &self,
        update: RateLimitUpdate,
    ) -> Result<RateLimitConfig, SchedulerError> {
        self.runner.modify(|state| {
            let config = state.limiter.config().merge(&update);
            let result = config.validate().map(|()| {
                state.limiter.set_config(config.clone());
                config
            });
            (result, false)
        })
    }

    /// Whether the worker loop is running.
    pub fn is_processing(&self) -> bool {
        lock(&self.runner.state).is_processing
    }

    pub fn is_shut_down(&self) -> bool {
        self.runner.is_shut_down()
    }

    /// Waits until no job is queued or processing.
    ///
    /// After [`Scheduler::shutdown`] queued jobs are never picked up, so this resolves as soon as
    /// nothing is processing. Jobs removed by [`Scheduler::clear`] no longer count as processing,
    /// even though their attempts may still be running.
    pub async fn wait_until_idle(&self) {
        let runner = &self.runner;
        let mut latest = runner.notifier.latest();
        let result = latest
            .wait_for(|stats| stats.is_idle() || (runner.is_shut_down() && stats.processing == 0))
            .await
            .map(drop);
        if let Err(err) = result {
            tracing::warn!(?err, "Stats channel closed while waiting for idle");
        }
    }

    /// Stops admitting jobs and waits for the attempts in flight to finish.
    ///
    /// Jobs still queued remain in the table but are no longer scheduled, and further submissions
    /// fail with [`SchedulerError::ShutDown`].
    pub async fn shutdown(&self) {
        self.runner.graceful_shutdown().await
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid job spec: {reason}")]
    InvalidJobSpec { reason: String },
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Scheduler has been shut down")]
    ShutDown,
    #[error("{id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
        tracing::warn!("Recovering from a poisoned lock");
        poisoned.into_inner()
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
}
