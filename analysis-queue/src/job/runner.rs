use std::{sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinError};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::{
    executor::{ExecutionFailure, ExecutionResult, Executor},
    job::{ErrorType, Job, JobId},
    lock,
    notifier::Notifier,
    panic_message,
    priority::select_next,
    rate_limiter::{Admission, RateLimiter},
    store::JobStore,
};

/// Everything guarded by the state lock.
pub(crate) struct State {
    pub(crate) store: JobStore,
    pub(crate) limiter: RateLimiter,
    /// Whether a worker loop is currently running.
    pub(crate) is_processing: bool,
}

/// What the worker loop decided while holding the state lock.
enum Step {
    Idle,
    Dispatch { job: Job, pacing: Duration },
    Wait(Duration),
}

pub(crate) struct JobRunner {
    pub(crate) state: std::sync::Mutex<State>,
    pub(crate) notifier: Arc<Notifier>,
    executor: Arc<dyn Executor>,
    poll_interval: Duration,
    wake: Notify,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl JobRunner {
    pub(crate) fn new(state: State, executor: Arc<dyn Executor>, poll_interval: Duration) -> Self {
        Self {
            state: std::sync::Mutex::new(state),
            notifier: Arc::new(Notifier::new()),
            executor,
            poll_interval,
            wake: Notify::new(),
            tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Applies `f` to the shared state.
    ///
    /// `f` returns its value together with whether the job table changed. A change is broadcast to
    /// subscribers and starts the worker loop if a job is queued and no loop is running. The loop
    /// is always woken, as `f` may have freed capacity.
    pub(crate) fn modify<T>(self: &Arc<Self>, f: impl FnOnce(&mut State) -> (T, bool)) -> T {
        let (value, start_loop) = {
            let mut state = lock(&self.state);
            let (value, changed) = f(&mut *state);
            if changed {
                self.notifier.stage(state.store.stats());
            }
            (value, changed && self.claim_loop(&mut *state))
        };
        self.notifier.flush();
        if start_loop {
            self.spawn_loop();
        }
        self.wake.notify_one();
        value
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Stops admitting jobs and waits for in-flight attempts to record their outcome.
    pub(crate) async fn graceful_shutdown(&self) {
        tracing::debug!("Shutting down the job runner");
        self.cancellation_token.cancel();
        self.notifier.touch();
        self.wake.notify_one();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn claim_loop(&self, state: &mut State) -> bool {
        if state.is_processing || self.is_shut_down() || !state.store.has_queued() {
            return false;
        }
        state.is_processing = true;
        true
    }

    fn spawn_loop(self: &Arc<Self>) {
        let runner = self.clone();
        self.tracker.spawn(async move { runner.run().await });
    }

    async fn run(self: Arc<Self>) {
        tracing::debug!("Worker loop started");
        loop {
            match self.next_step() {
                Step::Idle => break,
                Step::Dispatch { job, pacing } => {
                    self.notifier.flush();
                    self.tracker.spawn(self.clone().execute_job(job));
                    if !pacing.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(pacing) => {},
                            _ = self.cancellation_token.cancelled() => {},
                        }
                    }
                }
                Step::Wait(delay) => {
                    tokio::select! {
                        _ = self.wake.notified() => {},
                        _ = tokio::time::sleep(delay) => {},
                        _ = self.cancellation_token.cancelled() => {},
                    }
                }
            }
        }
        tracing::debug!("Worker loop stopped");
    }

    fn next_step(&self) -> Step {
        let mut state = lock(&self.state);
        if self.is_shut_down() {
            state.is_processing = false;
            return Step::Idle;
        }
        let Some(id) = select_next(state.store.jobs()).map(|job| job.id) else {
            state.is_processing = false;
            return Step::Idle;
        };
        match state.limiter.admission() {
            Admission::Ready => {}
            Admission::AtCapacity => {
                tracing::trace!(%id, "At capacity, waiting for a release");
                return Step::Wait(self.poll_interval);
            }
            Admission::Throttled { retry_after } => {
                tracing::debug!(%id, ?retry_after, "Throughput cap reached");
                return Step::Wait(retry_after.min(self.poll_interval));
            }
        }

        state.limiter.on_admit(id);
        let pacing = state.limiter.config().delay_between();
        match state.store.mark_processing(id).cloned() {
            Ok(job) => {
                self.notifier.stage(state.store.stats());
                tracing::debug!(job_id = %id, priority = ?job.priority, "Admitted job {id}");
                Step::Dispatch { job, pacing }
            }
            Err(error) => {
                tracing::error!(?error, job_id = %id, "Failed to start job {id}: {error}");
                state.limiter.on_release(id);
                Step::Wait(Duration::ZERO)
            }
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn execute_job(self: Arc<Self>, job: Job) {
        let job_id = job.id;
        let executor = self.executor.clone();

        tracing::debug!(%job_id, "Executing job {job_id}");
        let attempt = tokio::spawn(
            async move {
                match executor.timeout(&job) {
                    Some(timeout) => tokio::time::timeout(timeout, executor.execute(job))
                        .await
                        .map_err(|_elapsed| timeout),
                    None => Ok(executor.execute(job).await),
                }
            }
            .in_current_span(),
        );

        match attempt.await {
            Ok(Ok(ExecutionResult::Done { result })) => self.handle_job_complete(job_id, result),
            Ok(Ok(ExecutionResult::Error { error })) => self.handle_job_error(job_id, error),
            Ok(Err(timeout)) => self.handle_job_error(job_id, timeout),
            Err(error) => self.handle_job_error(job_id, error),
        }
    }

    fn handle_job_complete(self: &Arc<Self>, job_id: JobId, result: serde_json::Value) {
        self.modify(|state| {
            state.limiter.on_release(job_id);
            match state.store.mark_complete(job_id, result) {
                Ok(_) => {
                    tracing::debug!(%job_id, "Job complete {job_id}");
                    ((), true)
                }
                Err(err) => {
                    tracing::error!(
                        ?err,
                        %job_id,
                        "Failed to mark job {job_id} as complete, error: {err}",
                    );
                    ((), false)
                }
            }
        })
    }

    fn handle_job_error(self: &Arc<Self>, job_id: JobId, error: impl Into<ExecutionFailure>) {
        let failure = error.into();
        self.modify(|state| {
            state.limiter.on_release(job_id);
            let Some(job) = state.store.get(job_id) else {
                tracing::error!(
                    %job_id,
                    error = %failure.message,
                    "Job {job_id} failed after being removed from the table",
                );
                return ((), false);
            };
            let result = if job.can_retry() {
                tracing::warn!(
                    %job_id,
                    ?failure,
                    "Job {job_id} failed and will be retried ({}/{}): error type: {}, message: {}",
                    job.retry_count + 1,
                    job.max_retries,
                    failure.error_type,
                    failure.message
                );
                state.store.mark_retry(job_id, failure)
            } else {
                tracing::error!(
                    %job_id,
                    ?failure,
                    "Job {job_id} failed and will not be retried: error type: {}, message: {}",
                    failure.error_type,
                    failure.message
                );
                state.store.mark_failed(job_id, failure)
            };
            match result {
                Ok(_) => ((), true),
                Err(err) => {
                    tracing::error!(?err, %job_id, "Failed to record failure of job {job_id}: {err}");
                    ((), false)
                }
            }
        })
    }
}

impl From<JoinError> for ExecutionFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic_message(panic.as_ref()).unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ErrorType::Panic,
            message,
        }
    }
}

impl From<Duration> for ExecutionFailure {
    fn from(value: Duration) -> Self {
        Self {
            error_type: ErrorType::Timeout,
            message: format!("Job failed to complete within timeout: {value:?}"),
        }
    }
}
