use async_trait::async_trait;
use std::{error::Error, future::Future, time::Duration};

use crate::job::{ErrorType, Job};

/// The work performed for a job.
///
/// A single executor is injected into the [`crate::Scheduler`] and invoked once per attempt with a
/// snapshot of the job. Executors are treated as opaque: an attempt cannot be preempted, it either
/// returns, panics or exceeds its [`Executor::timeout`].
///
/// Any `async` closure taking a [`Job`] and returning an [`ExecutionResult`] is an executor:
///
/// ```
/// # use analysis_queue::prelude::*;
/// let scheduler = Scheduler::new(|job: Job| async move {
///     ExecutionResult::done(serde_json::json!({ "subject": job.subject_key }))
/// });
/// ```
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, job: Job) -> ExecutionResult;

    /// Maximum duration of a single attempt, [`None`] meaning an attempt may run indefinitely.
    ///
    /// An attempt which times out releases its concurrency slot and is treated as a failure.
    fn timeout(&self, _job: &Job) -> Option<Duration> {
        None
    }
}

#[async_trait]
impl<F, Fut> Executor for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult> + Send + 'static,
{
    async fn execute(&self, job: Job) -> ExecutionResult {
        (self)(job).await
    }
}

pub enum ExecutionResult {
    Done { result: serde_json::Value },
    Error { error: Box<dyn ExecutionError> },
}

impl ExecutionResult {
    pub fn done(result: serde_json::Value) -> Self {
        Self::Done { result }
    }
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;
}

/// A failed attempt as recorded against the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecutionFailure {
    pub(crate) error_type: ErrorType,
    pub(crate) message: String,
}

impl From<Box<dyn ExecutionError>> for ExecutionFailure {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: ErrorType::Other(value.error_type().to_owned()),
            message: value.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        fmt::Display,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use super::*;

    #[derive(Debug, Clone)]
    pub(crate) struct MockError(pub String);

    impl Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for MockError {}

    impl ExecutionError for MockError {
        fn error_type(&self) -> &'static str {
            "custom"
        }
    }

    /// Records every job it is invoked with and tracks how many attempts overlap.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingExecutor {
        pub(crate) calls: Arc<Mutex<Vec<Job>>>,
        running: Arc<AtomicUsize>,
        pub(crate) peak_running: Arc<AtomicUsize>,
        duration: Duration,
        fail: bool,
    }

    impl RecordingExecutor {
        pub(crate) fn taking(duration: Duration) -> Self {
            Self {
                duration,
                ..Default::default()
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<Job> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn peak_running(&self) -> usize {
            self.peak_running.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn execute(&self, job: Job) -> ExecutionResult {
            self.calls.lock().unwrap().push(job.clone());
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_running.fetch_max(running, Ordering::SeqCst);
            if !self.duration.is_zero() {
                tokio::time::sleep(self.duration).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                MockError(format!("attempt {} failed", job.retry_count)).into()
            } else {
                ExecutionResult::done(serde_json::json!({ "subject": job.subject_key }))
            }
        }
    }

    #[test]
    fn execution_errors_convert_into_failures() {
        let ExecutionResult::Error { error } = ExecutionResult::from(MockError("boom".into()))
        else {
            panic!("expected an error result");
        };

        assert_eq!(
            ExecutionFailure::from(error),
            ExecutionFailure {
                error_type: ErrorType::Other("custom".to_owned()),
                message: "boom".to_owned(),
            }
        );
    }
}
