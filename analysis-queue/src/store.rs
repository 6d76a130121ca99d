//! The in-memory table of job records.
//!
//! The store only performs bookkeeping: it validates submissions, assigns identifiers and applies
//! status transitions. Deciding *which* transition to apply is the job of the worker loop.
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    clock::Clock,
    executor::ExecutionFailure,
    job::{spec::JobSpec, Job, JobError, JobId, JobStatus, Priority},
    notifier::Stats,
    SchedulerError,
};

const PROGRESS_STARTED: u8 = 10;
const PROGRESS_DONE: u8 = 100;

pub struct JobStore {
    jobs: Vec<Job>,
    id_counter: u64,
    default_max_retries: u16,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    pub fn new(default_max_retries: u16, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Vec::new(),
            id_counter: 0,
            default_max_retries,
            clock,
        }
    }

    /// Validates `spec` and inserts it as a queued job.
    pub fn submit(&mut self, spec: JobSpec) -> Result<JobId, SchedulerError> {
        spec.validate()?;
        let id = self.next_id();
        let JobSpec {
            subject_key,
            data,
            priority,
            max_retries,
        } = spec;
        self.jobs.push(Job {
            id,
            subject_key,
            priority,
            status: JobStatus::Queued,
            progress: 0,
            data,
            result: None,
            error: None,
            errors: vec![],
            created_at: self.clock.now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: max_retries.unwrap_or(self.default_max_retries),
        });
        Ok(id)
    }

    /// Inserts every spec with the given priority.
    ///
    /// The batch is validated up front: if any spec is malformed nothing is inserted.
    pub fn batch_submit(
        &mut self,
        specs: impl IntoIterator<Item = JobSpec>,
        priority: Priority,
    ) -> Result<Vec<JobId>, SchedulerError> {
        let specs = specs
            .into_iter()
            .map(|spec| spec.with_priority(priority))
            .collect::<Vec<_>>();
        specs.iter().try_for_each(JobSpec::validate)?;
        specs.into_iter().map(|spec| self.submit(spec)).collect()
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    /// All jobs in submission order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn has_queued(&self) -> bool {
        self.jobs.iter().any(|job| job.status == JobStatus::Queued)
    }

    pub fn stats(&self) -> Stats {
        Stats::from_jobs(&self.jobs)
    }

    pub(crate) fn mark_processing(&mut self, id: JobId) -> Result<&Job, SchedulerError> {
        let now = self.clock.now();
        let job = self.transition(id, JobStatus::Processing)?;
        job.started_at = Some(now);
        job.progress = PROGRESS_STARTED;
        Ok(&*job)
    }

    pub(crate) fn mark_complete(
        &mut self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<&Job, SchedulerError> {
        let now = self.clock.now();
        let job = self.transition(id, JobStatus::Complete)?;
        job.progress = PROGRESS_DONE;
        job.result = Some(result);
        job.completed_at = Some(now);
        Ok(&*job)
    }

    /// Puts a job that failed back in the queue, keeping its original `created_at`.
    pub(crate) fn mark_retry(
        &mut self,
        id: JobId,
        failure: ExecutionFailure,
    ) -> Result<&Job, SchedulerError> {
        let now = self.clock.now();
        let job = self.transition(id, JobStatus::Queued)?;
        job.record_failure(failure, now);
        job.retry_count += 1;
        job.progress = 0;
        job.started_at = None;
        Ok(&*job)
    }

    pub(crate) fn mark_failed(
        &mut self,
        id: JobId,
        failure: ExecutionFailure,
    ) -> Result<&Job, SchedulerError> {
        let now = self.clock.now();
        let job = self.transition(id, JobStatus::Failed)?;
        job.record_failure(failure, now);
        job.completed_at = Some(now);
        Ok(&*job)
    }

    /// Removes a job, but only while it is still queued.
    pub fn remove(&mut self, id: JobId) -> bool {
        self.remove_where(|job| job.id == id && job.status == JobStatus::Queued) > 0
    }

    /// Removes every queued job, returning how many were removed.
    pub fn remove_queued(&mut self) -> usize {
        self.remove_where(|job| job.status == JobStatus::Queued)
    }

    /// Removes every job, including those still processing.
    pub fn clear(&mut self) -> usize {
        let removed = self.jobs.len();
        self.jobs.clear();
        removed
    }

    /// Removes every job in a terminal state.
    pub fn clear_completed(&mut self) -> usize {
        self.remove_where(|job| job.status.is_terminal())
    }

    /// Requeues every failed job with a fresh retry budget.
    pub fn retry_failed(&mut self) -> usize {
        let mut requeued = 0;
        for job in self
            .jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Failed)
        {
            job.status = JobStatus::Queued;
            job.retry_count = 0;
            job.progress = 0;
            job.error = None;
            job.started_at = None;
            job.completed_at = None;
            requeued += 1;
        }
        requeued
    }

    fn remove_where(&mut self, predicate: impl Fn(&Job) -> bool) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|job| !predicate(job));
        before - self.jobs.len()
    }

    fn transition(&mut self, id: JobId, to: JobStatus) -> Result<&mut Job, SchedulerError> {
        let job = self
            .jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(SchedulerError::JobNotFound(id))?;
        if !job.status.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: job.status,
                to,
            });
        }
        job.status = to;
        Ok(job)
    }

    fn next_id(&mut self) -> JobId {
        self.id_counter += 1;
        self.id_counter.into()
    }
}

impl Job {
    fn record_failure(&mut self, failure: ExecutionFailure, recorded_at: DateTime<Utc>) {
        self.error = Some(failure.message.clone());
        self.errors.push(JobError {
            attempt: self.retry_count,
            error_type: failure.error_type,
            details: failure.message,
            recorded_at,
        });
    }
}
