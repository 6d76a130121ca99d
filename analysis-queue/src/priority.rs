//! Selection of the next job to run.
use crate::job::{Job, JobStatus};

/// Picks the next job eligible to run from a snapshot of jobs.
///
/// Only [`JobStatus::Queued`] jobs are eligible. They are ordered by [`crate::job::Priority::rank`]
/// and then by `created_at`, oldest first. Jobs created at the same instant fall back to
/// submission order.
///
/// # Example
///
/// ```
/// # use analysis_queue::priority::select_next;
/// assert!(select_next(&[]).is_none());
/// ```
pub fn select_next<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Option<&'a Job> {
    jobs.into_iter()
        .filter(|job| job.status == JobStatus::Queued)
        .min_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        })
}
