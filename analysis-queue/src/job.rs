//! The job record and the types describing its lifecycle.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub(crate) mod runner;
pub mod spec;

/// Opaque identifier assigned to a job at submission.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct JobId(u64);

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The scheduling tier of a job.
///
/// Jobs in a lower ranked tier are always selected before jobs in a higher ranked tier; within a
/// tier jobs are selected in the order they were created.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    #[default]
    Normal,
    Background,
}

impl Priority {
    /// The rank used for ordering, `0` being scheduled first.
    pub const fn rank(self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::Normal => 1,
            Priority::Background => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// The permitted moves are `queued -> processing`, `processing -> complete | failed | queued`
    /// (the latter being an automatic retry) and `failed -> queued` (a manual retry).
    pub const fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Complete)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Queued)
                | (JobStatus::Failed, JobStatus::Queued)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        };
        f.write_str(status)
    }
}

/// A unit of asynchronous work tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Caller defined correlation key, for example the data unit the job concerns.
    pub subject_key: String,
    pub priority: Priority,
    pub status: JobStatus,
    /// Progress between `0` and `100`.
    pub progress: u8,
    /// Payload handed to the executor.
    pub data: serde_json::Value,
    pub result: Option<serde_json::Value>,
    /// The message of the most recent failure.
    pub error: Option<String>,
    /// Every failure recorded for this job, oldest first.
    pub errors: Vec<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u16,
    pub max_retries: u16,
}

impl Job {
    pub(crate) fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// The retry count of the attempt which failed.
    pub attempt: u16,
    pub error_type: ErrorType,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    Panic,
    Timeout,
    Other(String),
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorType::Panic => f.write_str("panic"),
            ErrorType::Timeout => f.write_str("timeout"),
            ErrorType::Other(other) => f.write_str(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_tiers() {
        assert!(Priority::Urgent.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Background.rank());
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn permitted_transitions() {
        use JobStatus::*;
        let permitted = [
            (Queued, Processing),
            (Processing, Complete),
            (Processing, Failed),
            (Processing, Queued),
            (Failed, Queued),
        ];
        for from in [Queued, Processing, Complete, Failed] {
            for to in [Queued, Processing, Complete, Failed] {
                assert_eq!(
                    from.can_transition_to(to),
                    permitted.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(JobStatus::Processing).unwrap(),
            serde_json::json!("processing")
        );
        assert_eq!(
            serde_json::from_value::<Priority>(serde_json::json!("background")).unwrap(),
            Priority::Background
        );
    }

    #[test]
    fn job_id_display() {
        assert_eq!(JobId::from(7).to_string(), "JobId(7)");
    }
}
