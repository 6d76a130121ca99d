use crate::SchedulerError;

use super::Priority;

/// Describes a job to submit to the [`crate::Scheduler`].
///
/// # Example
///
/// ```
/// # use analysis_queue::prelude::*;
/// let spec = JobSpec::new("series-1.2.840")
///     .with_priority(Priority::Urgent)
///     .with_data(serde_json::json!({ "slice": 42 }))
///     .with_max_retries(1);
///
/// assert_eq!(spec.subject_key(), "series-1.2.840");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub(crate) subject_key: String,
    pub(crate) data: serde_json::Value,
    pub(crate) priority: Priority,
    pub(crate) max_retries: Option<u16>,
}

impl JobSpec {
    pub fn new(subject_key: impl Into<String>) -> Self {
        Self {
            subject_key: subject_key.into(),
            data: serde_json::Value::Null,
            priority: Priority::default(),
            max_retries: None,
        }
    }

    pub fn with_data(self, data: serde_json::Value) -> Self {
        Self { data, ..self }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    /// Overrides [`crate::config::SchedulerConfig::max_retries`] for this job.
    pub fn with_max_retries(self, max_retries: u16) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }

    pub fn subject_key(&self) -> &str {
        &self.subject_key
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        if self.subject_key.trim().is_empty() {
            return Err(SchedulerError::InvalidJobSpec {
                reason: "missing subject key".to_owned(),
            });
        }
        Ok(())
    }
}
