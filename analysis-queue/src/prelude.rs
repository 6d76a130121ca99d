//! The purpose of this module is to alleviate the need to import many of the `[analysis_queue]`
//! types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use analysis_queue::prelude::*;
//! ```
pub use crate::clock::{Clock, SystemClock, TokioClock};
pub use crate::config::{RateLimitConfig, RateLimitUpdate, SchedulerConfig};
pub use crate::executor::{ExecutionError, ExecutionResult, Executor};
pub use crate::job::spec::JobSpec;
pub use crate::job::{Job, JobId, JobStatus, Priority};
pub use crate::notifier::{Stats, Subscription};
pub use crate::{Scheduler, SchedulerError};
