//! Dual admission control: a concurrency cap and a sliding window throughput cap.
use std::{collections::VecDeque, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use fxhash::FxHashSet;

use crate::{
    clock::Clock,
    config::{RateLimitConfig, RATE_WINDOW},
    job::JobId,
};

/// The outcome of asking the [`RateLimiter`] whether another job may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ready,
    /// Every concurrency slot is taken, a release is needed.
    AtCapacity,
    /// The throughput window is full, the oldest admission leaves it after `retry_after`.
    Throttled { retry_after: Duration },
}

/// Tracks jobs in flight and the instants at which jobs were admitted.
///
/// Admission instants measure throughput rather than concurrency, so releasing a job frees its
/// concurrency slot but leaves its admission in the window until it ages out.
pub struct RateLimiter {
    config: RateLimitConfig,
    in_flight: FxHashSet<JobId>,
    request_timestamps: VecDeque<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            in_flight: FxHashSet::default(),
            request_timestamps: VecDeque::new(),
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RateLimitConfig) {
        tracing::debug!(?config, "Updating rate limit config");
        self.config = config;
    }

    pub fn can_admit(&mut self) -> bool {
        self.admission() == Admission::Ready
    }

    pub fn admission(&mut self) -> Admission {
        let now = self.clock.now();
        self.prune(now);

        if self.in_flight.len() >= self.config.max_concurrent {
            return Admission::AtCapacity;
        }
        if self.request_timestamps.len() >= self.config.max_per_minute as usize {
            let retry_after = self
                .request_timestamps
                .front()
                .and_then(|oldest| (*oldest + window() - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            return Admission::Throttled { retry_after };
        }
        Admission::Ready
    }

    pub fn on_admit(&mut self, id: JobId) {
        let now = self.clock.now();
        self.in_flight.insert(id);
        self.request_timestamps.push_back(now);
    }

    /// Frees the concurrency slot held by `id`, returning whether it was held.
    pub fn on_release(&mut self, id: JobId) -> bool {
        self.in_flight.remove(&id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of admissions within the trailing window.
    pub fn admissions_in_window(&mut self) -> usize {
        let now = self.clock.now();
        self.prune(now);
        self.request_timestamps.len()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window_start = now - window();
        while self
            .request_timestamps
            .front()
            .is_some_and(|admitted_at| *admitted_at <= window_start)
        {
            self.request_timestamps.pop_front();
        }
    }
}

fn window() -> TimeDelta {
    TimeDelta::from_std(RATE_WINDOW).unwrap_or_else(|_| TimeDelta::seconds(60))
}
