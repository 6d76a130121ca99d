//! Sources of the current time used for job timestamps and the throughput window.
use chrono::{DateTime, TimeDelta, Utc};

/// A source of the current time.
///
/// The scheduler never reads the wall clock directly, making it possible to drive the throughput
/// window deterministically in tests.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock anchored to the wall clock at construction and advanced by [`tokio::time::Instant`].
///
/// When the tokio runtime has its time paused (see [`tokio::time::pause`]) this clock moves with
/// the virtual time, so that sleeping through a full throughput window is instantaneous.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.anchor.elapsed()).unwrap_or_else(|_| TimeDelta::zero());
        self.wall + elapsed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_virtual_time() {
        let clock = TokioClock::new();
        let before = clock.now();

        tokio::time::sleep(Duration::from_secs(90)).await;

        let elapsed = clock.now() - before;
        assert!(elapsed >= TimeDelta::seconds(90));
        assert!(elapsed < TimeDelta::seconds(91));
    }
}
