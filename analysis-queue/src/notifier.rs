//! Broadcasting of aggregate [`Stats`] to subscribers.
//!
//! Snapshots are staged in the order the job table changed and delivered to every subscriber, in
//! registration order. Delivery is serialized: while one caller is flushing, snapshots staged by
//! other callers (including subscribers reacting to a snapshot) are appended to the outbox and
//! delivered by the flushing caller. A panicking subscriber is logged and skipped.
use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::{
    job::{Job, JobStatus},
    lock, panic_message,
};

/// Aggregate job counts by status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stats {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub complete: usize,
    pub failed: usize,
    /// Share of jobs in a terminal state, rounded down, `0` when there are no jobs.
    pub progress_percent: u8,
}

impl Stats {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut stats = jobs.into_iter().fold(Self::default(), |mut stats, job| {
            stats.total += 1;
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Complete => stats.complete += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            stats
        });
        if stats.total > 0 {
            stats.progress_percent = ((stats.complete + stats.failed) * 100 / stats.total) as u8;
        }
        stats
    }

    /// No job is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.processing == 0
    }
}

/// Receives [`Stats`] snapshots.
pub trait Subscriber: Send + Sync {
    fn notify(&self, stats: &Stats);

    /// A closed subscriber is dropped before the next delivery.
    fn is_closed(&self) -> bool {
        false
    }
}

impl Subscriber for mpsc::UnboundedSender<Stats> {
    fn notify(&self, stats: &Stats) {
        if let Err(err) = self.send(*stats) {
            tracing::debug!(?err, "Stats receiver dropped");
        }
    }

    fn is_closed(&self) -> bool {
        mpsc::UnboundedSender::is_closed(self)
    }
}

struct Callback<F>(F);

impl<F> Subscriber for Callback<F>
where
    F: Fn(&Stats) + Send + Sync,
{
    fn notify(&self, stats: &Stats) {
        (self.0)(stats)
    }
}

type SubscriptionId = u64;

#[derive(Default)]
struct Outbox {
    pending: VecDeque<Stats>,
    delivering: bool,
}

pub struct Notifier {
    subscribers: Mutex<Vec<(SubscriptionId, Arc<dyn Subscriber>)>>,
    outbox: Mutex<Outbox>,
    next_id: AtomicU64,
    latest: watch::Sender<Stats>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(Stats::default());
        Self {
            subscribers: Default::default(),
            outbox: Default::default(),
            next_id: AtomicU64::new(0),
            latest,
        }
    }

    pub fn subscribe(self: &Arc<Self>, subscriber: impl Subscriber + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber: Arc<dyn Subscriber> = Arc::new(subscriber);
        lock(&self.subscribers).push((id, subscriber));
        Subscription {
            id,
            notifier: Arc::downgrade(self),
        }
    }

    pub fn subscribe_fn<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&Stats) + Send + Sync + 'static,
    {
        self.subscribe(Callback(callback))
    }

    /// A receiver always holding the most recently staged snapshot.
    pub fn latest(&self) -> watch::Receiver<Stats> {
        self.latest.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Stages and immediately flushes a snapshot.
    pub fn publish(&self, stats: Stats) {
        self.stage(stats);
        self.flush();
    }

    /// Appends a snapshot to the outbox without delivering it.
    ///
    /// Callers stage while still holding the lock guarding the job table so that snapshots are
    /// delivered in the order the table changed.
    pub(crate) fn stage(&self, stats: Stats) {
        self.latest.send_replace(stats);
        lock(&self.outbox).pending.push_back(stats);
    }

    /// Wakes receivers of [`Notifier::latest`] without changing the snapshot.
    pub(crate) fn touch(&self) {
        self.latest.send_modify(|_| {});
    }

    /// Delivers every staged snapshot, unless another caller is already doing so.
    pub(crate) fn flush(&self) {
        {
            let mut outbox = lock(&self.outbox);
            if outbox.delivering {
                return;
            }
            outbox.delivering = true;
        }
        loop {
            let stats = {
                let mut outbox = lock(&self.outbox);
                match outbox.pending.pop_front() {
                    Some(stats) => stats,
                    None => {
                        outbox.delivering = false;
                        return;
                    }
                }
            };
            self.deliver(&stats);
        }
    }

    fn deliver(&self, stats: &Stats) {
        let subscribers = {
            let mut subscribers = lock(&self.subscribers);
            subscribers.retain(|(_, subscriber)| !subscriber.is_closed());
            subscribers.clone()
        };
        for (id, subscriber) in subscribers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber.notify(stats))) {
                let message = panic_message(panic.as_ref()).unwrap_or_default();
                tracing::warn!(subscription = id, "Stats subscriber panicked: {message}");
            }
        }
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(subscription, _)| *subscription != id);
        before != subscribers.len()
    }
}

/// Handle returned by [`Notifier::subscribe`].
///
/// Dropping the handle keeps the subscriber registered, call [`Subscription::unsubscribe`] to
/// remove it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    notifier: Weak<Notifier>,
}

impl Subscription {
    /// Removes the subscriber, returning whether it was still registered.
    pub fn unsubscribe(self) -> bool {
        self.notifier
            .upgrade()
            .is_some_and(|notifier| notifier.unsubscribe(self.id))
    }
}
