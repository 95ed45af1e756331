//! Throttled progress callbacks
//!
//! Each registration gets its own tracker. A tracker fires immediately when
//! it has not fired within its period; otherwise it schedules a single
//! delayed call for the end of the period and drops further requests until
//! that call runs. The delayed call recomputes progress when it fires, so
//! the caller always sees the latest state.
//!
//! Before invoking a callback the tracker asks the transfer for a report.
//! The transfer compares the progress fingerprint with the one last reported
//! to that callback and returns nothing if they match, which suppresses
//! duplicate notifications.

use crate::BoxFuture;
use dashmap::DashMap;
use shardcast_crypto::TransferId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A transfer that can describe its own progress
pub trait ProgressReporter: Send + Sync + 'static {
    /// Progress value handed to callbacks
    type Progress: Send + Sync + 'static;

    /// Transfer ID
    fn tid(&self) -> TransferId;

    /// Current progress, or `None` if `callback_id` already saw an
    /// identical report
    fn report(&self, callback_id: u64) -> BoxFuture<'_, Option<Self::Progress>>;
}

type Callback<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct CallbackTracker<P> {
    id: u64,
    period: Duration,
    callback: Callback<P>,
    last_call: std::sync::Mutex<Option<Instant>>,
    scheduled: AtomicBool,
    stopped: AtomicBool,
    // Serializes report + invoke so reports reach the callback in order
    fire_lock: tokio::sync::Mutex<()>,
}

impl<P: Send + Sync + 'static> CallbackTracker<P> {
    fn since_last_call(&self) -> Option<Duration> {
        self.last_call
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|last| last.elapsed())
    }

    async fn call<R>(self: &Arc<Self>, reporter: &Arc<R>)
    where
        R: ProgressReporter<Progress = P>,
    {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        match self.since_last_call() {
            Some(elapsed) if elapsed < self.period => {
                if self.scheduled.swap(true, Ordering::AcqRel) {
                    return;
                }

                let tracker = Arc::clone(self);
                let reporter = Arc::clone(reporter);
                let wait = self.period - elapsed;
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    tracker.scheduled.store(false, Ordering::Release);
                    tracker.fire(&reporter).await;
                });
            }
            _ => self.fire(reporter).await,
        }
    }

    async fn fire<R>(&self, reporter: &Arc<R>)
    where
        R: ProgressReporter<Progress = P>,
    {
        let _guard = self.fire_lock.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        *self.last_call.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        if let Some(progress) = reporter.report(self.id).await {
            (self.callback)(&progress);
        }
    }
}

/// Progress callback registrations of one transfer direction
pub struct CallbackManager<R: ProgressReporter> {
    trackers: DashMap<TransferId, Vec<Arc<CallbackTracker<R::Progress>>>>,
    next_id: AtomicU64,
}

impl<R: ProgressReporter> Default for CallbackManager<R> {
    fn default() -> Self {
        Self {
            trackers: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<R: ProgressReporter> CallbackManager<R> {
    /// No registrations
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `transfer` and report current progress to it
    /// immediately.
    ///
    /// Returns the callback ID.
    pub async fn register(
        &self,
        transfer: &Arc<R>,
        callback: Arc<dyn Fn(&R::Progress) + Send + Sync>,
        period: Duration,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let tracker = Arc::new(CallbackTracker {
            id,
            period,
            callback,
            last_call: std::sync::Mutex::new(None),
            scheduled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            fire_lock: tokio::sync::Mutex::new(()),
        });

        self.trackers
            .entry(transfer.tid())
            .or_default()
            .push(Arc::clone(&tracker));
        tracker.call(transfer).await;
        id
    }

    /// Notify every callback registered for `transfer`
    pub async fn call(&self, transfer: &Arc<R>) {
        let trackers = self
            .trackers
            .get(&transfer.tid())
            .map(|t| t.value().clone())
            .unwrap_or_default();

        for tracker in trackers {
            tracker.call(transfer).await;
        }
    }

    /// Drop every callback of `tid`, cancelling scheduled calls
    pub fn delete(&self, tid: &TransferId) {
        if let Some((_, trackers)) = self.trackers.remove(tid) {
            for tracker in trackers {
                tracker.stopped.store(true, Ordering::Release);
            }
        }
    }

    /// Number of callbacks registered for `tid`
    #[must_use]
    pub fn count(&self, tid: &TransferId) -> usize {
        self.trackers.get(tid).map_or(0, |t| t.len())
    }
}
