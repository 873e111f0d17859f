//! Work dispatch loop.
//!
//! A single task owns [`PublisherProperties`] and processes work
//! specifications strictly in arrival order. Workers run synchronously
//! against the properties; anything that suspends is scheduled as a
//! separate task whose outcome comes back as another specification.
//!
//! ```text
//!   public API ─┐
//!   transport ──┼──► mpsc (unbounded, FIFO) ──► DispatchLoop ──► do_work(&mut props)
//!   provider ───┘          ▲                                        │
//!                          │                                        │ scheduled async work
//!                          └──────── post(follow-up spec) ◄─────────┘ (spawned, inflight-tracked)
//! ```
//!
//! After `Stop` the properties are dropped; later specifications only run
//! their `do_when_stopped` hook.

use crate::error::PublisherError;
use crate::properties::PublisherProperties;
use crate::workers::{self, WorkContext, WorkerEnv, WorkerSpecification};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

// ============================================================================
// POSTING
// ============================================================================

/// Posting half of the work queue held by workers, listeners and policy
/// methods.
///
/// Only the [`Publisher`](crate::Publisher) handle keeps the queue open.
/// Posters hold a weak sender, so the listeners and observers owned by the
/// loop never keep it alive on their own.
#[derive(Clone)]
pub(crate) struct WorkPoster {
    sender: mpsc::WeakUnboundedSender<WorkerSpecification>,
}

impl WorkPoster {
    pub(crate) fn new(sender: &mpsc::UnboundedSender<WorkerSpecification>) -> Self {
        Self {
            sender: sender.downgrade(),
        }
    }

    /// Enqueues a specification. Returns false once the queue is closed.
    pub(crate) fn post(&self, spec: WorkerSpecification) -> bool {
        let Some(sender) = self.sender.upgrade() else {
            debug!(spec = spec.name(), "Work queue closed, dropping work");
            return false;
        };
        match sender.send(spec) {
            Ok(()) => true,
            Err(mpsc::error::SendError(spec)) => {
                debug!(spec = spec.name(), "Dispatch loop gone, dropping work");
                false
            }
        }
    }
}

// ============================================================================
// INFLIGHT TRACKING
// ============================================================================

/// Counts scheduled work that has not finished yet.
#[derive(Default)]
pub(crate) struct InflightTracker {
    count: AtomicUsize,
    notify: Notify,
}

impl InflightTracker {
    pub(crate) fn enter(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once no tracked work is running.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent drop to zero is not missed
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the inflight count on drop.
pub(crate) struct InflightGuard {
    tracker: Arc<InflightTracker>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.notify.notify_waiters();
        }
    }
}

// ============================================================================
// SCHEDULED WORK
// ============================================================================

/// Maps an unexpected async failure to a follow-up specification.
pub(crate) type AsyncFallback = Box<dyn FnOnce(PublisherError) -> Option<WorkerSpecification> + Send>;

/// Async work registered by a worker, spawned after `do_work` returns.
pub(crate) struct ScheduledWork {
    pub(crate) name: &'static str,

    /// Sleep before starting; not counted as inflight
    pub(crate) delay: Option<Duration>,

    /// Counted by the stop drain
    pub(crate) tracked: bool,

    pub(crate) future: BoxFuture<'static, Result<(), PublisherError>>,

    /// Overrides the origin worker's `on_unexpected_async_error`
    pub(crate) fallback: Option<AsyncFallback>,
}

// ============================================================================
// DISPATCH LOOP
// ============================================================================

pub(crate) struct DispatchLoop {
    receiver: mpsc::UnboundedReceiver<WorkerSpecification>,
    poster: WorkPoster,
    properties: Option<PublisherProperties>,
    env: WorkerEnv,
    inflight: Arc<InflightTracker>,
}

impl DispatchLoop {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<WorkerSpecification>,
        poster: &WorkPoster,
        properties: PublisherProperties,
        env: WorkerEnv,
    ) -> Self {
        Self {
            receiver,
            poster: poster.clone(),
            properties: Some(properties),
            env,
            inflight: Arc::new(InflightTracker::default()),
        }
    }

    /// Runs until the publisher handle is dropped and the queue is empty.
    pub(crate) async fn run(mut self) {
        while let Some(spec) = self.receiver.recv().await {
            self.process(spec);
        }
        debug!("Dispatch loop finished");
    }

    fn process(&mut self, spec: WorkerSpecification) {
        let poster = self.poster.clone();
        let name = spec.name();
        let Some(properties) = self.properties.as_mut() else {
            debug!(spec = name, "Publisher stopped");
            workers::do_when_stopped(spec);
            return;
        };

        debug!(spec = name, "Processing work");
        let origin = spec.clone();
        let mut ctx = WorkContext::new(&self.env, &poster, &self.inflight);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| workers::do_work(spec, properties, &mut ctx)))
            .unwrap_or_else(|panic| Err(PublisherError::unexpected(panic_message(&panic))));

        let scheduled = ctx.into_scheduled();
        let stopped = properties.is_stopped();
        if let Err(err) = outcome {
            error!(spec = name, error = %err, "Unexpected error in worker");
            if let Some(next) = workers::on_unexpected_error(origin.clone(), err) {
                poster.post(next);
            }
        }

        for work in scheduled {
            self.spawn(work, origin.clone(), poster.clone());
        }

        if stopped {
            debug!("Publisher stopped, releasing properties");
            self.properties = None;
        }
    }

    fn spawn(&self, work: ScheduledWork, origin: WorkerSpecification, poster: WorkPoster) {
        let ScheduledWork {
            name,
            delay,
            tracked,
            future,
            fallback,
        } = work;
        let context = Arc::clone(&self.env.context);
        let inflight = Arc::clone(&self.inflight);
        // Immediate work counts from the moment it is spawned
        let early_guard = (tracked && delay.is_none()).then(|| inflight.enter());
        let task = async move {
            let _guard = match delay {
                Some(delay) => {
                    context.sleep(delay).await;
                    tracked.then(|| inflight.enter())
                }
                None => early_guard,
            };
            let outcome = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(PublisherError::unexpected(panic_message(&panic))));
            if let Err(err) = outcome {
                warn!(task = name, error = %err, "Unexpected error in async work");
                let next = match fallback {
                    Some(fallback) => fallback(err),
                    None => workers::on_unexpected_async_error(origin, err),
                };
                if let Some(next) = next {
                    poster.post(next);
                }
            }
        };
        self.env.context.spawn(name, Box::pin(task));
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_idle_without_work_returns() {
        let tracker = Arc::new(InflightTracker::default());
        tracker.wait_idle().await;
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_resolves_when_last_guard_drops() {
        let tracker = Arc::new(InflightTracker::default());
        let first = tracker.enter();
        let second = tracker.enter();
        assert_eq!(tracker.count(), 2);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        drop(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(second);
        waiter.await.unwrap();
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_post_after_loop_gone_reports_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        let poster = WorkPoster::new(&tx);
        drop(rx);
        assert!(!poster.post(WorkerSpecification::RefreshResolutionPolicy));
    }

    #[test]
    fn test_posters_do_not_keep_queue_open() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poster = WorkPoster::new(&tx);
        assert!(poster.post(WorkerSpecification::RefreshResolutionPolicy));

        drop(tx);
        assert!(!poster.post(WorkerSpecification::RefreshResolutionPolicy));
        assert!(matches!(rx.try_recv(), Ok(WorkerSpecification::RefreshResolutionPolicy)));
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }
}
