//! Core environment context trait for the publisher engine.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A spawned unit of background work.
pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the clock and the task executor so that the
/// dispatch loop can run in production (tokio) and in the simulation
/// harness with a virtual clock.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::spawn`
/// - **Simulation**: `SimContext` - virtual epoch over paused tokio time
///
/// The trait is object safe: the engine holds it as `Arc<dyn PublisherContext>`.
#[async_trait]
pub trait PublisherContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for ETAs and location timestamps.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: sleeps on the (possibly paused) tokio clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// The name is attached to the task's tracing span.
    fn spawn(&self, name: &str, task: BoxedTask);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
