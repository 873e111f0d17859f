//! Trackcast Deterministic Simulation Harness
//!
//! Runs the real publisher engine against simulated collaborators, so
//! that reliability properties can be checked end to end and replayed
//! from a seed.
//!
//! # Core Principle: Everything Nondeterministic Is Owned By The Harness
//!
//! - **Time**: a paused tokio clock, advanced only when every task is idle
//! - **Transport**: in-memory, with scripted failures, latency and seeded loss
//! - **Positions**: a ground-truth trip with Gaussian sensor noise
//! - **Randomness**: every stream derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                        │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │ tokio current_thread runtime (paused clock)         │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! │   TripOracle ──► SimLocationProvider ──► Publisher        │
//! │                                             │             │
//! │   SimTransportController ◄──── SimTransport ◄┘            │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trackcast_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_duration(60.0).run(ScenarioId::FlakyNetwork);
//! assert!(result.passed);
//! ```

mod context;
mod location;
mod oracle;
mod runner;
mod transport;
pub mod config;
pub mod scenarios;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{load_config, ConfigError, SimFileConfig, SimSettings};
pub use context::SimContext;
pub use location::{SimBattery, SimLocationProvider};
pub use oracle::{TripOracle, TripSample};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use transport::{
    subscriber_message, PublishRecord, PublishedLocation, SimOperation, SimTransport, SimTransportController,
    TransportStats,
};

/// Locks a simulation mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
