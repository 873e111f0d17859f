//! Trackcast Core - Publisher Engine for Live Asset Tracking
//!
//! The publishing side of a live location tracking client: it connects
//! trackables to a pub/sub transport, samples positions from a location
//! provider and publishes them reliably, at a resolution negotiated with
//! the trackable's subscribers.
//!
//! 1. **Ordering**: every state change runs on a single dispatch loop, so
//!    concurrent API calls, transport callbacks and location updates never race
//! 2. **Reliability**: one outstanding publish per trackable, bounded retries,
//!    and a skipped-location buffer carried on the next successful publish
//! 3. **Adaptivity**: a pluggable resolution policy reacting to subscribers,
//!    proximity to the destination and battery level
//!
//! ```text
//!   Publisher (handle) ──► work queue ──► DispatchLoop ──► workers ──► Transport
//!                                              ▲                  └──► LocationProvider
//!   LocationProvider ──► LocationObserver ─────┘
//! ```

pub mod callback;
pub mod config;
pub mod error;
pub mod guards;
pub mod model;
pub mod presence;
pub mod properties;
pub mod proximity;
pub mod publisher;
pub mod publishing;
pub mod resolution;

mod queue;
mod workers;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use callback::ResultCallback;
pub use config::PublisherConfig;
pub use error::{PublisherError, PublisherResult};
pub use guards::{DuplicateOperationGuard, RemovalGuard};
pub use model::{
    Proximity, ResolutionConstraints, ResolutionRequest, ResolutionSet, Subscriber, Trackable, TrackableState,
};
pub use presence::{is_newer_than, PresenceMembers};
pub use properties::PublisherState;
pub use proximity::{distance_between, is_threshold_reached, vincenty_distance};
pub use publisher::{Publisher, PublisherDependencies};
pub use publishing::{LocationsPublishingState, SkippedLocations};
pub use resolution::{
    combine_resolutions, DefaultResolutionPolicy, DefaultResolutionPolicyFactory, Hooks, Methods, ProximityHandler,
    ResolutionPolicy, ResolutionPolicyFactory, SubscriberSetListener, TrackableSetListener,
};
