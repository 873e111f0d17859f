//! Trackcast Environment Abstraction Layer
//!
//! This crate provides the collaborator seams that let the publisher engine
//! run against **Production** services (a pub/sub transport, a navigation
//! SDK, an OS battery sensor) or against the **Simulation** harness.
//!
//! # Core Concept: Everything External Is A Trait
//!
//! The engine never touches I/O directly. It talks to:
//! - Time (`now()`, `sleep()`, `spawn()`) through [`PublisherContext`]
//! - Messaging (connect, presence, publish) through [`Transport`]
//! - Positioning (trips, routes, resolutions) through [`LocationProvider`]
//! - Sensors (battery level) through [`BatteryMonitor`]
//!
//! # Example
//!
//! ```ignore
//! use trackcast_env::{PublisherContext, Transport, ChannelEvent};
//!
//! async fn send<Ctx: PublisherContext>(ctx: &Ctx, transport: &dyn Transport, payload: String) {
//!     tokio::select! {
//!         result = transport.publish("T1", ChannelEvent::Enhanced, payload) => log(result),
//!         _ = ctx.sleep(Duration::from_secs(5)) => timeout(),
//!     }
//! }
//! ```

mod context;
mod transport;
mod location;
mod types;
mod error;
mod tokio_impl;
pub mod codec;

pub use context::{BoxedTask, PublisherContext};
pub use transport::{ChannelStateListener, ConnectionStateListener, PresenceListener, Transport};
pub use location::{BatteryMonitor, LocationObserver, LocationProvider};
pub use types::{
    Accuracy, ChannelEvent, ClientType, ConnectionState, ConnectionStateChange, Destination,
    EnhancedLocationUpdate, Location, LocationUpdate, LocationUpdateType, PresenceAction,
    PresenceData, PresenceMessage, Resolution, RoutingProfile,
};
pub use error::{EnvError, ErrorInformation, FailureKind, INTERNAL_ERROR_CODE};
pub use tokio_impl::TokioContext;
