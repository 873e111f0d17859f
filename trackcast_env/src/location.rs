//! Location provider and sensor abstractions.

use crate::error::EnvError;
use crate::types::{Destination, Location, LocationUpdateType, Resolution, RoutingProfile};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives position observations from a [`LocationProvider`].
pub trait LocationObserver: Send + Sync {
    /// A raw (unfiltered) position sample.
    fn on_raw_location_changed(&self, location: Location);

    /// A map-matched position with the key points since the previous one.
    fn on_enhanced_location_changed(
        &self,
        location: Location,
        intermediate_locations: Vec<Location>,
        update_type: LocationUpdateType,
    );
}

/// The navigation engine that samples positions and computes routes.
///
/// # Implementations
///
/// - **Production**: wraps a navigation SDK trip session
/// - **Simulation**: `SimLocationProvider` - replays oracle trips
#[async_trait]
pub trait LocationProvider: Send + Sync + 'static {
    /// Starts a trip session; observations start flowing.
    fn start_trip(&self);

    /// Stops the trip session and releases the engine.
    fn stop_and_close(&self);

    /// Registers the single observer of position updates.
    fn register_location_observer(&self, observer: Arc<dyn LocationObserver>);

    /// Removes the registered observer, if any.
    fn unregister_location_observer(&self);

    /// Reconfigures sampling accuracy and frequency.
    fn change_resolution(&self, resolution: Resolution);

    /// Sets a route from `current` to `destination`.
    ///
    /// # Returns
    /// The estimated route duration in milliseconds.
    async fn set_route(
        &self,
        current: Location,
        destination: Destination,
        profile: RoutingProfile,
    ) -> Result<i64, EnvError>;

    /// Clears the active route.
    fn clear_route(&self);
}

/// Platform battery sensor.
pub trait BatteryMonitor: Send + Sync + 'static {
    /// Current battery percentage (0-100), `None` when unknown.
    fn current_battery_percentage(&self) -> Option<f32>;
}
