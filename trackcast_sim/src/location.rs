//! Simulated location provider and battery sensor.

use crate::lock;
use crate::oracle::TripSample;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use trackcast_core::proximity::distance_to_destination;
use trackcast_env::{
    BatteryMonitor, Destination, EnvError, Location, LocationObserver, LocationProvider, LocationUpdateType,
    Resolution, RoutingProfile,
};

#[derive(Default)]
struct ProviderState {
    observer: Option<Arc<dyn LocationObserver>>,
    tracking: bool,
    resolutions: Vec<Resolution>,
    routes: Vec<(Destination, RoutingProfile)>,
    cleared_routes: usize,
}

/// Location provider fed by the runner with oracle samples.
#[derive(Clone)]
pub struct SimLocationProvider {
    state: Arc<Mutex<ProviderState>>,

    /// Speed used to estimate route durations, in m/s
    route_speed: f64,
}

impl SimLocationProvider {
    pub fn new(route_speed: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderState::default())),
            route_speed: route_speed.max(0.1),
        }
    }

    /// Delivers one sample to the registered observer.
    ///
    /// Returns false when nothing would receive it: no observer is
    /// registered or no trip is running.
    pub fn emit(&self, sample: &TripSample) -> bool {
        let observer = {
            let state = lock(&self.state);
            if !state.tracking {
                return false;
            }
            state.observer.clone()
        };
        let Some(observer) = observer else {
            return false;
        };
        observer.on_raw_location_changed(sample.raw);
        observer.on_enhanced_location_changed(sample.enhanced, Vec::new(), LocationUpdateType::Actual);
        true
    }

    pub fn is_tracking(&self) -> bool {
        lock(&self.state).tracking
    }

    /// Every resolution applied to the engine, in order.
    pub fn resolutions(&self) -> Vec<Resolution> {
        lock(&self.state).resolutions.clone()
    }

    pub fn last_resolution(&self) -> Option<Resolution> {
        lock(&self.state).resolutions.last().copied()
    }

    pub fn routes(&self) -> Vec<(Destination, RoutingProfile)> {
        lock(&self.state).routes.clone()
    }

    pub fn cleared_routes(&self) -> usize {
        lock(&self.state).cleared_routes
    }
}

#[async_trait]
impl LocationProvider for SimLocationProvider {
    fn start_trip(&self) {
        lock(&self.state).tracking = true;
    }

    fn stop_and_close(&self) {
        lock(&self.state).tracking = false;
    }

    fn register_location_observer(&self, observer: Arc<dyn LocationObserver>) {
        lock(&self.state).observer = Some(observer);
    }

    fn unregister_location_observer(&self) {
        lock(&self.state).observer = None;
    }

    fn change_resolution(&self, resolution: Resolution) {
        lock(&self.state).resolutions.push(resolution);
    }

    async fn set_route(
        &self,
        current: Location,
        destination: Destination,
        profile: RoutingProfile,
    ) -> Result<i64, EnvError> {
        let meters = distance_to_destination(&current, &destination);
        if !meters.is_finite() {
            return Err(EnvError::location_provider("route distance did not converge"));
        }
        lock(&self.state).routes.push((destination, profile));
        Ok((meters / self.route_speed * 1000.0) as i64)
    }

    fn clear_route(&self) {
        lock(&self.state).cleared_routes += 1;
    }
}

/// Battery whose level the runner sets between ticks.
#[derive(Clone, Default)]
pub struct SimBattery {
    level: Arc<Mutex<Option<f32>>>,
}

impl SimBattery {
    pub fn set_level(&self, level: Option<f32>) {
        *lock(&self.level) = level.map(|value| value.clamp(0.0, 100.0));
    }
}

impl BatteryMonitor for SimBattery {
    fn current_battery_percentage(&self) -> Option<f32> {
        *lock(&self.level)
    }
}
