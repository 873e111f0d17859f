//! In-memory collaborators for publisher tests.

use crate::config::PublisherConfig;
use crate::publisher::{Publisher, PublisherDependencies};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use trackcast_env::{
    BatteryMonitor, BoxedTask, ChannelEvent, ChannelStateListener, ConnectionStateChange, ConnectionStateListener,
    Destination, EnvError, Location, LocationObserver, LocationProvider, LocationUpdateType, PresenceData,
    PresenceListener, PresenceMessage, PublisherContext, Resolution, RoutingProfile, TokioContext, Transport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Default)]
struct TransportState {
    starts: usize,
    stops: usize,
    closes: usize,
    connects: Vec<String>,
    disconnects: Vec<String>,
    presence_updates: Vec<(String, PresenceData)>,

    /// Every publish attempt, failed ones included
    publishes: Vec<(String, ChannelEvent, String)>,

    connect_failures: VecDeque<EnvError>,
    enter_failures: VecDeque<EnvError>,
    subscribe_failures: VecDeque<EnvError>,
    publish_failures: VecDeque<EnvError>,
    connect_delay: Option<Duration>,
    publish_delay: Option<Duration>,
    panic_on_connect: bool,

    publishes_in_flight: usize,
    max_publishes_in_flight: usize,

    presence_listeners: HashMap<String, PresenceListener>,
    channel_listeners: HashMap<String, ChannelStateListener>,
}

/// Transport that records calls and fails on demand.
#[derive(Default)]
pub(crate) struct FakeTransport {
    state: Mutex<TransportState>,
}

impl FakeTransport {
    pub(crate) fn fail_next_connect(&self, error: EnvError) {
        lock(&self.state).connect_failures.push_back(error);
    }

    pub(crate) fn fail_next_enter(&self, error: EnvError) {
        lock(&self.state).enter_failures.push_back(error);
    }

    pub(crate) fn fail_next_subscribe(&self, error: EnvError) {
        lock(&self.state).subscribe_failures.push_back(error);
    }

    pub(crate) fn fail_next_publish(&self, error: EnvError) {
        lock(&self.state).publish_failures.push_back(error);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = Some(delay);
    }

    pub(crate) fn set_publish_delay(&self, delay: Duration) {
        lock(&self.state).publish_delay = Some(delay);
    }

    pub(crate) fn set_panic_on_connect(&self, panic: bool) {
        lock(&self.state).panic_on_connect = panic;
    }

    /// Highest number of publishes that were awaiting the transport at once.
    pub(crate) fn max_publishes_in_flight(&self) -> usize {
        lock(&self.state).max_publishes_in_flight
    }

    pub(crate) fn connect_count(&self, trackable_id: &str) -> usize {
        lock(&self.state).connects.iter().filter(|id| *id == trackable_id).count()
    }

    pub(crate) fn disconnect_count(&self, trackable_id: &str) -> usize {
        lock(&self.state).disconnects.iter().filter(|id| *id == trackable_id).count()
    }

    pub(crate) fn starts(&self) -> usize {
        lock(&self.state).starts
    }

    pub(crate) fn stops(&self) -> usize {
        lock(&self.state).stops
    }

    pub(crate) fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    /// Payloads of every publish attempt for one trackable and event.
    pub(crate) fn published(&self, trackable_id: &str, event: ChannelEvent) -> Vec<String> {
        lock(&self.state)
            .publishes
            .iter()
            .filter(|(id, ev, _)| id == trackable_id && *ev == event)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }

    pub(crate) fn presence_updates(&self, trackable_id: &str) -> Vec<PresenceData> {
        lock(&self.state)
            .presence_updates
            .iter()
            .filter(|(id, _)| id == trackable_id)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Delivers a presence event to the trackable's listener.
    pub(crate) fn inject_presence(&self, trackable_id: &str, message: PresenceMessage) {
        let listener = lock(&self.state).presence_listeners.get(trackable_id).cloned();
        if let Some(listener) = listener {
            listener(message);
        }
    }

    pub(crate) fn emit_channel_state(&self, trackable_id: &str, change: ConnectionStateChange) {
        let listener = lock(&self.state).channel_listeners.get(trackable_id).cloned();
        if let Some(listener) = listener {
            listener(change);
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start_connection(&self) -> Result<(), EnvError> {
        lock(&self.state).starts += 1;
        Ok(())
    }

    async fn stop_connection(&self) -> Result<(), EnvError> {
        lock(&self.state).stops += 1;
        Ok(())
    }

    async fn connect(&self, trackable_id: &str, _presence_data: &PresenceData) -> Result<(), EnvError> {
        let (delay, failure, panic) = {
            let mut state = lock(&self.state);
            state.connects.push(trackable_id.to_string());
            (state.connect_delay, state.connect_failures.pop_front(), state.panic_on_connect)
        };
        if panic {
            panic!("connect exploded");
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        failure.map_or(Ok(()), Err)
    }

    async fn disconnect(&self, trackable_id: &str, _presence_data: &PresenceData) -> Result<(), EnvError> {
        lock(&self.state).disconnects.push(trackable_id.to_string());
        Ok(())
    }

    async fn enter_presence(&self, _trackable_id: &str, _presence_data: &PresenceData) -> Result<(), EnvError> {
        lock(&self.state).enter_failures.pop_front().map_or(Ok(()), Err)
    }

    async fn publish(&self, trackable_id: &str, event: ChannelEvent, payload: String) -> Result<(), EnvError> {
        let (delay, failure) = {
            let mut state = lock(&self.state);
            state.publishes.push((trackable_id.to_string(), event, payload));
            state.publishes_in_flight += 1;
            state.max_publishes_in_flight = state.max_publishes_in_flight.max(state.publishes_in_flight);
            (state.publish_delay, state.publish_failures.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.state).publishes_in_flight -= 1;
        failure.map_or(Ok(()), Err)
    }

    async fn subscribe_for_presence(&self, trackable_id: &str, listener: PresenceListener) -> Result<(), EnvError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.subscribe_failures.pop_front() {
            return Err(error);
        }
        state.presence_listeners.insert(trackable_id.to_string(), listener);
        Ok(())
    }

    async fn update_presence_data(&self, trackable_id: &str, presence_data: &PresenceData) -> Result<(), EnvError> {
        lock(&self.state)
            .presence_updates
            .push((trackable_id.to_string(), presence_data.clone()));
        Ok(())
    }

    async fn wait_for_channel_attach(&self, _trackable_id: &str) -> Result<(), EnvError> {
        Ok(())
    }

    fn subscribe_for_connection_state(&self, _listener: ConnectionStateListener) {}

    fn subscribe_for_channel_state(&self, trackable_id: &str, listener: ChannelStateListener) {
        lock(&self.state)
            .channel_listeners
            .insert(trackable_id.to_string(), listener);
    }

    async fn close(&self, _presence_data: &PresenceData) -> Result<(), EnvError> {
        lock(&self.state).closes += 1;
        Ok(())
    }
}

// ============================================================================
// LOCATION PROVIDER
// ============================================================================

#[derive(Default)]
struct ProviderState {
    observer: Option<Arc<dyn LocationObserver>>,
    tracking: bool,
    resolutions: Vec<Resolution>,
    routes: Vec<(Destination, RoutingProfile)>,
    cleared_routes: usize,
    panic_on_clear_route: bool,
}

/// Location provider driven by the test.
pub(crate) struct FakeProvider {
    state: Mutex<ProviderState>,
    route_duration_ms: i64,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            state: Mutex::new(ProviderState::default()),
            route_duration_ms: 600_000,
        }
    }
}

impl FakeProvider {
    pub(crate) fn emit_enhanced(&self, location: Location) {
        let observer = lock(&self.state).observer.clone();
        if let Some(observer) = observer {
            observer.on_enhanced_location_changed(location, Vec::new(), LocationUpdateType::Actual);
        }
    }

    pub(crate) fn emit_raw(&self, location: Location) {
        let observer = lock(&self.state).observer.clone();
        if let Some(observer) = observer {
            observer.on_raw_location_changed(location);
        }
    }

    pub(crate) fn is_tracking(&self) -> bool {
        lock(&self.state).tracking
    }

    pub(crate) fn last_resolution(&self) -> Option<Resolution> {
        lock(&self.state).resolutions.last().copied()
    }

    pub(crate) fn routes(&self) -> Vec<(Destination, RoutingProfile)> {
        lock(&self.state).routes.clone()
    }

    pub(crate) fn cleared_routes(&self) -> usize {
        lock(&self.state).cleared_routes
    }

    pub(crate) fn set_panic_on_clear_route(&self, panic: bool) {
        lock(&self.state).panic_on_clear_route = panic;
    }
}

#[async_trait]
impl LocationProvider for FakeProvider {
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
        _current: Location,
        destination: Destination,
        profile: RoutingProfile,
    ) -> Result<i64, EnvError> {
        lock(&self.state).routes.push((destination, profile));
        Ok(self.route_duration_ms)
    }

    fn clear_route(&self) {
        let panic = {
            let mut state = lock(&self.state);
            state.cleared_routes += 1;
            state.panic_on_clear_route
        };
        if panic {
            panic!("clear_route exploded");
        }
    }
}

// ============================================================================
// BATTERY
// ============================================================================

pub(crate) struct FixedBattery(pub(crate) Option<f32>);

impl BatteryMonitor for FixedBattery {
    fn current_battery_percentage(&self) -> Option<f32> {
        self.0
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

/// Tokio context that remembers which named tasks ran to completion.
#[derive(Default)]
pub(crate) struct RecordingContext {
    inner: TokioContext,
    finished: Arc<Mutex<Vec<String>>>,
}

impl RecordingContext {
    pub(crate) fn has_finished(&self, name: &str) -> bool {
        lock(&self.finished).iter().any(|finished| finished == name)
    }
}

#[async_trait]
impl PublisherContext for RecordingContext {
    fn now(&self) -> Duration {
        self.inner.now()
    }

    fn system_time(&self) -> SystemTime {
        self.inner.system_time()
    }

    async fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration).await;
    }

    fn spawn(&self, name: &str, task: BoxedTask) {
        let finished = Arc::clone(&self.finished);
        let label = name.to_string();
        self.inner.spawn(
            name,
            Box::pin(async move {
                task.await;
                lock(&finished).push(label);
            }),
        );
    }

    fn seed(&self) -> u64 {
        self.inner.seed()
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub(crate) struct Harness {
    pub(crate) publisher: Publisher,
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) provider: Arc<FakeProvider>,
    pub(crate) context: Arc<RecordingContext>,
}

impl Harness {
    pub(crate) fn start(config: PublisherConfig) -> Self {
        Self::with_battery(config, None)
    }

    pub(crate) fn with_battery(config: PublisherConfig, battery: Option<f32>) -> Self {
        let transport = Arc::new(FakeTransport::default());
        let provider = Arc::new(FakeProvider::default());
        let context = Arc::new(RecordingContext::default());
        let dependencies = PublisherDependencies::new(
            transport.clone(),
            provider.clone(),
            Arc::new(FixedBattery(battery)),
            context.clone(),
        );
        Self {
            publisher: Publisher::start(config, dependencies),
            transport,
            provider,
            context,
        }
    }
}

/// Lets the dispatch loop and its spawned work run to quiescence.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
