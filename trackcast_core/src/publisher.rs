//! Public publisher handle.
//!
//! `Publisher::start` wires the collaborators to a dispatch loop and hands
//! back a cheap handle. Every operation is posted as a work specification
//! and awaited through a oneshot callback.
//!
//! ```text
//!   Publisher ──post──► queue ──► DispatchLoop (owns PublisherProperties)
//!       ▲                                 │
//!       └──── watch / broadcast streams ◄─┘
//! ```

use crate::callback::ResultCallback;
use crate::config::PublisherConfig;
use crate::error::{PublisherError, PublisherResult};
use crate::model::{Trackable, TrackableState};
use crate::properties::{PublisherProperties, Streams};
use crate::queue::{DispatchLoop, WorkPoster};
use crate::resolution::{DefaultResolutionPolicyFactory, Hooks, Methods, ResolutionPolicyFactory};
use crate::workers::{WorkerEnv, WorkerSpecification};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;
use trackcast_env::{
    BatteryMonitor, EnhancedLocationUpdate, Location, LocationObserver, LocationProvider, LocationUpdateType,
    PublisherContext, RoutingProfile, Transport,
};

/// Collaborators a publisher runs against.
pub struct PublisherDependencies {
    pub transport: Arc<dyn Transport>,
    pub location_provider: Arc<dyn LocationProvider>,
    pub battery: Arc<dyn BatteryMonitor>,
    pub context: Arc<dyn PublisherContext>,

    /// Custom resolution policy; the default policy is used when absent
    pub policy_factory: Option<Box<dyn ResolutionPolicyFactory>>,
}

impl PublisherDependencies {
    pub fn new(
        transport: Arc<dyn Transport>,
        location_provider: Arc<dyn LocationProvider>,
        battery: Arc<dyn BatteryMonitor>,
        context: Arc<dyn PublisherContext>,
    ) -> Self {
        Self {
            transport,
            location_provider,
            battery,
            context,
            policy_factory: None,
        }
    }

    pub fn with_policy_factory(mut self, factory: Box<dyn ResolutionPolicyFactory>) -> Self {
        self.policy_factory = Some(factory);
        self
    }
}

/// Feeds provider observations into the work queue.
struct PublisherLocationObserver {
    poster: WorkPoster,
}

impl LocationObserver for PublisherLocationObserver {
    fn on_raw_location_changed(&self, location: Location) {
        self.poster.post(WorkerSpecification::RawLocationChanged { location });
    }

    fn on_enhanced_location_changed(
        &self,
        location: Location,
        intermediate_locations: Vec<Location>,
        update_type: LocationUpdateType,
    ) {
        self.poster.post(WorkerSpecification::EnhancedLocationChanged {
            update: EnhancedLocationUpdate::new(location, intermediate_locations, update_type),
        });
    }
}

/// Handle to a running publisher.
///
/// The handle holds the only strong end of the work queue. Dropping it lets
/// the dispatch loop finish the queued work and exit.
pub struct Publisher {
    queue: mpsc::UnboundedSender<WorkerSpecification>,
    streams: Arc<Streams>,
}

impl Publisher {
    /// Builds the publisher and spawns its dispatch loop on the context.
    pub fn start(config: PublisherConfig, dependencies: PublisherDependencies) -> Self {
        let PublisherDependencies {
            transport,
            location_provider,
            battery,
            context,
            policy_factory,
        } = dependencies;

        let (queue, receiver) = mpsc::unbounded_channel();
        let poster = WorkPoster::new(&queue);

        let methods = Methods::new(poster.clone());
        let mut hooks = Hooks::default();
        let factory = policy_factory
            .unwrap_or_else(|| Box::new(DefaultResolutionPolicyFactory::new(config.default_resolution, battery)));
        let policy = factory.create(&mut hooks, methods.clone());

        let streams = Arc::new(Streams::new(config.location_stream_capacity, config.routing_profile));
        let properties = PublisherProperties::new(config, policy, hooks, methods, Arc::clone(&streams));

        let observer: Arc<dyn LocationObserver> = Arc::new(PublisherLocationObserver {
            poster: poster.clone(),
        });
        let env = WorkerEnv {
            transport: Arc::clone(&transport),
            location_provider,
            context: Arc::clone(&context),
            observer,
        };

        let connection_poster = poster.clone();
        transport.subscribe_for_connection_state(Arc::new(move |change| {
            connection_poster.post(WorkerSpecification::ConnectionStateChange { change });
        }));

        let dispatch = DispatchLoop::new(receiver, &poster, properties, env);
        context.spawn("trackcast-dispatch", Box::pin(dispatch.run()));
        info!(seed = context.seed(), "Publisher started");

        Self { queue, streams }
    }

    /// Posts a callback-bearing specification and waits for its result.
    async fn request<T>(&self, build: impl FnOnce(ResultCallback<T>) -> WorkerSpecification) -> PublisherResult<T> {
        let (callback, receiver) = ResultCallback::channel();
        if self.queue.send(build(callback)).is_err() {
            return Err(PublisherError::Stopped);
        }
        receiver.await.unwrap_or(Err(PublisherError::Stopped))
    }

    /// Starts publishing a trackable. Concurrent adds of the same trackable
    /// share one connection attempt.
    pub async fn add(&self, trackable: Trackable) -> PublisherResult<watch::Receiver<TrackableState>> {
        self.request(|callback| WorkerSpecification::AddTrackable { trackable, callback })
            .await
    }

    /// Adds the trackable and makes it the active one.
    pub async fn track(&self, trackable: Trackable) -> PublisherResult<watch::Receiver<TrackableState>> {
        let state = self.add(trackable.clone()).await?;
        self.request(|callback| WorkerSpecification::SetActiveTrackable { trackable, callback })
            .await?;
        Ok(state)
    }

    /// Stops publishing a trackable. Returns whether it was present.
    pub async fn remove(&self, trackable: &Trackable) -> PublisherResult<bool> {
        let trackable = trackable.clone();
        self.request(|callback| WorkerSpecification::RemoveTrackable { trackable, callback })
            .await
    }

    pub async fn set_routing_profile(&self, profile: RoutingProfile) -> PublisherResult<()> {
        self.request(|callback| WorkerSpecification::ChangeRoutingProfile { profile, callback })
            .await
    }

    pub fn routing_profile(&self) -> RoutingProfile {
        *self.streams.routing_profile.borrow()
    }

    pub async fn set_raw_locations_enabled(&self, enabled: bool) -> PublisherResult<()> {
        self.request(|callback| WorkerSpecification::SetRawLocationsEnabled { enabled, callback })
            .await
    }

    /// Stops the publisher, draining in-flight work for at most `timeout`.
    pub async fn stop(&self, timeout: Duration) -> PublisherResult<()> {
        self.request(|callback| WorkerSpecification::Stop { callback, timeout })
            .await
    }

    /// State stream of a tracked trackable.
    pub fn get_trackable_state(&self, trackable_id: &str) -> Option<watch::Receiver<TrackableState>> {
        self.streams.trackable_states.borrow().get(trackable_id).cloned()
    }

    /// Every enhanced location the publisher receives.
    pub fn locations(&self) -> broadcast::Receiver<EnhancedLocationUpdate> {
        self.streams.locations.subscribe()
    }

    pub fn trackables(&self) -> watch::Receiver<HashSet<Trackable>> {
        self.streams.trackables.subscribe()
    }

    pub fn active_trackable(&self) -> watch::Receiver<Option<Trackable>> {
        self.streams.active.subscribe()
    }
}
