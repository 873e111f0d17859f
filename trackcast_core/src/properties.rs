//! Publisher state.
//!
//! `PublisherProperties` is the single mutable record of everything the
//! publisher knows. It is owned by the dispatch loop and handed to workers
//! as `&mut`; nothing else holds it.
//!
//! ```text
//!   ┌───────────────────────── PublisherProperties ─────────────────────────┐
//!   │ lifecycle: Idle → Connecting → Connected → Disconnecting → Idle        │
//!   │            (any) → Stopped                                            │
//!   │                                                                       │
//!   │ tracked ◄── ConnectionReady          adding ◄── DuplicateOperationGuard│
//!   │ removing ◄─ RemoveTrackable          marked ◄── RemovalGuard          │
//!   │                                                                       │
//!   │ per trackable: state channel, resolution, subscribers, requests,      │
//!   │   presence flags, last sent locations, publishing state, skipped      │
//!   └───────────────────────────────────────────────────────────────────────┘
//! ```

use crate::config::PublisherConfig;
use crate::error::{PublisherError, PublisherResult};
use crate::guards::{DuplicateOperationGuard, RemovalGuard};
use crate::model::{ResolutionRequest, Subscriber, Trackable, TrackableState};
use crate::presence::PresenceMembers;
use crate::publishing::{LocationsPublishingState, SkippedLocations};
use crate::resolution::{Hooks, Methods, ResolutionPolicy};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;
use trackcast_env::{
    ConnectionState, ConnectionStateChange, Destination, EnhancedLocationUpdate, ErrorInformation,
    Location, LocationUpdate, PresenceData, Resolution, RoutingProfile,
};

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Connection-level lifecycle of the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// No transport connection
    Idle,
    /// The first trackable is starting the connection
    Connecting,
    Connected,
    /// The last trackable was removed and the connection is stopping
    Disconnecting,
    /// Terminal
    Stopped,
}

impl PublisherState {
    /// Lifecycle transitions in progress; adds are re-queued meanwhile.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, PublisherState::Connecting | PublisherState::Disconnecting)
    }
}

// ============================================================================
// STREAMS
// ============================================================================

/// Observable outputs shared between the loop and the public handle.
pub(crate) struct Streams {
    pub(crate) locations: broadcast::Sender<EnhancedLocationUpdate>,
    pub(crate) trackables: watch::Sender<HashSet<Trackable>>,
    pub(crate) trackable_states: watch::Sender<HashMap<String, watch::Receiver<TrackableState>>>,
    pub(crate) active: watch::Sender<Option<Trackable>>,
    pub(crate) routing_profile: watch::Sender<RoutingProfile>,
}

impl Streams {
    pub(crate) fn new(location_capacity: usize, routing_profile: RoutingProfile) -> Self {
        let (locations, _) = broadcast::channel(location_capacity.max(1));
        Self {
            locations,
            trackables: watch::Sender::new(HashSet::new()),
            trackable_states: watch::Sender::new(HashMap::new()),
            active: watch::Sender::new(None),
            routing_profile: watch::Sender::new(routing_profile),
        }
    }
}

// ============================================================================
// PROPERTIES
// ============================================================================

pub struct PublisherProperties {
    pub(crate) config: PublisherConfig,
    lifecycle: PublisherState,

    /// Trackables that finished adding, keyed by id
    pub(crate) tracked: HashMap<String, Trackable>,

    /// Tracked trackables whose removal is disconnecting
    pub(crate) removing: HashSet<String>,

    state_channels: HashMap<String, watch::Sender<TrackableState>>,

    /// Terminal state set by removal or failure; overrides derivation
    final_states: HashMap<String, TrackableState>,

    /// Latest non-retriable error per trackable
    pub(crate) last_errors: HashMap<String, ErrorInformation>,

    pub(crate) connection_state: ConnectionStateChange,
    pub(crate) channel_states: HashMap<String, ConnectionStateChange>,

    pub(crate) resolutions: HashMap<String, Resolution>,

    /// Requested resolution per trackable, per subscriber member key
    pub(crate) requests: HashMap<String, HashMap<String, Resolution>>,
    pub(crate) subscribers: HashMap<String, HashSet<Subscriber>>,
    pub(crate) presence_members: HashMap<String, PresenceMembers>,

    pub(crate) entered_presence: HashSet<String>,
    pub(crate) subscribed_to_presence: HashSet<String>,
    pub(crate) has_sent_location: HashSet<String>,

    pub(crate) last_sent_enhanced: HashMap<String, Location>,
    pub(crate) last_sent_raw: HashMap<String, Location>,
    pub(crate) enhanced_publishing: LocationsPublishingState<EnhancedLocationUpdate>,
    pub(crate) raw_publishing: LocationsPublishingState<LocationUpdate>,
    pub(crate) skipped_enhanced: SkippedLocations,
    pub(crate) skipped_raw: SkippedLocations,

    pub(crate) active: Option<Trackable>,
    pub(crate) current_destination: Option<Destination>,

    /// Destination set before the first raw position was known
    pub(crate) pending_destination: Option<Destination>,
    pub(crate) estimated_arrival_ms: Option<i64>,
    pub(crate) routing_profile: RoutingProfile,

    pub(crate) raw_locations_enabled: bool,
    pub(crate) presence_data: PresenceData,
    pub(crate) last_publisher_location: Option<Location>,
    pub(crate) is_tracking: bool,
    pub(crate) location_engine_resolution: Option<Resolution>,

    pub(crate) duplicate_guard: DuplicateOperationGuard<watch::Receiver<TrackableState>>,
    pub(crate) removal_guard: RemovalGuard,

    pub(crate) policy: Box<dyn ResolutionPolicy>,
    pub(crate) hooks: Hooks,
    pub(crate) methods: Methods,
    streams: Arc<Streams>,
}

impl PublisherProperties {
    pub(crate) fn new(
        config: PublisherConfig,
        policy: Box<dyn ResolutionPolicy>,
        hooks: Hooks,
        methods: Methods,
        streams: Arc<Streams>,
    ) -> Self {
        let max_retries = config.max_publish_retries;
        let max_skipped = config.max_skipped_locations;
        Self {
            lifecycle: PublisherState::Idle,
            tracked: HashMap::new(),
            removing: HashSet::new(),
            state_channels: HashMap::new(),
            final_states: HashMap::new(),
            last_errors: HashMap::new(),
            connection_state: ConnectionStateChange::new(ConnectionState::Offline),
            channel_states: HashMap::new(),
            resolutions: HashMap::new(),
            requests: HashMap::new(),
            subscribers: HashMap::new(),
            presence_members: HashMap::new(),
            entered_presence: HashSet::new(),
            subscribed_to_presence: HashSet::new(),
            has_sent_location: HashSet::new(),
            last_sent_enhanced: HashMap::new(),
            last_sent_raw: HashMap::new(),
            enhanced_publishing: LocationsPublishingState::new(max_retries),
            raw_publishing: LocationsPublishingState::new(max_retries),
            skipped_enhanced: SkippedLocations::new(max_skipped),
            skipped_raw: SkippedLocations::new(max_skipped),
            active: None,
            current_destination: None,
            pending_destination: None,
            estimated_arrival_ms: None,
            routing_profile: config.routing_profile,
            raw_locations_enabled: config.raw_locations_enabled,
            presence_data: PresenceData::publisher(config.raw_locations_enabled),
            last_publisher_location: None,
            is_tracking: false,
            location_engine_resolution: None,
            duplicate_guard: DuplicateOperationGuard::new(),
            removal_guard: RemovalGuard::new(),
            policy,
            hooks,
            methods,
            streams,
            config,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn state(&self) -> PublisherState {
        self.lifecycle
    }

    /// Moves the lifecycle. Nothing leaves `Stopped`.
    pub fn set_state(&mut self, next: PublisherState) -> PublisherResult<()> {
        if self.lifecycle == PublisherState::Stopped {
            return Err(PublisherError::Stopped);
        }
        if self.lifecycle != next {
            debug!(from = ?self.lifecycle, to = ?next, "Publisher state changed");
            self.lifecycle = next;
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle == PublisherState::Stopped
    }

    /// True when no trackable is tracked, being added or awaiting removal.
    pub fn has_no_trackables_adding_or_added(&self) -> bool {
        self.tracked.is_empty() && !self.duplicate_guard.is_adding_any() && !self.removal_guard.is_marked_any()
    }

    pub fn is_tracked(&self, trackable_id: &str) -> bool {
        self.tracked.contains_key(trackable_id)
    }

    /// Defers a removal until the in-flight add resolves.
    ///
    /// The trackable stops counting as "adding" so it is never both adding
    /// and marked.
    pub(crate) fn mark_for_removal(&mut self, trackable_id: &str, callback: crate::callback::ResultCallback<bool>) {
        self.duplicate_guard.stop_adding(trackable_id);
        self.removal_guard.mark_for_removal(trackable_id, callback);
    }

    // ------------------------------------------------------------------------
    // Trackable states
    // ------------------------------------------------------------------------

    /// Creates the state channel for a newly tracked trackable.
    pub(crate) fn create_state_channel(&mut self, trackable_id: &str) -> watch::Receiver<TrackableState> {
        let initial = self.derive_trackable_state(trackable_id);
        let sender = self
            .state_channels
            .entry(trackable_id.to_string())
            .or_insert_with(|| watch::Sender::new(initial));
        let receiver = sender.subscribe();
        self.publish_state_channels();
        receiver
    }

    pub(crate) fn state_receiver(&self, trackable_id: &str) -> Option<watch::Receiver<TrackableState>> {
        self.state_channels.get(trackable_id).map(watch::Sender::subscribe)
    }

    pub(crate) fn remove_state_channel(&mut self, trackable_id: &str) {
        if self.state_channels.remove(trackable_id).is_some() {
            self.publish_state_channels();
        }
    }

    fn publish_state_channels(&self) {
        let receivers = self
            .state_channels
            .iter()
            .map(|(id, sender)| (id.clone(), sender.subscribe()))
            .collect();
        self.streams.trackable_states.send_replace(receivers);
    }

    /// Finalizes the trackable's state and emits it.
    pub(crate) fn set_final_state(&mut self, trackable_id: &str, state: TrackableState) {
        self.final_states.insert(trackable_id.to_string(), state);
        self.update_trackable_state(trackable_id);
    }

    pub(crate) fn is_finalized(&self, trackable_id: &str) -> bool {
        self.final_states.contains_key(trackable_id)
    }

    pub(crate) fn derive_trackable_state(&self, trackable_id: &str) -> TrackableState {
        if let Some(state) = self.final_states.get(trackable_id) {
            return state.clone();
        }

        let failure = |change: &ConnectionStateChange, what: &str| {
            change
                .error_information
                .clone()
                .unwrap_or_else(|| ErrorInformation::internal(format!("{what} failed")))
        };
        if self.connection_state.state == ConnectionState::Failed {
            return TrackableState::Failed(failure(&self.connection_state, "Connection"));
        }
        let channel = self.channel_states.get(trackable_id);
        if let Some(change) = channel.filter(|change| change.state == ConnectionState::Failed) {
            return TrackableState::Failed(failure(change, "Channel"));
        }

        let online = self.connection_state.state == ConnectionState::Online
            && channel.map_or(false, |change| change.state == ConnectionState::Online)
            && self.has_sent_location.contains(trackable_id)
            && self.entered_presence.contains(trackable_id)
            && self.subscribed_to_presence.contains(trackable_id);
        if online {
            TrackableState::Online
        } else {
            TrackableState::Offline(self.last_errors.get(trackable_id).cloned())
        }
    }

    /// Re-derives the trackable's state, emitting only on change.
    pub(crate) fn update_trackable_state(&mut self, trackable_id: &str) {
        let derived = self.derive_trackable_state(trackable_id);
        if let Some(sender) = self.state_channels.get(trackable_id) {
            let changed = sender.send_if_modified(|current| {
                if *current == derived {
                    false
                } else {
                    *current = derived.clone();
                    true
                }
            });
            if changed {
                debug!(trackable = %trackable_id, state = ?derived, "Trackable state changed");
            }
        }
    }

    pub(crate) fn update_all_trackable_states(&mut self) {
        let ids: Vec<String> = self.tracked.keys().cloned().collect();
        for id in ids {
            self.update_trackable_state(&id);
        }
    }

    // ------------------------------------------------------------------------
    // Resolutions
    // ------------------------------------------------------------------------

    /// Runs the policy for one trackable and stores the result.
    pub(crate) fn resolve_resolution(&mut self, trackable: &Trackable) -> Resolution {
        let remote_requests = self
            .requests
            .get(&trackable.id)
            .map(|requests| requests.values().copied().collect())
            .unwrap_or_default();
        let resolution = self.policy.resolve(&ResolutionRequest {
            trackable: trackable.clone(),
            remote_requests,
        });
        self.resolutions.insert(trackable.id.clone(), resolution);
        resolution
    }

    /// The resolution the location engine should run at.
    pub(crate) fn combined_engine_resolution(&self) -> Resolution {
        if let Some(constant) = self.config.constant_location_engine_resolution {
            return constant;
        }
        let resolutions: Vec<Resolution> = self.resolutions.values().copied().collect();
        self.policy.resolve_set(&resolutions)
    }

    // ------------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------------

    pub(crate) fn publish_trackables(&self) {
        let set: HashSet<Trackable> = self.tracked.values().cloned().collect();
        self.streams.trackables.send_replace(set);
    }

    pub(crate) fn publish_active(&self) {
        self.streams.active.send_replace(self.active.clone());
    }

    pub(crate) fn publish_routing_profile(&self) {
        self.streams.routing_profile.send_replace(self.routing_profile);
    }

    pub(crate) fn emit_location(&self, update: EnhancedLocationUpdate) {
        // No receivers is fine
        let _ = self.streams.locations.send(update);
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Drops every per-trackable structure. Returns whether it had a resolution.
    pub(crate) fn forget_trackable(&mut self, trackable_id: &str) -> bool {
        self.tracked.remove(trackable_id);
        self.removing.remove(trackable_id);
        self.remove_state_channel(trackable_id);
        self.final_states.remove(trackable_id);
        self.last_errors.remove(trackable_id);
        self.channel_states.remove(trackable_id);
        self.subscribers.remove(trackable_id);
        self.requests.remove(trackable_id);
        self.presence_members.remove(trackable_id);
        self.entered_presence.remove(trackable_id);
        self.subscribed_to_presence.remove(trackable_id);
        self.has_sent_location.remove(trackable_id);
        self.last_sent_enhanced.remove(trackable_id);
        self.last_sent_raw.remove(trackable_id);
        self.enhanced_publishing.clear(trackable_id);
        self.raw_publishing.clear(trackable_id);
        self.skipped_enhanced.clear(trackable_id);
        self.skipped_raw.clear(trackable_id);
        self.publish_trackables();
        self.resolutions.remove(trackable_id).is_some()
    }

    /// Releases everything after stop. Pending callers fail with `Stopped`.
    pub(crate) fn dispose(&mut self) {
        self.duplicate_guard.clear_all(PublisherError::Stopped);
        self.removal_guard.clear_all(PublisherError::Stopped);
        self.tracked.clear();
        self.removing.clear();
        self.state_channels.clear();
        self.final_states.clear();
        self.last_errors.clear();
        self.channel_states.clear();
        self.resolutions.clear();
        self.requests.clear();
        self.subscribers.clear();
        self.presence_members.clear();
        self.entered_presence.clear();
        self.subscribed_to_presence.clear();
        self.has_sent_location.clear();
        self.last_sent_enhanced.clear();
        self.last_sent_raw.clear();
        self.enhanced_publishing.clear_all();
        self.raw_publishing.clear_all();
        self.skipped_enhanced.clear_all();
        self.skipped_raw.clear_all();
        self.active = None;
        self.current_destination = None;
        self.pending_destination = None;
        self.estimated_arrival_ms = None;
        self.publish_trackables();
        self.publish_active();
        self.publish_state_channels();
    }
}
