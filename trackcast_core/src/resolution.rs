//! Resolution Policy Engine
//!
//! Computes the sampling resolution for each trackable from its declared
//! constraints, the resolutions its subscribers request and the battery
//! level.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 ResolutionPolicyFactory::create              │
//! │   (called once per publisher with Hooks + Methods)           │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │ registers listeners          │ keeps Methods
//!        ┌────────▼─────────┐           ┌────────▼──────────────────┐
//!        │      Hooks       │           │         Methods           │
//!        │ • trackable set  │           │ • refresh()               │
//!        │ • subscriber set │           │ • set_proximity_threshold │
//!        └──────────────────┘           │ • cancel_proximity_thr.   │
//!                                       └───────────────────────────┘
//! ```
//!
//! Listeners fire from inside the dispatch loop. `Methods::refresh` posts
//! a `RefreshResolutionPolicy` work item rather than re-resolving inline.

use crate::model::{Proximity, ResolutionRequest, Subscriber, Trackable};
use crate::queue::WorkPoster;
use crate::workers::WorkerSpecification;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use trackcast_env::{BatteryMonitor, Resolution};

// ============================================================================
// POLICY INTERFACES
// ============================================================================

/// Strategy that turns requests into resolutions.
pub trait ResolutionPolicy: Send {
    /// Resolution for one trackable.
    fn resolve(&self, request: &ResolutionRequest) -> Resolution;

    /// Resolution for the location engine, given every trackable's resolution.
    fn resolve_set(&self, resolutions: &[Resolution]) -> Resolution;
}

/// Builds the publisher's policy.
pub trait ResolutionPolicyFactory: Send {
    fn create(self: Box<Self>, hooks: &mut Hooks, methods: Methods) -> Box<dyn ResolutionPolicy>;
}

/// Notified when trackables are added, removed or made active.
pub trait TrackableSetListener: Send + Sync {
    fn on_trackable_added(&self, trackable: &Trackable);
    fn on_trackable_removed(&self, trackable: &Trackable);
    fn on_active_trackable_changed(&self, active: Option<&Trackable>);
}

/// Notified when subscribers join or leave a trackable's channel.
pub trait SubscriberSetListener: Send + Sync {
    fn on_subscriber_added(&self, subscriber: &Subscriber);
    fn on_subscriber_removed(&self, subscriber: &Subscriber);
}

/// Notified about a registered proximity threshold.
pub trait ProximityHandler: Send + Sync {
    /// The threshold was crossed. Delivered at most once per registration.
    fn on_proximity_reached(&self, threshold: &Proximity);

    /// The registration was replaced or cancelled before being reached.
    fn on_proximity_cancelled(&self);
}

// ============================================================================
// HOOKS
// ============================================================================

/// Listener registrations made by the policy factory.
#[derive(Default)]
pub struct Hooks {
    trackables: Option<Arc<dyn TrackableSetListener>>,
    subscribers: Option<Arc<dyn SubscriberSetListener>>,
}

impl Hooks {
    pub fn trackables(&mut self, listener: Arc<dyn TrackableSetListener>) {
        self.trackables = Some(listener);
    }

    pub fn subscribers(&mut self, listener: Arc<dyn SubscriberSetListener>) {
        self.subscribers = Some(listener);
    }

    pub(crate) fn notify_trackable_added(&self, trackable: &Trackable) {
        if let Some(listener) = &self.trackables {
            listener.on_trackable_added(trackable);
        }
    }

    pub(crate) fn notify_trackable_removed(&self, trackable: &Trackable) {
        if let Some(listener) = &self.trackables {
            listener.on_trackable_removed(trackable);
        }
    }

    pub(crate) fn notify_active_changed(&self, active: Option<&Trackable>) {
        if let Some(listener) = &self.trackables {
            listener.on_active_trackable_changed(active);
        }
    }

    pub(crate) fn notify_subscriber_added(&self, subscriber: &Subscriber) {
        if let Some(listener) = &self.subscribers {
            listener.on_subscriber_added(subscriber);
        }
    }

    pub(crate) fn notify_subscriber_removed(&self, subscriber: &Subscriber) {
        if let Some(listener) = &self.subscribers {
            listener.on_subscriber_removed(subscriber);
        }
    }
}

// ============================================================================
// METHODS
// ============================================================================

struct ThresholdRegistration {
    threshold: Proximity,
    handler: Arc<dyn ProximityHandler>,
}

/// Operations the policy may invoke on the publisher.
#[derive(Clone)]
pub struct Methods {
    poster: WorkPoster,
    registration: Arc<Mutex<Option<ThresholdRegistration>>>,
}

impl Methods {
    pub(crate) fn new(poster: WorkPoster) -> Self {
        Self {
            poster,
            registration: Arc::new(Mutex::new(None)),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ThresholdRegistration>> {
        self.registration.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests re-resolution of every trackable.
    pub fn refresh(&self) {
        self.poster.post(WorkerSpecification::RefreshResolutionPolicy);
    }

    /// Registers a threshold, cancelling the previous registration.
    pub fn set_proximity_threshold(&self, threshold: Proximity, handler: Arc<dyn ProximityHandler>) {
        let previous = self.slot().replace(ThresholdRegistration { threshold, handler });
        if let Some(previous) = previous {
            previous.handler.on_proximity_cancelled();
        }
    }

    pub fn cancel_proximity_threshold(&self) {
        let previous = self.slot().take();
        if let Some(previous) = previous {
            previous.handler.on_proximity_cancelled();
        }
    }

    /// The live threshold, if any.
    pub(crate) fn proximity_threshold(&self) -> Option<Proximity> {
        self.slot().as_ref().map(|registration| registration.threshold)
    }

    /// Consumes the live registration and notifies its handler.
    pub(crate) fn on_proximity_reached(&self) {
        let reached = self.slot().take();
        if let Some(registration) = reached {
            debug!(threshold = ?registration.threshold, "Proximity threshold reached");
            registration.handler.on_proximity_reached(&registration.threshold);
        }
    }
}

// ============================================================================
// COMBINATION
// ============================================================================

/// Most demanding value per field: highest accuracy, lowest interval,
/// lowest displacement. `None` for an empty input.
pub fn combine_resolutions<'a, I>(resolutions: I) -> Option<Resolution>
where
    I: IntoIterator<Item = &'a Resolution>,
{
    resolutions.into_iter().copied().reduce(|best, next| Resolution {
        accuracy: best.accuracy.max(next.accuracy),
        desired_interval: best.desired_interval.min(next.desired_interval),
        minimum_displacement: best.minimum_displacement.min(next.minimum_displacement),
    })
}

// ============================================================================
// DEFAULT POLICY
// ============================================================================

#[derive(Default)]
struct DefaultPolicyState {
    /// Id of the active trackable
    active: Option<String>,

    /// The active trackable's threshold has been crossed
    proximity_reached: bool,

    /// Subscriber ids per trackable id
    subscribers: HashMap<String, HashSet<String>>,
}

type SharedState = Arc<Mutex<DefaultPolicyState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, DefaultPolicyState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory for [`DefaultResolutionPolicy`].
pub struct DefaultResolutionPolicyFactory {
    default_resolution: Resolution,
    battery: Arc<dyn BatteryMonitor>,
}

impl DefaultResolutionPolicyFactory {
    pub fn new(default_resolution: Resolution, battery: Arc<dyn BatteryMonitor>) -> Self {
        Self {
            default_resolution,
            battery,
        }
    }
}

impl ResolutionPolicyFactory for DefaultResolutionPolicyFactory {
    fn create(self: Box<Self>, hooks: &mut Hooks, methods: Methods) -> Box<dyn ResolutionPolicy> {
        let state: SharedState = Arc::new(Mutex::new(DefaultPolicyState::default()));
        let proximity = Arc::new(DefaultProximityHandler {
            state: Arc::clone(&state),
            methods: methods.clone(),
        });
        hooks.trackables(Arc::new(DefaultTrackableSetListener {
            state: Arc::clone(&state),
            methods: methods.clone(),
            proximity,
        }));
        hooks.subscribers(Arc::new(DefaultSubscriberSetListener {
            state: Arc::clone(&state),
            methods,
        }));
        Box::new(DefaultResolutionPolicy {
            default_resolution: self.default_resolution,
            battery: self.battery,
            state,
        })
    }
}

/// Four-way matrix selection, subscriber combination and low battery scaling.
pub struct DefaultResolutionPolicy {
    default_resolution: Resolution,
    battery: Arc<dyn BatteryMonitor>,
    state: SharedState,
}

impl DefaultResolutionPolicy {
    fn is_battery_low(&self, threshold: f32) -> bool {
        self.battery
            .current_battery_percentage()
            .map_or(false, |level| level < threshold)
    }
}

impl ResolutionPolicy for DefaultResolutionPolicy {
    fn resolve(&self, request: &ResolutionRequest) -> Resolution {
        let trackable = &request.trackable;
        let base = match &trackable.constraints {
            Some(constraints) => {
                let state = lock(&self.state);
                let near = state.proximity_reached && state.active.as_deref() == Some(trackable.id.as_str());
                let has_subscribers = state
                    .subscribers
                    .get(&trackable.id)
                    .map_or(false, |subscribers| !subscribers.is_empty());
                constraints.resolutions.select(near, has_subscribers)
            }
            None => self.default_resolution,
        };

        let mut resolved = combine_resolutions(std::iter::once(&base).chain(&request.remote_requests))
            .unwrap_or(base);

        if let Some(constraints) = &trackable.constraints {
            if self.is_battery_low(constraints.battery_level_threshold) {
                let scaled = resolved.desired_interval as f64 * f64::from(constraints.low_battery_multiplier);
                resolved.desired_interval = scaled.round() as i64;
            }
        }
        resolved
    }

    fn resolve_set(&self, resolutions: &[Resolution]) -> Resolution {
        combine_resolutions(resolutions).unwrap_or(self.default_resolution)
    }
}

struct DefaultTrackableSetListener {
    state: SharedState,
    methods: Methods,
    proximity: Arc<DefaultProximityHandler>,
}

impl TrackableSetListener for DefaultTrackableSetListener {
    fn on_trackable_added(&self, _trackable: &Trackable) {}

    fn on_trackable_removed(&self, trackable: &Trackable) {
        lock(&self.state).subscribers.remove(&trackable.id);
    }

    fn on_active_trackable_changed(&self, active: Option<&Trackable>) {
        {
            let mut state = lock(&self.state);
            state.active = active.map(|trackable| trackable.id.clone());
            state.proximity_reached = false;
        }
        match active.and_then(|trackable| trackable.constraints.as_ref()) {
            Some(constraints) => {
                let handler: Arc<dyn ProximityHandler> = self.proximity.clone();
                self.methods
                    .set_proximity_threshold(constraints.proximity_threshold, handler);
            }
            None => self.methods.cancel_proximity_threshold(),
        }
    }
}

struct DefaultSubscriberSetListener {
    state: SharedState,
    methods: Methods,
}

impl SubscriberSetListener for DefaultSubscriberSetListener {
    fn on_subscriber_added(&self, subscriber: &Subscriber) {
        let first = {
            let mut state = lock(&self.state);
            let subscribers = state.subscribers.entry(subscriber.trackable_id.clone()).or_default();
            subscribers.insert(subscriber.id.clone()) && subscribers.len() == 1
        };
        if first {
            self.methods.refresh();
        }
    }

    fn on_subscriber_removed(&self, subscriber: &Subscriber) {
        let last = {
            let mut state = lock(&self.state);
            match state.subscribers.get_mut(&subscriber.trackable_id) {
                Some(subscribers) => subscribers.remove(&subscriber.id) && subscribers.is_empty(),
                None => false,
            }
        };
        if last {
            self.methods.refresh();
        }
    }
}

struct DefaultProximityHandler {
    state: SharedState,
    methods: Methods,
}

impl ProximityHandler for DefaultProximityHandler {
    fn on_proximity_reached(&self, _threshold: &Proximity) {
        lock(&self.state).proximity_reached = true;
        self.methods.refresh();
    }

    fn on_proximity_cancelled(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResolutionConstraints, ResolutionSet};
    use proptest::prelude::*;
    use tokio::sync::mpsc;
    use trackcast_env::Accuracy;

    struct FixedBattery(Option<f32>);

    impl BatteryMonitor for FixedBattery {
        fn current_battery_percentage(&self) -> Option<f32> {
            self.0
        }
    }

    fn default_resolution() -> Resolution {
        Resolution::new(Accuracy::Balanced, 1000, 1.0)
    }

    type Queue = (
        mpsc::UnboundedSender<WorkerSpecification>,
        mpsc::UnboundedReceiver<WorkerSpecification>,
    );

    fn setup(battery: Option<f32>) -> (Box<dyn ResolutionPolicy>, Hooks, Methods, Queue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let methods = Methods::new(WorkPoster::new(&tx));
        let mut hooks = Hooks::default();
        let factory = Box::new(DefaultResolutionPolicyFactory::new(
            default_resolution(),
            Arc::new(FixedBattery(battery)),
        ));
        let policy = factory.create(&mut hooks, methods.clone());
        (policy, hooks, methods, (tx, rx))
    }

    fn constrained(id: &str) -> Trackable {
        let r = |accuracy, interval| Resolution::new(accuracy, interval, 5.0);
        Trackable::new(id).with_constraints(ResolutionConstraints {
            resolutions: ResolutionSet {
                far_with_subscriber: r(Accuracy::High, 2000),
                far_without_subscriber: r(Accuracy::Low, 10_000),
                near_with_subscriber: r(Accuracy::Maximum, 500),
                near_without_subscriber: r(Accuracy::Balanced, 5000),
            },
            proximity_threshold: Proximity::spatial(50.0),
            battery_level_threshold: 20.0,
            low_battery_multiplier: 3.0,
        })
    }

    fn request(trackable: &Trackable, remote: Vec<Resolution>) -> ResolutionRequest {
        ResolutionRequest {
            trackable: trackable.clone(),
            remote_requests: remote,
        }
    }

    #[test]
    fn test_unconstrained_trackable_uses_default() {
        let (policy, _, _, _rx) = setup(Some(100.0));
        let resolved = policy.resolve(&request(&Trackable::new("T1"), vec![]));
        assert_eq!(resolved, default_resolution());
    }

    #[test]
    fn test_remote_requests_combine_with_base() {
        let (policy, _, _, _rx) = setup(Some(100.0));
        let remote = vec![
            Resolution::new(Accuracy::Maximum, 3000, 10.0),
            Resolution::new(Accuracy::Low, 500, 0.5),
        ];
        let resolved = policy.resolve(&request(&Trackable::new("T1"), remote));
        assert_eq!(resolved, Resolution::new(Accuracy::Maximum, 500, 0.5));
    }

    #[test]
    fn test_subscriber_and_proximity_select_matrix_cell() {
        let (policy, hooks, methods, (_tx, mut rx)) = setup(Some(100.0));
        let trackable = constrained("T1");

        assert_eq!(policy.resolve(&request(&trackable, vec![])).desired_interval, 10_000);

        let subscriber = Subscriber {
            id: "s1".into(),
            trackable_id: "T1".into(),
        };
        hooks.notify_subscriber_added(&subscriber);
        assert!(matches!(rx.try_recv(), Ok(WorkerSpecification::RefreshResolutionPolicy)));
        assert_eq!(policy.resolve(&request(&trackable, vec![])).desired_interval, 2000);

        hooks.notify_active_changed(Some(&trackable));
        assert_eq!(methods.proximity_threshold(), Some(Proximity::spatial(50.0)));
        methods.on_proximity_reached();
        assert!(methods.proximity_threshold().is_none());
        assert!(matches!(rx.try_recv(), Ok(WorkerSpecification::RefreshResolutionPolicy)));
        assert_eq!(policy.resolve(&request(&trackable, vec![])).accuracy, Accuracy::Maximum);

        // Proximity applies to the active trackable only
        let other = constrained("T2");
        assert_eq!(policy.resolve(&request(&other, vec![])).desired_interval, 10_000);

        hooks.notify_subscriber_removed(&subscriber);
        assert_eq!(policy.resolve(&request(&trackable, vec![])).desired_interval, 5000);
    }

    #[test]
    fn test_low_battery_multiplies_interval() {
        let (policy, _, _, _rx) = setup(Some(10.0));
        let resolved = policy.resolve(&request(&constrained("T1"), vec![]));
        assert_eq!(resolved.desired_interval, 30_000);
        assert_eq!(resolved.accuracy, Accuracy::Low);
        assert_eq!(resolved.minimum_displacement, 5.0);

        let (unknown, _, _, _rx) = setup(None);
        assert_eq!(unknown.resolve(&request(&constrained("T1"), vec![])).desired_interval, 10_000);
    }

    #[test]
    fn test_new_threshold_cancels_previous() {
        struct Counting(std::sync::atomic::AtomicUsize);
        impl ProximityHandler for Counting {
            fn on_proximity_reached(&self, _: &Proximity) {}
            fn on_proximity_cancelled(&self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let (_policy, _, methods, _rx) = setup(None);
        let first = Arc::new(Counting(Default::default()));
        methods.set_proximity_threshold(Proximity::spatial(1.0), first.clone());
        methods.set_proximity_threshold(Proximity::temporal(10), Arc::new(Counting(Default::default())));

        assert_eq!(first.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(methods.proximity_threshold(), Some(Proximity::temporal(10)));
    }

    #[test]
    fn test_resolve_set_empty_is_default() {
        let (policy, _, _, _rx) = setup(None);
        assert_eq!(policy.resolve_set(&[]), default_resolution());
    }

    fn any_resolution() -> impl Strategy<Value = Resolution> {
        (1u8..=5, 1i64..100_000, 0.0f64..1000.0).prop_map(|(level, interval, displacement)| {
            let accuracy = match level {
                1 => Accuracy::Minimum,
                2 => Accuracy::Low,
                3 => Accuracy::Balanced,
                4 => Accuracy::High,
                _ => Accuracy::Maximum,
            };
            Resolution::new(accuracy, interval, displacement)
        })
    }

    proptest! {
        #[test]
        fn test_resolved_is_best_of_all_candidates(remote in proptest::collection::vec(any_resolution(), 0..10)) {
            let (policy, _, _, _rx) = setup(Some(100.0));
            let resolved = policy.resolve(&request(&Trackable::new("T1"), remote.clone()));
            for candidate in remote.iter().chain(std::iter::once(&default_resolution())) {
                prop_assert!(resolved.accuracy >= candidate.accuracy);
                prop_assert!(resolved.desired_interval <= candidate.desired_interval);
                prop_assert!(resolved.minimum_displacement <= candidate.minimum_displacement);
            }
        }
    }
}
