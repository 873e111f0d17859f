//! Worker set.
//!
//! Every unit of work is a [`WorkerSpecification`]. `do_work` matches on it
//! and runs the corresponding worker against the publisher properties.
//!
//! ```text
//!   WorkerSpecification ──► do_work(spec, &mut props, &mut ctx)
//!                              │ sync: mutate props, post follow-ups
//!                              │ async: ctx.schedule_async(..) ─► result posted as a spec
//!                              ▼
//!   errors ──► on_unexpected_error / on_unexpected_async_error ─► caller or FailTrackable
//!   stopped ─► do_when_stopped ─► caller callbacks only
//! ```

mod lifecycle;
mod location;
mod presence;
mod routing;

use crate::callback::ResultCallback;
use crate::error::{PublisherError, PublisherResult};
use crate::model::{Trackable, TrackableState};
use crate::properties::PublisherProperties;
use crate::queue::{AsyncFallback, InflightTracker, ScheduledWork, WorkPoster};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use trackcast_env::{
    ConnectionStateChange, EnhancedLocationUpdate, ErrorInformation, Location, LocationObserver, LocationProvider,
    LocationUpdate, PresenceData, PresenceMessage, PublisherContext, RoutingProfile, Transport,
};

/// Result delivered to `add`/`track` callers.
pub type AddTrackableCallback = ResultCallback<watch::Receiver<TrackableState>>;

// ============================================================================
// SPECIFICATIONS
// ============================================================================

/// A queued unit of work.
#[derive(Debug, Clone)]
pub enum WorkerSpecification {
    AddTrackable {
        trackable: Trackable,
        callback: AddTrackableCallback,
    },
    AddTrackableFailed {
        trackable: Trackable,
        callback: AddTrackableCallback,
        error: PublisherError,
        /// The transport connection was started by this add
        connection_established: bool,
    },
    ConnectionCreated {
        trackable: Trackable,
        callback: AddTrackableCallback,
        entered_presence: bool,
    },
    ConnectionReady {
        trackable: Trackable,
        callback: AddTrackableCallback,
        entered_presence: bool,
        subscribed_to_presence: bool,
    },
    RetryEnterPresence {
        trackable: Trackable,
        attempt: u32,
        /// Error of the previous attempt
        last_error: Option<ErrorInformation>,
    },
    RetryEnterPresenceSuccess {
        trackable: Trackable,
    },
    RetrySubscribeToPresence {
        trackable: Trackable,
        attempt: u32,
        last_error: Option<ErrorInformation>,
    },
    RetrySubscribeToPresenceSuccess {
        trackable: Trackable,
    },
    UpdatePresenceData {
        trackable_id: String,
        presence_data: PresenceData,
        attempt: u32,
    },
    SetRawLocationsEnabled {
        enabled: bool,
        callback: ResultCallback<()>,
    },
    PresenceMessage {
        trackable: Trackable,
        message: PresenceMessage,
    },
    EnhancedLocationChanged {
        update: EnhancedLocationUpdate,
    },
    RawLocationChanged {
        location: Location,
    },
    SendEnhancedLocationSuccess {
        location: Location,
        trackable_id: String,
    },
    SendEnhancedLocationFailure {
        update: EnhancedLocationUpdate,
        trackable_id: String,
        error: PublisherError,
    },
    SendRawLocationSuccess {
        location: Location,
        trackable_id: String,
    },
    SendRawLocationFailure {
        update: LocationUpdate,
        trackable_id: String,
        error: PublisherError,
    },
    SetActiveTrackable {
        trackable: Trackable,
        callback: ResultCallback<()>,
    },
    DestinationSet {
        route_duration_ms: i64,
    },
    ChangeRoutingProfile {
        profile: RoutingProfile,
        callback: ResultCallback<()>,
    },
    ChangeLocationEngineResolution,
    RefreshResolutionPolicy,
    ConnectionStateChange {
        change: ConnectionStateChange,
    },
    ChannelConnectionStateChange {
        trackable_id: String,
        change: ConnectionStateChange,
    },
    FailTrackable {
        trackable_id: String,
        error: ErrorInformation,
    },
    RemoveTrackable {
        trackable: Trackable,
        callback: ResultCallback<bool>,
    },
    DisconnectSuccess {
        trackable: Trackable,
    },
    TrackableRemovalRequested {
        trackable: Trackable,
        callback: AddTrackableCallback,
        result: Result<(), PublisherError>,
    },
    StoppingConnectionFinished,
    Stop {
        callback: ResultCallback<()>,
        timeout: Duration,
    },
}

impl WorkerSpecification {
    /// Stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddTrackable { .. } => "AddTrackable",
            Self::AddTrackableFailed { .. } => "AddTrackableFailed",
            Self::ConnectionCreated { .. } => "ConnectionCreated",
            Self::ConnectionReady { .. } => "ConnectionReady",
            Self::RetryEnterPresence { .. } => "RetryEnterPresence",
            Self::RetryEnterPresenceSuccess { .. } => "RetryEnterPresenceSuccess",
            Self::RetrySubscribeToPresence { .. } => "RetrySubscribeToPresence",
            Self::RetrySubscribeToPresenceSuccess { .. } => "RetrySubscribeToPresenceSuccess",
            Self::UpdatePresenceData { .. } => "UpdatePresenceData",
            Self::SetRawLocationsEnabled { .. } => "SetRawLocationsEnabled",
            Self::PresenceMessage { .. } => "PresenceMessage",
            Self::EnhancedLocationChanged { .. } => "EnhancedLocationChanged",
            Self::RawLocationChanged { .. } => "RawLocationChanged",
            Self::SendEnhancedLocationSuccess { .. } => "SendEnhancedLocationSuccess",
            Self::SendEnhancedLocationFailure { .. } => "SendEnhancedLocationFailure",
            Self::SendRawLocationSuccess { .. } => "SendRawLocationSuccess",
            Self::SendRawLocationFailure { .. } => "SendRawLocationFailure",
            Self::SetActiveTrackable { .. } => "SetActiveTrackable",
            Self::DestinationSet { .. } => "DestinationSet",
            Self::ChangeRoutingProfile { .. } => "ChangeRoutingProfile",
            Self::ChangeLocationEngineResolution => "ChangeLocationEngineResolution",
            Self::RefreshResolutionPolicy => "RefreshResolutionPolicy",
            Self::ConnectionStateChange { .. } => "ConnectionStateChange",
            Self::ChannelConnectionStateChange { .. } => "ChannelConnectionStateChange",
            Self::FailTrackable { .. } => "FailTrackable",
            Self::RemoveTrackable { .. } => "RemoveTrackable",
            Self::DisconnectSuccess { .. } => "DisconnectSuccess",
            Self::TrackableRemovalRequested { .. } => "TrackableRemovalRequested",
            Self::StoppingConnectionFinished => "StoppingConnectionFinished",
            Self::Stop { .. } => "Stop",
        }
    }
}

// ============================================================================
// WORK CONTEXT
// ============================================================================

/// Collaborators available to workers.
#[derive(Clone)]
pub(crate) struct WorkerEnv {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) location_provider: Arc<dyn LocationProvider>,
    pub(crate) context: Arc<dyn PublisherContext>,

    /// Registered with the provider while location updates run
    pub(crate) observer: Arc<dyn LocationObserver>,
}

/// Per-item handle for posting and scheduling work.
pub(crate) struct WorkContext<'a> {
    env: &'a WorkerEnv,
    poster: &'a WorkPoster,
    inflight: &'a Arc<InflightTracker>,
    scheduled: Vec<ScheduledWork>,
}

impl<'a> WorkContext<'a> {
    pub(crate) fn new(env: &'a WorkerEnv, poster: &'a WorkPoster, inflight: &'a Arc<InflightTracker>) -> Self {
        Self {
            env,
            poster,
            inflight,
            scheduled: Vec::new(),
        }
    }

    pub(crate) fn env(&self) -> &WorkerEnv {
        self.env
    }

    pub(crate) fn poster(&self) -> WorkPoster {
        self.poster.clone()
    }

    pub(crate) fn inflight(&self) -> Arc<InflightTracker> {
        Arc::clone(self.inflight)
    }

    pub(crate) fn now_millis(&self) -> i64 {
        self.env.context.now_millis()
    }

    /// Posts to the back of the queue.
    pub(crate) fn post(&self, spec: WorkerSpecification) {
        self.poster.post(spec);
    }

    fn push<F>(&mut self, name: &'static str, delay: Option<Duration>, tracked: bool, future: F, fallback: Option<AsyncFallback>)
    where
        F: Future<Output = PublisherResult<()>> + Send + 'static,
    {
        self.scheduled.push(ScheduledWork {
            name,
            delay,
            tracked,
            future: Box::pin(future),
            fallback,
        });
    }

    /// Schedules I/O that the stop drain waits for.
    pub(crate) fn schedule_async<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = PublisherResult<()>> + Send + 'static,
    {
        self.push(name, None, true, future, None);
    }

    /// Like `schedule_async`, with a specific mapping for unexpected errors.
    pub(crate) fn schedule_async_or<F, H>(&mut self, name: &'static str, future: F, fallback: H)
    where
        F: Future<Output = PublisherResult<()>> + Send + 'static,
        H: FnOnce(PublisherError) -> Option<WorkerSpecification> + Send + 'static,
    {
        self.push(name, None, true, future, Some(Box::new(fallback)));
    }

    /// Schedules I/O after a delay. The delay itself is not drained by stop.
    pub(crate) fn schedule_after<F>(&mut self, name: &'static str, delay: Duration, future: F)
    where
        F: Future<Output = PublisherResult<()>> + Send + 'static,
    {
        self.push(name, Some(delay), true, future, None);
    }

    /// Re-queues a specification after a delay.
    pub(crate) fn post_after(&mut self, delay: Duration, spec: WorkerSpecification) {
        let poster = self.poster.clone();
        self.push(
            "delayed-post",
            Some(delay),
            false,
            async move {
                poster.post(spec);
                Ok(())
            },
            None,
        );
    }

    /// Schedules work that is not counted by the stop drain.
    pub(crate) fn schedule_detached<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = PublisherResult<()>> + Send + 'static,
    {
        self.push(name, None, false, future, None);
    }

    pub(crate) fn into_scheduled(self) -> Vec<ScheduledWork> {
        self.scheduled
    }
}

/// Awaits `future`, giving up after `timeout` on the context clock.
pub(crate) async fn with_timeout<F: Future>(
    context: &dyn PublisherContext,
    timeout: Duration,
    future: F,
) -> Option<F::Output> {
    tokio::select! {
        output = future => Some(output),
        _ = context.sleep(timeout) => None,
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Runs the worker for `spec`.
pub(crate) fn do_work(
    spec: WorkerSpecification,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    use WorkerSpecification as W;
    match spec {
        W::AddTrackable { trackable, callback } => lifecycle::add_trackable(trackable, callback, props, ctx),
        W::AddTrackableFailed {
            trackable,
            callback,
            error,
            connection_established,
        } => lifecycle::add_trackable_failed(trackable, callback, error, connection_established, props, ctx),
        W::ConnectionCreated {
            trackable,
            callback,
            entered_presence,
        } => lifecycle::connection_created(trackable, callback, entered_presence, props, ctx),
        W::ConnectionReady {
            trackable,
            callback,
            entered_presence,
            subscribed_to_presence,
        } => lifecycle::connection_ready(trackable, callback, entered_presence, subscribed_to_presence, props, ctx),
        W::RetryEnterPresence {
            trackable,
            attempt,
            last_error,
        } => presence::retry_enter_presence(trackable, attempt, last_error, props, ctx),
        W::RetryEnterPresenceSuccess { trackable } => presence::retry_enter_presence_success(trackable, props),
        W::RetrySubscribeToPresence {
            trackable,
            attempt,
            last_error,
        } => presence::retry_subscribe_to_presence(trackable, attempt, last_error, props, ctx),
        W::RetrySubscribeToPresenceSuccess { trackable } => presence::retry_subscribe_to_presence_success(trackable, props),
        W::UpdatePresenceData {
            trackable_id,
            presence_data,
            attempt,
        } => presence::update_presence_data(trackable_id, presence_data, attempt, props, ctx),
        W::SetRawLocationsEnabled { enabled, callback } => presence::set_raw_locations_enabled(enabled, callback, props, ctx),
        W::PresenceMessage { trackable, message } => presence::presence_message(trackable, message, props, ctx),
        W::EnhancedLocationChanged { update } => location::enhanced_location_changed(update, props, ctx),
        W::RawLocationChanged { location } => location::raw_location_changed(location, props, ctx),
        W::SendEnhancedLocationSuccess { location, trackable_id } => {
            location::send_enhanced_success(location, trackable_id, props, ctx)
        }
        W::SendEnhancedLocationFailure {
            update,
            trackable_id,
            error,
        } => location::send_enhanced_failure(update, trackable_id, error, props, ctx),
        W::SendRawLocationSuccess { location, trackable_id } => location::send_raw_success(location, trackable_id, props, ctx),
        W::SendRawLocationFailure {
            update,
            trackable_id,
            error,
        } => location::send_raw_failure(update, trackable_id, error, props, ctx),
        W::SetActiveTrackable { trackable, callback } => routing::set_active_trackable(trackable, callback, props, ctx),
        W::DestinationSet { route_duration_ms } => routing::destination_set(route_duration_ms, props, ctx),
        W::ChangeRoutingProfile { profile, callback } => routing::change_routing_profile(profile, callback, props, ctx),
        W::ChangeLocationEngineResolution => routing::change_location_engine_resolution(props, ctx),
        W::RefreshResolutionPolicy => routing::refresh_resolution_policy(props, ctx),
        W::ConnectionStateChange { change } => lifecycle::connection_state_change(change, props),
        W::ChannelConnectionStateChange { trackable_id, change } => {
            lifecycle::channel_connection_state_change(trackable_id, change, props, ctx)
        }
        W::FailTrackable { trackable_id, error } => lifecycle::fail_trackable(trackable_id, error, props, ctx),
        W::RemoveTrackable { trackable, callback } => lifecycle::remove_trackable(trackable, callback, props, ctx),
        W::DisconnectSuccess { trackable } => lifecycle::disconnect_success(trackable, props, ctx),
        W::TrackableRemovalRequested {
            trackable,
            callback,
            result,
        } => lifecycle::trackable_removal_requested(trackable, callback, result, props, ctx),
        W::StoppingConnectionFinished => lifecycle::stopping_connection_finished(props),
        W::Stop { callback, timeout } => lifecycle::stop(callback, timeout, props, ctx),
    }
}

/// Runs in place of `do_work` once the publisher is stopped.
///
/// Only completes callers; there is no state left to touch.
pub(crate) fn do_when_stopped(spec: WorkerSpecification) {
    use WorkerSpecification as W;
    match spec {
        W::AddTrackable { callback, .. }
        | W::AddTrackableFailed { callback, .. }
        | W::ConnectionCreated { callback, .. }
        | W::ConnectionReady { callback, .. }
        | W::TrackableRemovalRequested { callback, .. } => {
            callback.complete(Err(PublisherError::Stopped));
        }
        W::RemoveTrackable { callback, .. } => {
            callback.complete(Err(PublisherError::Stopped));
        }
        W::SetRawLocationsEnabled { callback, .. }
        | W::SetActiveTrackable { callback, .. }
        | W::ChangeRoutingProfile { callback, .. } => {
            callback.complete(Err(PublisherError::Stopped));
        }
        W::Stop { callback, .. } => {
            callback.complete(Ok(()));
        }
        _ => {}
    }
}

/// Handles an error from the synchronous part of a worker.
///
/// Completes the caller if there is one; otherwise fails the trackable the
/// work was about. Returns follow-up work to post.
pub(crate) fn on_unexpected_error(spec: WorkerSpecification, error: PublisherError) -> Option<WorkerSpecification> {
    use WorkerSpecification as W;
    match spec {
        W::AddTrackable { trackable, callback } => Some(W::AddTrackableFailed {
            trackable,
            callback,
            error,
            connection_established: false,
        }),
        W::ConnectionCreated { trackable, callback, .. } | W::ConnectionReady { trackable, callback, .. } => {
            Some(W::AddTrackableFailed {
                trackable,
                callback,
                error,
                connection_established: true,
            })
        }
        W::AddTrackableFailed { callback, error: original, .. } => {
            callback.complete(Err(original));
            None
        }
        W::TrackableRemovalRequested { callback, .. } => {
            callback.complete(Err(error));
            None
        }
        W::RemoveTrackable { callback, .. } => {
            callback.complete(Err(error));
            None
        }
        W::SetRawLocationsEnabled { callback, .. }
        | W::SetActiveTrackable { callback, .. }
        | W::ChangeRoutingProfile { callback, .. }
        | W::Stop { callback, .. } => {
            callback.complete(Err(error));
            None
        }
        other => trackable_failure(&other, &error),
    }
}

/// Handles an error escaping scheduled async work.
pub(crate) fn on_unexpected_async_error(spec: WorkerSpecification, error: PublisherError) -> Option<WorkerSpecification> {
    use WorkerSpecification as W;
    match spec {
        W::AddTrackable { trackable, callback } => Some(W::AddTrackableFailed {
            trackable,
            callback,
            error,
            connection_established: true,
        }),
        W::ConnectionCreated { trackable, callback, entered_presence } => Some(W::ConnectionReady {
            trackable,
            callback,
            entered_presence,
            subscribed_to_presence: false,
        }),
        W::ConnectionReady { trackable, callback, .. } => Some(W::TrackableRemovalRequested {
            trackable,
            callback,
            result: Err(error),
        }),
        W::RetryEnterPresence { trackable, attempt, .. } => Some(W::RetryEnterPresence {
            trackable,
            attempt: attempt + 1,
            last_error: Some(error.error_information()),
        }),
        W::RetrySubscribeToPresence { trackable, attempt, .. } => Some(W::RetrySubscribeToPresence {
            trackable,
            attempt: attempt + 1,
            last_error: Some(error.error_information()),
        }),
        W::RemoveTrackable { trackable, .. } => Some(W::DisconnectSuccess { trackable }),
        W::AddTrackableFailed { .. } | W::DisconnectSuccess { .. } | W::TrackableRemovalRequested { .. } => {
            Some(W::StoppingConnectionFinished)
        }
        W::SetActiveTrackable { callback, .. } | W::ChangeRoutingProfile { callback, .. } => {
            callback.complete(Err(error));
            None
        }
        W::Stop { callback, .. } => {
            callback.complete(Err(error));
            None
        }
        other => trackable_failure(&other, &error),
    }
}

fn trackable_failure(spec: &WorkerSpecification, error: &PublisherError) -> Option<WorkerSpecification> {
    use WorkerSpecification as W;
    let trackable_id = match spec {
        W::RetryEnterPresenceSuccess { trackable }
        | W::RetrySubscribeToPresenceSuccess { trackable }
        | W::PresenceMessage { trackable, .. } => trackable.id.clone(),
        W::UpdatePresenceData { trackable_id, .. }
        | W::SendEnhancedLocationSuccess { trackable_id, .. }
        | W::SendEnhancedLocationFailure { trackable_id, .. }
        | W::SendRawLocationSuccess { trackable_id, .. }
        | W::SendRawLocationFailure { trackable_id, .. }
        | W::ChannelConnectionStateChange { trackable_id, .. } => trackable_id.clone(),
        _ => return None,
    };
    Some(WorkerSpecification::FailTrackable {
        trackable_id,
        error: error.error_information(),
    })
}
