//! Trackable lifecycle: add, remove, fail, connection state and stop.
//!
//! ```text
//!   AddTrackable ──► (start_connection) ► connect ► enter_presence
//!        │                                            │
//!        │ failure ─► AddTrackableFailed              ▼
//!        │                                   ConnectionCreated ──► subscribe_for_presence
//!        │                                            │
//!        ▼                                            ▼
//!   duplicate handlers ◄──── finish_adding ◄──── ConnectionReady
//!
//!   RemoveTrackable ─► disconnect ─► DisconnectSuccess ─► (last one) stop_connection
//!   marked mid-add  ─► disconnect ─► TrackableRemovalRequested
//! ```

use super::presence::presence_listener;
use super::{with_timeout, AddTrackableCallback, WorkContext, WorkerSpecification};
use crate::callback::ResultCallback;
use crate::error::{PublisherError, PublisherResult};
use crate::model::{Trackable, TrackableState};
use crate::properties::{PublisherProperties, PublisherState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trackcast_env::{ConnectionState, ConnectionStateChange, ErrorInformation};

// ============================================================================
// ADDING
// ============================================================================

pub(super) fn add_trackable(
    trackable: Trackable,
    callback: AddTrackableCallback,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let id = trackable.id.clone();

    if props.is_tracked(&id) && !props.removing.contains(&id) {
        let receiver = props
            .state_receiver(&id)
            .ok_or_else(|| PublisherError::invalid_state(format!("Trackable {id} has no state stream")))?;
        debug!(trackable = %id, "Trackable already added");
        callback.complete(Ok(receiver));
        return Ok(());
    }

    if props.duplicate_guard.is_currently_adding(&id) {
        debug!(trackable = %id, "Add already in progress, waiting for its result");
        props.duplicate_guard.save_duplicate_handler(&id, callback);
        return Ok(());
    }

    if props.state().is_transitioning()
        || props.removal_guard.is_marked_for_removal(&id)
        || props.removing.contains(&id)
    {
        debug!(trackable = %id, state = ?props.state(), "Delaying add");
        let delay = props.config.work_retry_delay();
        ctx.post_after(delay, WorkerSpecification::AddTrackable { trackable, callback });
        return Ok(());
    }

    props.duplicate_guard.start_adding(&id);
    let starting = props.state() == PublisherState::Idle;
    if starting {
        props.set_state(PublisherState::Connecting)?;
    }

    let transport = Arc::clone(&ctx.env().transport);
    let presence = props.presence_data.clone();
    let poster = ctx.poster();
    ctx.schedule_async("add-trackable", async move {
        let failed = |trackable: Trackable,
                      callback: AddTrackableCallback,
                      error: PublisherError,
                      connection_established: bool| {
            WorkerSpecification::AddTrackableFailed {
                trackable,
                callback,
                error,
                connection_established,
            }
        };

        if starting {
            if let Err(err) = transport.start_connection().await {
                warn!(trackable = %trackable.id, error = %err, "Failed to start connection");
                poster.post(failed(trackable, callback, err.into(), false));
                return Ok(());
            }
        }

        if let Err(err) = transport.connect(&trackable.id, &presence).await {
            warn!(trackable = %trackable.id, error = %err, "Failed to connect channel");
            poster.post(failed(trackable, callback, err.into(), true));
            return Ok(());
        }

        let entered_presence = match transport.enter_presence(&trackable.id, &presence).await {
            Ok(()) => true,
            Err(err) if err.is_fatal() => {
                warn!(trackable = %trackable.id, error = %err, "Fatal error entering presence");
                if let Err(disconnect) = transport.disconnect(&trackable.id, &presence).await {
                    debug!(trackable = %trackable.id, error = %disconnect, "Disconnect after failed add");
                }
                poster.post(failed(trackable, callback, err.into(), true));
                return Ok(());
            }
            Err(err) => {
                warn!(trackable = %trackable.id, error = %err, "Failed to enter presence, will retry");
                false
            }
        };

        poster.post(WorkerSpecification::ConnectionCreated {
            trackable,
            callback,
            entered_presence,
        });
        Ok(())
    });
    Ok(())
}

pub(super) fn add_trackable_failed(
    trackable: Trackable,
    callback: AddTrackableCallback,
    error: PublisherError,
    connection_established: bool,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let id = trackable.id;
    warn!(trackable = %id, error = %error, "Adding trackable failed");
    callback.complete(Err(error.clone()));
    props.duplicate_guard.finish_adding(&id, Err(error.clone()));
    props.removal_guard.remove_marked(&id, Ok(true));

    // Registration got partway through
    if props.is_tracked(&id) {
        ctx.post(WorkerSpecification::FailTrackable {
            trackable_id: id,
            error: error.error_information(),
        });
        return Ok(());
    }

    if connection_established {
        if props.state() == PublisherState::Connecting {
            props.set_state(PublisherState::Connected)?;
        }
        stop_connection_if_unused(props, ctx)?;
    } else if props.state() == PublisherState::Connecting && props.has_no_trackables_adding_or_added() {
        props.set_state(PublisherState::Idle)?;
    }
    Ok(())
}

pub(super) fn connection_created(
    trackable: Trackable,
    callback: AddTrackableCallback,
    entered_presence: bool,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if props.state() == PublisherState::Connecting {
        props.set_state(PublisherState::Connected)?;
        if props.connection_state.state == ConnectionState::Offline {
            props.connection_state = ConnectionStateChange::new(ConnectionState::Online);
        }
    }

    if props.removal_guard.is_marked_for_removal(&trackable.id) {
        disconnect_for_removal(trackable, callback, props, ctx);
        return Ok(());
    }

    let listener = presence_listener(ctx.poster(), trackable.clone());
    let transport = Arc::clone(&ctx.env().transport);
    let context = Arc::clone(&ctx.env().context);
    let timeout = props.config.presence_subscribe_timeout();
    let poster = ctx.poster();
    ctx.schedule_async("subscribe-presence", async move {
        let subscribe = transport.subscribe_for_presence(&trackable.id, listener);
        let subscribed_to_presence = match with_timeout(context.as_ref(), timeout, subscribe).await {
            Some(Ok(())) => true,
            Some(Err(err)) => {
                warn!(trackable = %trackable.id, error = %err, "Failed to subscribe to presence");
                false
            }
            None => {
                warn!(trackable = %trackable.id, timeout_ms = timeout.as_millis() as u64, "Presence subscribe timed out");
                false
            }
        };
        poster.post(WorkerSpecification::ConnectionReady {
            trackable,
            callback,
            entered_presence,
            subscribed_to_presence,
        });
        Ok(())
    });
    Ok(())
}

pub(super) fn connection_ready(
    trackable: Trackable,
    callback: AddTrackableCallback,
    entered_presence: bool,
    subscribed_to_presence: bool,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let id = trackable.id.clone();
    if props.removal_guard.is_marked_for_removal(&id) {
        disconnect_for_removal(trackable, callback, props, ctx);
        return Ok(());
    }

    props.tracked.insert(id.clone(), trackable.clone());
    props
        .channel_states
        .entry(id.clone())
        .or_insert_with(|| ConnectionStateChange::new(ConnectionState::Online));
    if entered_presence {
        props.entered_presence.insert(id.clone());
    }
    if subscribed_to_presence {
        props.subscribed_to_presence.insert(id.clone());
    }
    let receiver = props.create_state_channel(&id);
    props.publish_trackables();

    props.hooks.notify_trackable_added(&trackable);
    props.resolve_resolution(&trackable);
    ctx.post(WorkerSpecification::ChangeLocationEngineResolution);

    let poster = ctx.poster();
    let channel = id.clone();
    ctx.env().transport.subscribe_for_channel_state(
        &id,
        Arc::new(move |change| {
            poster.post(WorkerSpecification::ChannelConnectionStateChange {
                trackable_id: channel.clone(),
                change,
            });
        }),
    );

    if !props.is_tracking {
        start_location_updates(props, ctx);
    }

    info!(trackable = %id, "Trackable added");
    callback.complete(Ok(receiver.clone()));
    props.duplicate_guard.finish_adding(&id, Ok(receiver));

    if !subscribed_to_presence {
        ctx.post(WorkerSpecification::RetrySubscribeToPresence {
            trackable: trackable.clone(),
            attempt: 0,
            last_error: None,
        });
    }
    if !entered_presence {
        ctx.post(WorkerSpecification::RetryEnterPresence {
            trackable,
            attempt: 0,
            last_error: None,
        });
    }
    props.update_trackable_state(&id);
    Ok(())
}

fn disconnect_for_removal(
    trackable: Trackable,
    callback: AddTrackableCallback,
    props: &PublisherProperties,
    ctx: &mut WorkContext<'_>,
) {
    debug!(trackable = %trackable.id, "Removal requested while adding");
    let transport = Arc::clone(&ctx.env().transport);
    let presence = props.presence_data.clone();
    let poster = ctx.poster();
    ctx.schedule_async("disconnect-removed", async move {
        let result = transport
            .disconnect(&trackable.id, &presence)
            .await
            .map_err(PublisherError::from);
        poster.post(WorkerSpecification::TrackableRemovalRequested {
            trackable,
            callback,
            result,
        });
        Ok(())
    });
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

pub(super) fn connection_state_change(
    change: ConnectionStateChange,
    props: &mut PublisherProperties,
) -> PublisherResult<()> {
    debug!(state = ?change.state, "Connection state changed");
    props.connection_state = change;
    props.update_all_trackable_states();
    Ok(())
}

pub(super) fn channel_connection_state_change(
    trackable_id: String,
    change: ConnectionStateChange,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if !props.is_tracked(&trackable_id) {
        return Ok(());
    }
    debug!(trackable = %trackable_id, state = ?change.state, "Channel state changed");
    if change.state == ConnectionState::Failed {
        let error = change
            .error_information
            .clone()
            .unwrap_or_else(|| ErrorInformation::internal("Channel failed"));
        ctx.post(WorkerSpecification::FailTrackable {
            trackable_id: trackable_id.clone(),
            error,
        });
    }
    props.channel_states.insert(trackable_id.clone(), change);
    props.update_trackable_state(&trackable_id);
    Ok(())
}

// ============================================================================
// FAILURE & REMOVAL
// ============================================================================

pub(super) fn fail_trackable(
    trackable_id: String,
    error: ErrorInformation,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if !props.is_tracked(&trackable_id) || props.is_finalized(&trackable_id) {
        debug!(trackable = %trackable_id, "Ignoring failure of trackable not in play");
        return Ok(());
    }

    warn!(trackable = %trackable_id, error = %error, "Trackable failed");
    props.set_final_state(&trackable_id, TrackableState::Failed(error));
    props.enhanced_publishing.clear(&trackable_id);
    props.raw_publishing.clear(&trackable_id);

    let transport = Arc::clone(&ctx.env().transport);
    let presence = props.presence_data.clone();
    ctx.schedule_async("disconnect-failed", async move {
        if let Err(err) = transport.disconnect(&trackable_id, &presence).await {
            warn!(trackable = %trackable_id, error = %err, "Failed to disconnect failed trackable");
        }
        Ok(())
    });
    Ok(())
}

pub(super) fn remove_trackable(
    trackable: Trackable,
    callback: ResultCallback<bool>,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let id = trackable.id.clone();

    if props.removing.contains(&id) {
        debug!(trackable = %id, "Trackable is already being removed");
        callback.complete(Ok(false));
        return Ok(());
    }

    if props.is_tracked(&id) {
        props.removing.insert(id.clone());
        props.set_final_state(&id, TrackableState::Offline(None));
        props.remove_state_channel(&id);
        callback.complete(Ok(true));

        let transport = Arc::clone(&ctx.env().transport);
        let presence = props.presence_data.clone();
        let poster = ctx.poster();
        ctx.schedule_async("disconnect-trackable", async move {
            if let Err(err) = transport.disconnect(&trackable.id, &presence).await {
                warn!(trackable = %trackable.id, error = %err, "Disconnect failed, removing anyway");
            }
            poster.post(WorkerSpecification::DisconnectSuccess { trackable });
            Ok(())
        });
        return Ok(());
    }

    if props.duplicate_guard.is_currently_adding(&id) || props.removal_guard.is_marked_for_removal(&id) {
        debug!(trackable = %id, "Trackable is being added, deferring removal");
        props.mark_for_removal(&id, callback);
        return Ok(());
    }

    callback.complete(Ok(false));
    Ok(())
}

pub(super) fn disconnect_success(
    trackable: Trackable,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let id = trackable.id.clone();
    let was_tracked = props.is_tracked(&id);
    let had_resolution = props.forget_trackable(&id);

    if was_tracked {
        props.hooks.notify_trackable_removed(&trackable);
    }
    if had_resolution {
        ctx.post(WorkerSpecification::ChangeLocationEngineResolution);
    }

    if props.active.as_ref().map_or(false, |active| active.id == id) {
        props.active = None;
        props.current_destination = None;
        props.pending_destination = None;
        props.estimated_arrival_ms = None;
        ctx.env().location_provider.clear_route();
        props.hooks.notify_active_changed(None);
        props.publish_active();
    }

    info!(trackable = %id, "Trackable removed");
    stop_connection_if_unused(props, ctx)
}

pub(super) fn trackable_removal_requested(
    trackable: Trackable,
    callback: AddTrackableCallback,
    result: Result<(), PublisherError>,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let id = trackable.id;
    match result {
        Ok(()) => props.removal_guard.remove_marked(&id, Ok(true)),
        Err(err) => {
            warn!(trackable = %id, error = %err, "Disconnect of removed trackable failed");
            props.removal_guard.remove_marked(&id, Err(err));
        }
    }
    callback.complete(Err(PublisherError::RemoveRequested));
    props.duplicate_guard.finish_adding(&id, Err(PublisherError::RemoveRequested));
    stop_connection_if_unused(props, ctx)
}

pub(super) fn stopping_connection_finished(props: &mut PublisherProperties) -> PublisherResult<()> {
    if props.state() == PublisherState::Disconnecting {
        props.set_state(PublisherState::Idle)?;
        props.connection_state = ConnectionStateChange::new(ConnectionState::Offline);
    }
    Ok(())
}

/// Stops location updates and the connection once nothing is left.
fn stop_connection_if_unused(props: &mut PublisherProperties, ctx: &mut WorkContext<'_>) -> PublisherResult<()> {
    if !props.has_no_trackables_adding_or_added() || props.state() != PublisherState::Connected {
        return Ok(());
    }

    if props.is_tracking {
        stop_location_updates(props, ctx);
    }
    props.set_state(PublisherState::Disconnecting)?;

    let transport = Arc::clone(&ctx.env().transport);
    let poster = ctx.poster();
    ctx.schedule_async("stop-connection", async move {
        if let Err(err) = transport.stop_connection().await {
            warn!(error = %err, "Failed to stop connection");
        }
        poster.post(WorkerSpecification::StoppingConnectionFinished);
        Ok(())
    });
    Ok(())
}

// ============================================================================
// LOCATION UPDATES
// ============================================================================

fn start_location_updates(props: &mut PublisherProperties, ctx: &WorkContext<'_>) {
    debug!("Starting location updates");
    let provider = &ctx.env().location_provider;
    provider.register_location_observer(Arc::clone(&ctx.env().observer));
    provider.start_trip();
    props.is_tracking = true;
}

fn stop_location_updates(props: &mut PublisherProperties, ctx: &WorkContext<'_>) {
    debug!("Stopping location updates");
    let provider = &ctx.env().location_provider;
    provider.unregister_location_observer();
    provider.stop_and_close();
    props.is_tracking = false;
}

// ============================================================================
// STOP
// ============================================================================

pub(super) fn stop(
    callback: ResultCallback<()>,
    timeout: Duration,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    info!("Stopping publisher");
    stop_location_updates(props, ctx);
    props.set_state(PublisherState::Stopped)?;
    props.dispose();

    let transport = Arc::clone(&ctx.env().transport);
    let context = Arc::clone(&ctx.env().context);
    let presence = props.presence_data.clone();
    let inflight = ctx.inflight();
    ctx.schedule_detached("stop", async move {
        let drain = async {
            if let Err(err) = transport.close(&presence).await {
                warn!(error = %err, "Failed to close transport");
            }
            inflight.wait_idle().await;
        };
        match with_timeout(context.as_ref(), timeout, drain).await {
            Some(()) => {
                info!("Publisher stopped");
                callback.complete(Ok(()));
            }
            None => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(timeout_ms, "Publisher stop timed out");
                callback.complete(Err(PublisherError::StopTimeout(timeout_ms)));
            }
        }
        Ok(())
    });
    Ok(())
}
