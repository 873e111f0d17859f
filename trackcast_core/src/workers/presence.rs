//! Presence: retries, presence data updates and subscriber bookkeeping.

use super::{with_timeout, WorkContext, WorkerSpecification};
use crate::callback::ResultCallback;
use crate::error::PublisherResult;
use crate::model::{Subscriber, Trackable};
use crate::properties::PublisherProperties;
use crate::queue::WorkPoster;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use trackcast_env::{
    ClientType, EnvError, ErrorInformation, FailureKind, PresenceAction, PresenceData, PresenceListener,
    PresenceMessage,
};

/// Listener that turns channel presence events into work.
pub(super) fn presence_listener(poster: WorkPoster, trackable: Trackable) -> PresenceListener {
    Arc::new(move |message| {
        poster.post(WorkerSpecification::PresenceMessage {
            trackable: trackable.clone(),
            message,
        });
    })
}

fn is_retriable(error: &EnvError) -> bool {
    matches!(error, EnvError::Timeout(_)) || error.failure_kind() == FailureKind::Retriable
}

/// Whether a presence retry should still run. Surfaces the last error once
/// retries are exhausted.
fn should_retry(
    trackable_id: &str,
    attempt: u32,
    last_error: Option<ErrorInformation>,
    props: &mut PublisherProperties,
) -> bool {
    if !props.is_tracked(trackable_id)
        || props.removing.contains(trackable_id)
        || props.is_finalized(trackable_id)
    {
        return false;
    }
    if attempt < props.config.presence_retry_limit {
        return true;
    }
    warn!(trackable = %trackable_id, attempt, "Giving up presence retries");
    if let Some(error) = last_error {
        props.last_errors.insert(trackable_id.to_string(), error);
        props.update_trackable_state(trackable_id);
    }
    false
}

/// First attempts run right away; later ones wait for the retry delay.
fn schedule_attempt<F>(name: &'static str, attempt: u32, props: &PublisherProperties, ctx: &mut WorkContext<'_>, work: F)
where
    F: Future<Output = PublisherResult<()>> + Send + 'static,
{
    if attempt == 0 {
        ctx.schedule_async(name, work);
    } else {
        ctx.schedule_after(name, props.config.presence_retry_delay(), work);
    }
}

// ============================================================================
// ENTER PRESENCE
// ============================================================================

pub(super) fn retry_enter_presence(
    trackable: Trackable,
    attempt: u32,
    last_error: Option<ErrorInformation>,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if props.entered_presence.contains(&trackable.id) || !should_retry(&trackable.id, attempt, last_error, props) {
        return Ok(());
    }

    let transport = Arc::clone(&ctx.env().transport);
    let presence = props.presence_data.clone();
    let poster = ctx.poster();
    let give_up = props.config.presence_retry_limit;
    schedule_attempt("retry-enter-presence", attempt, props, ctx, async move {
        let result: Result<(), EnvError> = async {
            transport.wait_for_channel_attach(&trackable.id).await?;
            transport.enter_presence(&trackable.id, &presence).await
        }
        .await;

        match result {
            Ok(()) => {
                poster.post(WorkerSpecification::RetryEnterPresenceSuccess { trackable });
            }
            Err(err) if err.is_fatal() => {
                poster.post(WorkerSpecification::FailTrackable {
                    trackable_id: trackable.id.clone(),
                    error: err.error_information(),
                });
            }
            Err(err) => {
                warn!(trackable = %trackable.id, attempt, error = %err, "Enter presence retry failed");
                let next = if is_retriable(&err) { attempt + 1 } else { give_up };
                poster.post(WorkerSpecification::RetryEnterPresence {
                    trackable,
                    attempt: next,
                    last_error: Some(err.error_information()),
                });
            }
        }
        Ok(())
    });
    Ok(())
}

pub(super) fn retry_enter_presence_success(trackable: Trackable, props: &mut PublisherProperties) -> PublisherResult<()> {
    if props.is_tracked(&trackable.id) {
        debug!(trackable = %trackable.id, "Entered presence");
        props.entered_presence.insert(trackable.id.clone());
        props.update_trackable_state(&trackable.id);
    }
    Ok(())
}

// ============================================================================
// SUBSCRIBE TO PRESENCE
// ============================================================================

pub(super) fn retry_subscribe_to_presence(
    trackable: Trackable,
    attempt: u32,
    last_error: Option<ErrorInformation>,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if props.subscribed_to_presence.contains(&trackable.id) || !should_retry(&trackable.id, attempt, last_error, props) {
        return Ok(());
    }

    let listener = presence_listener(ctx.poster(), trackable.clone());
    let transport = Arc::clone(&ctx.env().transport);
    let context = Arc::clone(&ctx.env().context);
    let timeout = props.config.presence_subscribe_timeout();
    let poster = ctx.poster();
    schedule_attempt("retry-subscribe-presence", attempt, props, ctx, async move {
        let result: Result<(), EnvError> = async {
            transport.wait_for_channel_attach(&trackable.id).await?;
            let subscribe = transport.subscribe_for_presence(&trackable.id, listener);
            with_timeout(context.as_ref(), timeout, subscribe)
                .await
                .unwrap_or_else(|| Err(EnvError::timeout(timeout.as_millis() as u64)))
        }
        .await;

        match result {
            Ok(()) => {
                poster.post(WorkerSpecification::RetrySubscribeToPresenceSuccess { trackable });
            }
            // Subscribe failures never fail the trackable, fatal ones included
            Err(err) => {
                warn!(trackable = %trackable.id, attempt, error = %err, "Presence subscribe retry failed");
                poster.post(WorkerSpecification::RetrySubscribeToPresence {
                    trackable,
                    attempt: attempt + 1,
                    last_error: Some(err.error_information()),
                });
            }
        }
        Ok(())
    });
    Ok(())
}

pub(super) fn retry_subscribe_to_presence_success(
    trackable: Trackable,
    props: &mut PublisherProperties,
) -> PublisherResult<()> {
    if props.is_tracked(&trackable.id) {
        debug!(trackable = %trackable.id, "Subscribed to presence");
        props.subscribed_to_presence.insert(trackable.id.clone());
        props.update_trackable_state(&trackable.id);
    }
    Ok(())
}

// ============================================================================
// PRESENCE DATA
// ============================================================================

pub(super) fn update_presence_data(
    trackable_id: String,
    presence_data: PresenceData,
    attempt: u32,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if !props.is_tracked(&trackable_id) || props.removing.contains(&trackable_id) {
        return Ok(());
    }
    if attempt >= props.config.presence_retry_limit {
        warn!(trackable = %trackable_id, attempt, "Giving up presence data update");
        return Ok(());
    }

    let transport = Arc::clone(&ctx.env().transport);
    let poster = ctx.poster();
    schedule_attempt("update-presence-data", attempt, props, ctx, async move {
        let result: Result<(), EnvError> = async {
            transport.wait_for_channel_attach(&trackable_id).await?;
            transport.update_presence_data(&trackable_id, &presence_data).await
        }
        .await;

        match result {
            Ok(()) => debug!(trackable = %trackable_id, "Presence data updated"),
            Err(err) if err.is_fatal() => {
                warn!(trackable = %trackable_id, error = %err, "Fatal error updating presence data");
            }
            Err(err) => {
                warn!(trackable = %trackable_id, attempt, error = %err, "Presence data update failed, retrying");
                poster.post(WorkerSpecification::UpdatePresenceData {
                    trackable_id,
                    presence_data,
                    attempt: attempt + 1,
                });
            }
        }
        Ok(())
    });
    Ok(())
}

pub(super) fn set_raw_locations_enabled(
    enabled: bool,
    callback: ResultCallback<()>,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    props.raw_locations_enabled = enabled;
    props.presence_data = PresenceData::publisher(enabled);
    for trackable_id in props.tracked.keys() {
        ctx.post(WorkerSpecification::UpdatePresenceData {
            trackable_id: trackable_id.clone(),
            presence_data: props.presence_data.clone(),
            attempt: 0,
        });
    }
    callback.complete(Ok(()));
    Ok(())
}

// ============================================================================
// SUBSCRIBERS
// ============================================================================

pub(super) fn presence_message(
    trackable: Trackable,
    message: PresenceMessage,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let id = trackable.id;
    let Some(trackable) = props.tracked.get(&id).cloned() else {
        return Ok(());
    };
    if props.removing.contains(&id) || message.data.client_type != ClientType::Subscriber {
        return Ok(());
    }

    let members = props.presence_members.entry(id.clone()).or_default();
    if !members.accept(&message) {
        debug!(trackable = %id, member = %message.member_key, "Ignoring stale presence message");
        return Ok(());
    }

    let subscriber = Subscriber {
        id: message.member_key.clone(),
        trackable_id: id.clone(),
    };
    match message.action {
        PresenceAction::Present | PresenceAction::Enter | PresenceAction::Update => {
            let is_new = props.subscribers.entry(id.clone()).or_default().insert(subscriber.clone());
            let requests = props.requests.entry(id.clone()).or_default();
            match message.data.resolution {
                Some(resolution) => {
                    requests.insert(subscriber.id.clone(), resolution);
                }
                None => {
                    requests.remove(&subscriber.id);
                }
            }
            if is_new {
                debug!(trackable = %id, subscriber = %subscriber.id, "Subscriber added");
                props.hooks.notify_subscriber_added(&subscriber);
            }
        }
        PresenceAction::Leave | PresenceAction::Absent => {
            let removed = props
                .subscribers
                .get_mut(&id)
                .map_or(false, |subscribers| subscribers.remove(&subscriber));
            if let Some(requests) = props.requests.get_mut(&id) {
                requests.remove(&subscriber.id);
            }
            if removed {
                debug!(trackable = %id, subscriber = %subscriber.id, "Subscriber removed");
                props.hooks.notify_subscriber_removed(&subscriber);
            }
        }
    }

    props.resolve_resolution(&trackable);
    ctx.post(WorkerSpecification::ChangeLocationEngineResolution);
    Ok(())
}
