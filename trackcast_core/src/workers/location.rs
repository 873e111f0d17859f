//! Location publishing workers.
//!
//! Each incoming location fans out to every tracked trackable. Per trackable
//! a location is either queued behind an outstanding publish, throttled into
//! the skipped buffer, or published. Publish outcomes come back as
//! `Send*Success` / `Send*Failure` specifications.

use super::{routing, WorkContext, WorkerSpecification};
use crate::error::{PublisherError, PublisherResult};
use crate::properties::PublisherProperties;
use crate::proximity::{distance_between, is_threshold_reached};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use trackcast_env::{codec, ChannelEvent, EnhancedLocationUpdate, Location, LocationUpdate, Resolution};

/// Throttle check against the trackable's resolution.
///
/// Always sends when nothing was sent yet or no resolution is known.
fn should_send_location(current: &Location, last_sent: Option<&Location>, resolution: Option<&Resolution>) -> bool {
    let (Some(last_sent), Some(resolution)) = (last_sent, resolution) else {
        return true;
    };
    distance_between(current, last_sent) >= resolution.minimum_displacement
        && current.time_from(last_sent) >= resolution.desired_interval
}

// ============================================================================
// ENHANCED
// ============================================================================

pub(super) fn enhanced_location_changed(
    update: EnhancedLocationUpdate,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let ids: Vec<String> = props
        .tracked
        .keys()
        .filter(|id| !props.is_finalized(id) && !props.removing.contains(*id))
        .cloned()
        .collect();
    for id in ids {
        process_enhanced(&id, update.clone(), props, ctx)?;
    }

    let location = update.location;
    props.emit_location(update);

    if let Some(threshold) = props.methods.proximity_threshold() {
        let reached = is_threshold_reached(
            &threshold,
            &location,
            ctx.now_millis(),
            props.current_destination.as_ref(),
            props.estimated_arrival_ms,
        );
        if reached {
            debug!("Proximity threshold reached");
            props.methods.on_proximity_reached();
        }
    }
    Ok(())
}

fn process_enhanced(
    trackable_id: &str,
    update: EnhancedLocationUpdate,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if props.enhanced_publishing.has_pending_message(trackable_id) {
        trace!(trackable = %trackable_id, "Publish outstanding, queueing enhanced location");
        props.enhanced_publishing.add_to_waiting(trackable_id, update);
        return Ok(());
    }
    let send = should_send_location(
        &update.location,
        props.last_sent_enhanced.get(trackable_id),
        props.resolutions.get(trackable_id),
    );
    if send {
        send_enhanced(trackable_id, update, props, ctx)
    } else {
        trace!(trackable = %trackable_id, "Throttling enhanced location");
        props.skipped_enhanced.add(trackable_id, update.location);
        Ok(())
    }
}

fn send_enhanced(
    trackable_id: &str,
    mut update: EnhancedLocationUpdate,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    update.skipped_locations = props.skipped_enhanced.to_list(trackable_id);
    let payload = codec::encode_enhanced(&update)?;
    props.enhanced_publishing.mark_message_as_pending(trackable_id);

    let transport = Arc::clone(&ctx.env().transport);
    let poster = ctx.poster();
    let id = trackable_id.to_string();
    let fallback_id = id.clone();
    let fallback_update = update.clone();
    ctx.schedule_async_or(
        "publish-enhanced",
        async move {
            let next = match transport.publish(&id, ChannelEvent::Enhanced, payload).await {
                Ok(()) => WorkerSpecification::SendEnhancedLocationSuccess {
                    location: update.location,
                    trackable_id: id,
                },
                Err(err) => WorkerSpecification::SendEnhancedLocationFailure {
                    update,
                    trackable_id: id,
                    error: err.into(),
                },
            };
            poster.post(next);
            Ok(())
        },
        move |error| {
            Some(WorkerSpecification::SendEnhancedLocationFailure {
                update: fallback_update,
                trackable_id: fallback_id,
                error,
            })
        },
    );
    Ok(())
}

pub(super) fn send_enhanced_success(
    location: Location,
    trackable_id: String,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if !props.is_tracked(&trackable_id) {
        return Ok(());
    }
    props.enhanced_publishing.unmark_message_as_pending(&trackable_id);
    props.last_sent_enhanced.insert(trackable_id.clone(), location);
    props.skipped_enhanced.clear(&trackable_id);
    props.has_sent_location.insert(trackable_id.clone());
    props.update_trackable_state(&trackable_id);
    drain_enhanced(&trackable_id, props, ctx)
}

pub(super) fn send_enhanced_failure(
    update: EnhancedLocationUpdate,
    trackable_id: String,
    error: PublisherError,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if !props.is_tracked(&trackable_id) {
        return Ok(());
    }
    if props.enhanced_publishing.should_retry_publishing(&trackable_id) {
        debug!(trackable = %trackable_id, error = %error, "Retrying enhanced publish");
        props.enhanced_publishing.increment_retry_count(&trackable_id);
        return send_enhanced(&trackable_id, update, props, ctx);
    }

    warn!(trackable = %trackable_id, error = %error, "Enhanced publish failed, keeping location as skipped");
    props.enhanced_publishing.unmark_message_as_pending(&trackable_id);
    props.skipped_enhanced.add(&trackable_id, update.location);
    drain_enhanced(&trackable_id, props, ctx)
}

/// Processes waiting updates until one is published or the queue is empty.
fn drain_enhanced(trackable_id: &str, props: &mut PublisherProperties, ctx: &mut WorkContext<'_>) -> PublisherResult<()> {
    while !props.enhanced_publishing.has_pending_message(trackable_id) {
        let Some(next) = props.enhanced_publishing.get_next_waiting(trackable_id) else {
            break;
        };
        process_enhanced(trackable_id, next, props, ctx)?;
    }
    Ok(())
}

// ============================================================================
// RAW
// ============================================================================

pub(super) fn raw_location_changed(
    location: Location,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    props.last_publisher_location = Some(location);

    if props.raw_locations_enabled {
        let ids: Vec<String> = props
            .tracked
            .keys()
            .filter(|id| !props.is_finalized(id) && !props.removing.contains(*id))
            .cloned()
            .collect();
        for id in ids {
            process_raw(&id, LocationUpdate::new(location), props, ctx)?;
        }
    }

    // A destination set before the first fix is routed now
    if let Some(destination) = props.pending_destination.take() {
        routing::request_route(location, destination, props, ctx);
    }
    Ok(())
}

fn process_raw(
    trackable_id: &str,
    update: LocationUpdate,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if props.raw_publishing.has_pending_message(trackable_id) {
        props.raw_publishing.add_to_waiting(trackable_id, update);
        return Ok(());
    }
    let send = should_send_location(
        &update.location,
        props.last_sent_raw.get(trackable_id),
        props.resolutions.get(trackable_id),
    );
    if send {
        send_raw(trackable_id, update, props, ctx)
    } else {
        props.skipped_raw.add(trackable_id, update.location);
        Ok(())
    }
}

fn send_raw(
    trackable_id: &str,
    mut update: LocationUpdate,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    update.skipped_locations = props.skipped_raw.to_list(trackable_id);
    let payload = codec::encode_raw(&update)?;
    props.raw_publishing.mark_message_as_pending(trackable_id);

    let transport = Arc::clone(&ctx.env().transport);
    let poster = ctx.poster();
    let id = trackable_id.to_string();
    let fallback_id = id.clone();
    let fallback_update = update.clone();
    ctx.schedule_async_or(
        "publish-raw",
        async move {
            let next = match transport.publish(&id, ChannelEvent::Raw, payload).await {
                Ok(()) => WorkerSpecification::SendRawLocationSuccess {
                    location: update.location,
                    trackable_id: id,
                },
                Err(err) => WorkerSpecification::SendRawLocationFailure {
                    update,
                    trackable_id: id,
                    error: err.into(),
                },
            };
            poster.post(next);
            Ok(())
        },
        move |error| {
            Some(WorkerSpecification::SendRawLocationFailure {
                update: fallback_update,
                trackable_id: fallback_id,
                error,
            })
        },
    );
    Ok(())
}

pub(super) fn send_raw_success(
    location: Location,
    trackable_id: String,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if !props.is_tracked(&trackable_id) {
        return Ok(());
    }
    props.raw_publishing.unmark_message_as_pending(&trackable_id);
    props.last_sent_raw.insert(trackable_id.clone(), location);
    props.skipped_raw.clear(&trackable_id);
    drain_raw(&trackable_id, props, ctx)
}

pub(super) fn send_raw_failure(
    update: LocationUpdate,
    trackable_id: String,
    error: PublisherError,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if !props.is_tracked(&trackable_id) {
        return Ok(());
    }
    if props.raw_publishing.should_retry_publishing(&trackable_id) {
        props.raw_publishing.increment_retry_count(&trackable_id);
        return send_raw(&trackable_id, update, props, ctx);
    }

    warn!(trackable = %trackable_id, error = %error, "Raw publish failed, keeping location as skipped");
    props.raw_publishing.unmark_message_as_pending(&trackable_id);
    props.skipped_raw.add(&trackable_id, update.location);
    drain_raw(&trackable_id, props, ctx)
}

fn drain_raw(trackable_id: &str, props: &mut PublisherProperties, ctx: &mut WorkContext<'_>) -> PublisherResult<()> {
    while !props.raw_publishing.has_pending_message(trackable_id) {
        let Some(next) = props.raw_publishing.get_next_waiting(trackable_id) else {
            break;
        };
        process_raw(trackable_id, next, props, ctx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackcast_env::Accuracy;

    #[test]
    fn test_first_location_is_always_sent() {
        let current = Location::new(51.5, -0.12, 1_000);
        let resolution = Resolution::new(Accuracy::Balanced, 1_000, 0.0);
        assert!(should_send_location(&current, None, Some(&resolution)));
        assert!(should_send_location(&current, Some(&current), None));
    }

    #[test]
    fn test_throttle_requires_interval_and_displacement() {
        let last = Location::new(51.5, -0.12, 1_000);
        let resolution = Resolution::new(Accuracy::Balanced, 1_000, 10.0);

        // ~111 m north, only 500 ms later
        let too_soon = Location::new(51.501, -0.12, 1_500);
        assert!(!should_send_location(&too_soon, Some(&last), Some(&resolution)));

        // Same spot, 2 s later
        let too_close = Location::new(51.5, -0.12, 3_000);
        assert!(!should_send_location(&too_close, Some(&last), Some(&resolution)));

        let both = Location::new(51.501, -0.12, 2_000);
        assert!(should_send_location(&both, Some(&last), Some(&resolution)));
    }
}
