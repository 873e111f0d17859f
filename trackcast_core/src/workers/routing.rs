//! Active trackable, routing and location engine resolution.

use super::{WorkContext, WorkerSpecification};
use crate::callback::ResultCallback;
use crate::error::{PublisherError, PublisherResult};
use crate::model::Trackable;
use crate::properties::PublisherProperties;
use std::sync::Arc;
use tracing::{debug, warn};
use trackcast_env::{Destination, Location, RoutingProfile};

pub(super) fn set_active_trackable(
    trackable: Trackable,
    callback: ResultCallback<()>,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if !props.is_tracked(&trackable.id) || props.removing.contains(&trackable.id) {
        callback.complete(Err(PublisherError::invalid_state(format!(
            "Trackable {} is not tracked",
            trackable.id
        ))));
        return Ok(());
    }

    let changed = props.active.as_ref().map_or(true, |active| active.id != trackable.id);
    if changed {
        debug!(trackable = %trackable.id, "Active trackable changed");
        props.active = Some(trackable.clone());
        props.hooks.notify_active_changed(Some(&trackable));
        props.publish_active();
        match trackable.destination {
            Some(destination) => set_destination(destination, props, ctx),
            None => clear_destination(props, ctx),
        }
    }
    callback.complete(Ok(()));
    Ok(())
}

fn set_destination(destination: Destination, props: &mut PublisherProperties, ctx: &mut WorkContext<'_>) {
    props.current_destination = Some(destination);
    props.estimated_arrival_ms = None;
    match props.last_publisher_location {
        Some(current) => {
            props.pending_destination = None;
            request_route(current, destination, props, ctx);
        }
        None => {
            debug!("No location yet, deferring route request");
            props.pending_destination = Some(destination);
        }
    }
}

fn clear_destination(props: &mut PublisherProperties, ctx: &mut WorkContext<'_>) {
    if props.current_destination.is_some() || props.pending_destination.is_some() {
        ctx.env().location_provider.clear_route();
    }
    props.current_destination = None;
    props.pending_destination = None;
    props.estimated_arrival_ms = None;
}

/// Asks the provider for a route; the duration comes back as `DestinationSet`.
pub(super) fn request_route(
    current: Location,
    destination: Destination,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) {
    let provider = Arc::clone(&ctx.env().location_provider);
    let profile = props.routing_profile;
    let poster = ctx.poster();
    ctx.schedule_async("set-route", async move {
        match provider.set_route(current, destination, profile).await {
            Ok(route_duration_ms) => {
                poster.post(WorkerSpecification::DestinationSet { route_duration_ms });
            }
            Err(err) => warn!(error = %err, "Failed to set route"),
        }
        Ok(())
    });
}

pub(super) fn destination_set(
    route_duration_ms: i64,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    if props.current_destination.is_some() {
        let eta = ctx.now_millis() + route_duration_ms;
        debug!(eta, "Route set");
        props.estimated_arrival_ms = Some(eta);
    }
    Ok(())
}

pub(super) fn change_routing_profile(
    profile: RoutingProfile,
    callback: ResultCallback<()>,
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    props.routing_profile = profile;
    props.publish_routing_profile();
    if let (Some(destination), Some(current)) = (props.current_destination, props.last_publisher_location) {
        request_route(current, destination, props, ctx);
    }
    callback.complete(Ok(()));
    Ok(())
}

pub(super) fn change_location_engine_resolution(
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let resolution = props.combined_engine_resolution();
    if props.location_engine_resolution != Some(resolution) {
        debug!(?resolution, "Changing location engine resolution");
        ctx.env().location_provider.change_resolution(resolution);
        props.location_engine_resolution = Some(resolution);
    }
    Ok(())
}

pub(super) fn refresh_resolution_policy(
    props: &mut PublisherProperties,
    ctx: &mut WorkContext<'_>,
) -> PublisherResult<()> {
    let trackables: Vec<Trackable> = props.tracked.values().cloned().collect();
    for trackable in &trackables {
        props.resolve_resolution(trackable);
    }
    ctx.post(WorkerSpecification::ChangeLocationEngineResolution);
    Ok(())
}
