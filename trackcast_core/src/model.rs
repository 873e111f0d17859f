//! Publisher domain model: trackables, constraints, subscribers and states.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use trackcast_env::{Destination, ErrorInformation, Resolution};

// ============================================================================
// TRACKABLE
// ============================================================================

/// An entity whose location is published.
///
/// Equality and hashing use the id only: two values with the same id are
/// the same trackable regardless of destination or constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trackable {
    /// Opaque identifier, also the channel name
    pub id: String,

    /// Where the trackable is heading, if known
    pub destination: Option<Destination>,

    /// Per-trackable resolution constraints
    pub constraints: Option<ResolutionConstraints>,
}

impl Trackable {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destination: None,
            constraints: None,
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_constraints(mut self, constraints: ResolutionConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }
}

impl PartialEq for Trackable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Trackable {}

impl Hash for Trackable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// ============================================================================
// RESOLUTION CONSTRAINTS
// ============================================================================

/// Resolutions for the four proximity/subscriber combinations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionSet {
    pub far_with_subscriber: Resolution,
    pub far_without_subscriber: Resolution,
    pub near_with_subscriber: Resolution,
    pub near_without_subscriber: Resolution,
}

impl ResolutionSet {
    /// The same resolution in every cell.
    pub fn uniform(resolution: Resolution) -> Self {
        Self {
            far_with_subscriber: resolution,
            far_without_subscriber: resolution,
            near_with_subscriber: resolution,
            near_without_subscriber: resolution,
        }
    }

    /// Selects the cell for the current proximity and subscriber state.
    pub fn select(&self, proximity_reached: bool, has_subscribers: bool) -> Resolution {
        match (proximity_reached, has_subscribers) {
            (false, true) => self.far_with_subscriber,
            (false, false) => self.far_without_subscriber,
            (true, true) => self.near_with_subscriber,
            (true, false) => self.near_without_subscriber,
        }
    }
}

/// Distance/time bounds that count as "near the destination".
///
/// Either bound may be absent; an absent bound never counts as reached.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Proximity {
    /// Meters from the destination
    pub spatial: Option<f64>,

    /// Milliseconds before the estimated arrival
    pub temporal: Option<i64>,
}

impl Proximity {
    pub fn spatial(meters: f64) -> Self {
        Self {
            spatial: Some(meters),
            temporal: None,
        }
    }

    pub fn temporal(millis: i64) -> Self {
        Self {
            spatial: None,
            temporal: Some(millis),
        }
    }
}

/// Constraints a trackable declares for the default resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionConstraints {
    pub resolutions: ResolutionSet,
    pub proximity_threshold: Proximity,

    /// Battery percentage below which the low battery multiplier applies
    pub battery_level_threshold: f32,

    /// Factor applied to the desired interval on low battery
    pub low_battery_multiplier: f32,
}

// ============================================================================
// SUBSCRIBERS & REQUESTS
// ============================================================================

/// A remote consumer present on a trackable's channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscriber {
    /// Presence member key of the subscriber
    pub id: String,
    pub trackable_id: String,
}

/// Input of the resolution policy for one trackable.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub trackable: Trackable,

    /// Resolutions requested by the trackable's subscribers
    pub remote_requests: Vec<Resolution>,
}

// ============================================================================
// TRACKABLE STATE
// ============================================================================

/// Externally visible state of a trackable.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackableState {
    /// Connected, present and publishing
    Online,

    /// Not (yet) publishing; carries the last surfaced error, if any
    Offline(Option<ErrorInformation>),

    /// Unrecoverable failure
    Failed(ErrorInformation),
}

impl TrackableState {
    pub fn is_online(&self) -> bool {
        matches!(self, TrackableState::Online)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TrackableState::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use trackcast_env::Accuracy;

    #[test]
    fn test_trackable_equality_by_id() {
        let a = Trackable::new("T1");
        let b = Trackable::new("T1").with_destination(Destination::new(1.0, 2.0));
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert!(set.insert(Trackable::new("T2")));
    }

    #[test]
    fn test_resolution_set_matrix() {
        let r = |interval| Resolution::new(Accuracy::Balanced, interval, 1.0);
        let set = ResolutionSet {
            far_with_subscriber: r(1),
            far_without_subscriber: r(2),
            near_with_subscriber: r(3),
            near_without_subscriber: r(4),
        };
        assert_eq!(set.select(false, true).desired_interval, 1);
        assert_eq!(set.select(false, false).desired_interval, 2);
        assert_eq!(set.select(true, true).desired_interval, 3);
        assert_eq!(set.select(true, false).desired_interval, 4);
    }
}
