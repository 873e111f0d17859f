//! Common types shared by the publisher engine and its collaborators.

use crate::error::ErrorInformation;
use serde::{Deserialize, Serialize};

/// Sampling accuracy tier, ordered from least to most demanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Accuracy {
    Minimum = 1,
    Low = 2,
    Balanced = 3,
    High = 4,
    Maximum = 5,
}

impl Accuracy {
    /// Numeric level (1 = minimum, 5 = maximum).
    pub fn level(self) -> u8 {
        self as u8
    }
}

/// Sampling configuration for the location engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Accuracy tier
    pub accuracy: Accuracy,

    /// Desired time between published locations, in milliseconds
    pub desired_interval: i64,

    /// Minimum distance between published locations, in meters
    pub minimum_displacement: f64,
}

impl Resolution {
    pub fn new(accuracy: Accuracy, desired_interval: i64, minimum_displacement: f64) -> Self {
        Self {
            accuracy,
            desired_interval,
            minimum_displacement,
        }
    }
}

/// A single position observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees (WGS84)
    pub latitude: f64,

    /// Longitude in degrees (WGS84)
    pub longitude: f64,

    /// Altitude in meters
    pub altitude: f64,

    /// Horizontal accuracy in meters
    pub accuracy: f32,

    /// Bearing in degrees
    pub bearing: f32,

    /// Speed in m/s
    pub speed: f32,

    /// Observation time, milliseconds since the Unix epoch
    pub time: i64,
}

impl Location {
    /// Creates a location with zeroed auxiliary fields.
    pub fn new(latitude: f64, longitude: f64, time: i64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: 0.0,
            accuracy: 0.0,
            bearing: 0.0,
            speed: 0.0,
            time,
        }
    }

    /// Milliseconds elapsed between `other` and this location.
    pub fn time_from(&self, other: &Location) -> i64 {
        self.time - other.time
    }
}

/// Destination of the active trackable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub latitude: f64,
    pub longitude: f64,
}

impl Destination {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Routing profile used for ETA calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingProfile {
    #[default]
    Driving,
    Cycling,
    Walking,
    DrivingTraffic,
}

/// A raw location ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub location: Location,

    /// Locations that could not be delivered since the last successful publish
    pub skipped_locations: Vec<Location>,
}

impl LocationUpdate {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            skipped_locations: Vec::new(),
        }
    }
}

/// Whether an enhanced location was map-matched or predicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationUpdateType {
    Predicted,
    Actual,
}

/// A filtered location ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancedLocationUpdate {
    pub location: Location,
    pub skipped_locations: Vec<Location>,

    /// Key points between the previous and this location
    pub intermediate_locations: Vec<Location>,
    pub update_type: LocationUpdateType,
}

impl EnhancedLocationUpdate {
    pub fn new(
        location: Location,
        intermediate_locations: Vec<Location>,
        update_type: LocationUpdateType,
    ) -> Self {
        Self {
            location,
            skipped_locations: Vec::new(),
            intermediate_locations,
            update_type,
        }
    }
}

/// Channel event name a location is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    Enhanced,
    Raw,
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Enhanced => "enhanced",
            ChannelEvent::Raw => "raw",
        }
    }
}

/// Role of a presence member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientType {
    Publisher,
    Subscriber,
}

/// Payload attached to a presence member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceData {
    #[serde(rename = "type")]
    pub client_type: ClientType,

    /// Resolution requested by a subscriber
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,

    /// Whether the publisher sends raw locations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_locations: Option<bool>,
}

impl PresenceData {
    /// Presence payload of a publisher.
    pub fn publisher(raw_locations: bool) -> Self {
        Self {
            client_type: ClientType::Publisher,
            resolution: None,
            raw_locations: raw_locations.then_some(true),
        }
    }

    /// Presence payload of a subscriber requesting a resolution.
    pub fn subscriber(resolution: Option<Resolution>) -> Self {
        Self {
            client_type: ClientType::Subscriber,
            resolution,
            raw_locations: None,
        }
    }
}

/// Presence event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceAction {
    Present,
    Enter,
    Update,
    Leave,
    Absent,
}

impl PresenceAction {
    /// True for leave and absent events.
    pub fn is_departure(&self) -> bool {
        matches!(self, PresenceAction::Leave | PresenceAction::Absent)
    }
}

/// A presence event received on a trackable's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMessage {
    pub action: PresenceAction,
    pub data: PresenceData,

    /// Unique key of the member (`client_id:connection_id`)
    pub member_key: String,
    pub connection_id: String,
    pub client_id: String,

    /// Message id, `connection_id:serial:index`
    pub id: String,

    /// Transport timestamp, milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Connectivity of the transport or of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Online,
    Offline,
    Failed,
}

/// A reported connectivity transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub state: ConnectionState,
    pub error_information: Option<ErrorInformation>,
}

impl ConnectionStateChange {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            error_information: None,
        }
    }

    pub fn failed(error_information: ErrorInformation) -> Self {
        Self {
            state: ConnectionState::Failed,
            error_information: Some(error_information),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy_ordering() {
        assert!(Accuracy::Minimum < Accuracy::Low);
        assert!(Accuracy::Balanced < Accuracy::High);
        assert!(Accuracy::High < Accuracy::Maximum);
        assert_eq!(Accuracy::Maximum.level(), 5);
    }

    #[test]
    fn test_presence_data_wire_shape() {
        let data = PresenceData::publisher(true);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "PUBLISHER");
        assert_eq!(json["rawLocations"], true);
        assert!(json.get("resolution").is_none());

        let quiet = serde_json::to_value(PresenceData::publisher(false)).unwrap();
        assert!(quiet.get("rawLocations").is_none());
    }

    #[test]
    fn test_subscriber_presence_data_parses_resolution() {
        let json = r#"{"type":"SUBSCRIBER","resolution":{"accuracy":"HIGH","desiredInterval":500,"minimumDisplacement":2.5}}"#;
        let data: PresenceData = serde_json::from_str(json).unwrap();
        assert_eq!(data.client_type, ClientType::Subscriber);
        assert_eq!(
            data.resolution,
            Some(Resolution::new(Accuracy::High, 500, 2.5))
        );
    }

    #[test]
    fn test_departure_actions() {
        assert!(PresenceAction::Leave.is_departure());
        assert!(PresenceAction::Absent.is_departure());
        assert!(!PresenceAction::Update.is_departure());
    }
}
