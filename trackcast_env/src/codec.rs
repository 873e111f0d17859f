//! JSON wire format for published locations and presence payloads.
//!
//! Locations travel as GeoJSON `Feature`s with a `Point` geometry
//! (`[longitude, latitude, altitude]`) and the sample metadata in
//! `properties`. Timestamps are fractional seconds on the wire.

use crate::error::EnvError;
use crate::types::{EnhancedLocationUpdate, Location, LocationUpdate, LocationUpdateType, PresenceData};
use serde::{Deserialize, Serialize};

const FEATURE: &str = "Feature";
const POINT: &str = "Point";
const MILLISECONDS_PER_SECOND: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoJsonGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoJsonProperties {
    pub accuracy_horizontal: f32,
    pub bearing: f32,
    pub speed: f32,
    /// Seconds since the Unix epoch
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoJsonMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: GeoJsonGeometry,
    pub properties: GeoJsonProperties,
}

impl From<&Location> for GeoJsonMessage {
    fn from(location: &Location) -> Self {
        Self {
            kind: FEATURE.to_string(),
            geometry: GeoJsonGeometry {
                kind: POINT.to_string(),
                coordinates: [location.longitude, location.latitude, location.altitude],
            },
            properties: GeoJsonProperties {
                accuracy_horizontal: location.accuracy,
                bearing: location.bearing,
                speed: location.speed,
                time: location.time as f64 / MILLISECONDS_PER_SECOND,
            },
        }
    }
}

impl From<&GeoJsonMessage> for Location {
    fn from(message: &GeoJsonMessage) -> Self {
        let [longitude, latitude, altitude] = message.geometry.coordinates;
        Location {
            latitude,
            longitude,
            altitude,
            accuracy: message.properties.accuracy_horizontal,
            bearing: message.properties.bearing,
            speed: message.properties.speed,
            time: (message.properties.time * MILLISECONDS_PER_SECOND).round() as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnhancedLocationUpdateMessage {
    location: GeoJsonMessage,
    skipped_locations: Vec<GeoJsonMessage>,
    intermediate_locations: Vec<GeoJsonMessage>,
    #[serde(rename = "type")]
    update_type: LocationUpdateType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationUpdateMessage {
    location: GeoJsonMessage,
    skipped_locations: Vec<GeoJsonMessage>,
}

fn to_geo_json(locations: &[Location]) -> Vec<GeoJsonMessage> {
    locations.iter().map(GeoJsonMessage::from).collect()
}

fn from_geo_json(messages: &[GeoJsonMessage]) -> Vec<Location> {
    messages.iter().map(Location::from).collect()
}

/// Serializes an enhanced update for the `enhanced` event.
pub fn encode_enhanced(update: &EnhancedLocationUpdate) -> Result<String, EnvError> {
    let message = EnhancedLocationUpdateMessage {
        location: GeoJsonMessage::from(&update.location),
        skipped_locations: to_geo_json(&update.skipped_locations),
        intermediate_locations: to_geo_json(&update.intermediate_locations),
        update_type: update.update_type,
    };
    Ok(serde_json::to_string(&message)?)
}

/// Parses an `enhanced` event payload.
pub fn decode_enhanced(payload: &str) -> Result<EnhancedLocationUpdate, EnvError> {
    let message: EnhancedLocationUpdateMessage = serde_json::from_str(payload)?;
    Ok(EnhancedLocationUpdate {
        location: Location::from(&message.location),
        skipped_locations: from_geo_json(&message.skipped_locations),
        intermediate_locations: from_geo_json(&message.intermediate_locations),
        update_type: message.update_type,
    })
}

/// Serializes a raw update for the `raw` event.
pub fn encode_raw(update: &LocationUpdate) -> Result<String, EnvError> {
    let message = LocationUpdateMessage {
        location: GeoJsonMessage::from(&update.location),
        skipped_locations: to_geo_json(&update.skipped_locations),
    };
    Ok(serde_json::to_string(&message)?)
}

/// Parses a `raw` event payload.
pub fn decode_raw(payload: &str) -> Result<LocationUpdate, EnvError> {
    let message: LocationUpdateMessage = serde_json::from_str(payload)?;
    Ok(LocationUpdate {
        location: Location::from(&message.location),
        skipped_locations: from_geo_json(&message.skipped_locations),
    })
}

/// Serializes a presence payload.
pub fn encode_presence_data(data: &PresenceData) -> Result<String, EnvError> {
    Ok(serde_json::to_string(data)?)
}

/// Parses a presence payload.
pub fn decode_presence_data(payload: &str) -> Result<PresenceData, EnvError> {
    Ok(serde_json::from_str(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Location {
        Location {
            latitude: 51.5007,
            longitude: -0.1246,
            altitude: 12.0,
            accuracy: 3.5,
            bearing: 90.0,
            speed: 1.25,
            time: 1_700_000_000_123,
        }
    }

    #[test]
    fn test_geo_json_coordinates_are_lon_lat_alt() {
        let json = serde_json::to_value(GeoJsonMessage::from(&sample())).unwrap();
        assert_eq!(json["type"], "Feature");
        assert_eq!(json["geometry"]["type"], "Point");
        assert_eq!(json["geometry"]["coordinates"][0], -0.1246);
        assert_eq!(json["geometry"]["coordinates"][1], 51.5007);
        assert_eq!(json["properties"]["accuracyHorizontal"], 3.5);
        assert_eq!(json["properties"]["time"], 1_700_000_000.123);
    }

    #[test]
    fn test_enhanced_payload_keeps_skipped_locations() {
        let mut update = EnhancedLocationUpdate::new(sample(), vec![], LocationUpdateType::Actual);
        let mut earlier = sample();
        earlier.time -= 1000;
        update.skipped_locations.push(earlier);

        let decoded = decode_enhanced(&encode_enhanced(&update).unwrap()).unwrap();
        assert_eq!(decoded.skipped_locations.len(), 1);
        assert_eq!(decoded.skipped_locations[0].time, earlier.time);
        assert_eq!(decoded.update_type, LocationUpdateType::Actual);
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let err = decode_raw("{\"location\": 5}").unwrap_err();
        assert!(matches!(err, EnvError::Serialization(_)));
    }
}
