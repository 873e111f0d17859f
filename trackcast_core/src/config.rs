//! Publisher configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use trackcast_env::{Accuracy, Resolution, RoutingProfile};

/// Configuration for a publisher instance.
///
/// Deserializable so that hosts can load it from a config file; missing
/// fields fall back to [`PublisherConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Resolution used when neither constraints nor subscribers apply
    pub default_resolution: Resolution,

    /// Also publish unfiltered locations on the `raw` event (default: false)
    pub raw_locations_enabled: bool,

    /// Fixed location engine resolution, bypassing the policy
    pub constant_location_engine_resolution: Option<Resolution>,

    /// Initial routing profile (default: Driving)
    pub routing_profile: RoutingProfile,

    /// Backoff before re-queueing connection-dependent work (default: 200ms)
    pub work_retry_delay_ms: u64,

    /// Bound on a single presence subscribe attempt (default: 5s)
    pub presence_subscribe_timeout_ms: u64,

    /// Delay between presence enter/subscribe/update retries (default: 15s)
    pub presence_retry_delay_ms: u64,

    /// Retry attempts for presence operations before surfacing the error
    pub presence_retry_limit: u32,

    /// Retries after a failed location publish (default: 1)
    pub max_publish_retries: u32,

    /// Per-trackable skipped location buffer size (default: 60)
    pub max_skipped_locations: usize,

    /// Capacity of the location broadcast stream
    pub location_stream_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            default_resolution: Resolution::new(Accuracy::Balanced, 1000, 1.0),
            raw_locations_enabled: false,
            constant_location_engine_resolution: None,
            routing_profile: RoutingProfile::Driving,
            work_retry_delay_ms: 200,
            presence_subscribe_timeout_ms: 5000,
            presence_retry_delay_ms: 15_000,
            presence_retry_limit: 10,
            max_publish_retries: 1,
            max_skipped_locations: 60,
            location_stream_capacity: 64,
        }
    }
}

impl PublisherConfig {
    pub fn work_retry_delay(&self) -> Duration {
        Duration::from_millis(self.work_retry_delay_ms)
    }

    pub fn presence_subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_subscribe_timeout_ms)
    }

    pub fn presence_retry_delay(&self) -> Duration {
        Duration::from_millis(self.presence_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config: PublisherConfig =
            serde_json::from_str(r#"{"raw_locations_enabled": true, "work_retry_delay_ms": 50}"#).unwrap();
        assert!(config.raw_locations_enabled);
        assert_eq!(config.work_retry_delay(), Duration::from_millis(50));
        assert_eq!(config.max_skipped_locations, 60);
        assert_eq!(config.default_resolution.accuracy, Accuracy::Balanced);
    }
}
