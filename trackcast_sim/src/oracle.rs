//! Ground truth oracle for simulation.
//!
//! The oracle owns the "God's eye view" of one trip:
//! - The true position of the tracked asset
//! - Kinematics (straight line towards the destination at constant speed)
//! - Sensor samples generated from the truth with Gaussian noise
//!
//! Positions move on a local flat-earth approximation, which is accurate to
//! well under a meter over the few kilometers a scenario covers.

use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use trackcast_core::proximity::distance_to_destination;
use trackcast_env::{Destination, Location};

/// RNG stream used for sensor noise.
pub const ORACLE_RNG_STREAM: u64 = 0x6f72_6163;

const METERS_PER_DEGREE: f64 = 111_320.0;

/// One tick of sensor output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripSample {
    /// Noise-free position
    pub truth: Location,

    /// What the GNSS chip reports
    pub raw: Location,

    /// What the map-matcher reports
    pub enhanced: Location,
}

/// Ground truth of one trip.
pub struct TripOracle {
    /// RNG for sensor noise (separate from the network stream)
    rng: ChaCha8Rng,

    latitude: f64,
    longitude: f64,
    destination: Destination,

    /// Speed in m/s
    speed: f64,

    raw_noise: Option<Normal<f64>>,
    enhanced_noise: Option<Normal<f64>>,
}

impl TripOracle {
    /// Creates a trip from `start` towards `destination`.
    pub fn new(rng: ChaCha8Rng, start: Destination, destination: Destination, speed: f64) -> Self {
        Self {
            rng,
            latitude: start.latitude,
            longitude: start.longitude,
            destination,
            speed: speed.max(0.0),
            raw_noise: Normal::new(0.0, 3.0).ok(), // 3m GNSS noise by default
            enhanced_noise: Normal::new(0.0, 0.5).ok(),
        }
    }

    /// Sets the noise standard deviations in meters. Zero disables noise.
    pub fn with_noise(mut self, raw_std: f64, enhanced_std: f64) -> Self {
        self.raw_noise = (raw_std > 0.0).then(|| Normal::new(0.0, raw_std).ok()).flatten();
        self.enhanced_noise = (enhanced_std > 0.0).then(|| Normal::new(0.0, enhanced_std).ok()).flatten();
        self
    }

    /// Advances the asset by `dt` seconds, stopping at the destination.
    pub fn step(&mut self, dt: f64) {
        let remaining = self.remaining_meters();
        if remaining <= f64::EPSILON {
            return;
        }
        let travel = (self.speed * dt).min(remaining);
        let fraction = travel / remaining;
        self.latitude += (self.destination.latitude - self.latitude) * fraction;
        self.longitude += (self.destination.longitude - self.longitude) * fraction;
    }

    /// Samples the sensors at `time_ms` (milliseconds since the Unix epoch).
    pub fn sample(&mut self, time_ms: i64) -> TripSample {
        let truth = self.truth(time_ms);
        let raw = Self::perturb(truth, self.raw_noise.as_ref(), &mut self.rng);
        let enhanced = Self::perturb(truth, self.enhanced_noise.as_ref(), &mut self.rng);
        TripSample { truth, raw, enhanced }
    }

    pub fn truth(&self, time_ms: i64) -> Location {
        let mut location = Location::new(self.latitude, self.longitude, time_ms);
        location.speed = self.speed as f32;
        location
    }

    /// Meters left to the destination (flat-earth).
    pub fn remaining_meters(&self) -> f64 {
        let north = (self.destination.latitude - self.latitude) * METERS_PER_DEGREE;
        let east = (self.destination.longitude - self.longitude) * METERS_PER_DEGREE * self.latitude.to_radians().cos();
        north.hypot(east)
    }

    /// Geodesic meters left to the destination.
    pub fn geodesic_remaining(&self) -> f64 {
        distance_to_destination(&self.truth(0), &self.destination)
    }

    pub fn has_arrived(&self) -> bool {
        self.remaining_meters() < 0.5
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    fn perturb(truth: Location, noise: Option<&Normal<f64>>, rng: &mut ChaCha8Rng) -> Location {
        let Some(normal) = noise else {
            return truth;
        };
        let north = normal.sample(rng);
        let east = normal.sample(rng);
        let mut location = truth;
        location.latitude += north / METERS_PER_DEGREE;
        location.longitude += east / (METERS_PER_DEGREE * truth.latitude.to_radians().cos());
        location.accuracy = normal.std_dev() as f32;
        location
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn oracle(seed: u64) -> TripOracle {
        TripOracle::new(
            ChaCha8Rng::seed_from_u64(seed),
            Destination::new(51.5, -0.12),
            Destination::new(51.509, -0.12),
            10.0,
        )
    }

    #[test]
    fn test_trip_moves_at_speed() {
        let mut trip = oracle(42);
        let start = trip.remaining_meters();
        trip.step(10.0);
        let travelled = start - trip.remaining_meters();
        assert!((travelled - 100.0).abs() < 0.01, "travelled {travelled}");
    }

    #[test]
    fn test_trip_stops_at_destination() {
        let mut trip = oracle(42);
        for _ in 0..200 {
            trip.step(1.0);
        }
        assert!(trip.has_arrived());
        assert!(trip.geodesic_remaining() < 1.0);

        let before = trip.truth(0);
        trip.step(1.0);
        assert_eq!(trip.truth(0), before);
    }

    #[test]
    fn test_samples_are_deterministic() {
        let mut a = oracle(7);
        let mut b = oracle(7);
        assert_eq!(a.sample(1_000), b.sample(1_000));

        let mut c = oracle(8);
        assert_ne!(a.sample(2_000).raw, c.sample(2_000).raw);
    }

    #[test]
    fn test_noise_can_be_disabled() {
        let mut trip = oracle(1).with_noise(0.0, 0.0);
        let sample = trip.sample(5);
        assert_eq!(sample.raw, sample.truth);
        assert_eq!(sample.enhanced, sample.truth);
    }
}
