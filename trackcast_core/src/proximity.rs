//! Geodesic distance and proximity threshold evaluation.
//!
//! Distances use Vincenty's inverse formula on the WGS84 ellipsoid,
//! iterating at most 20 times and stopping once the relative change in
//! longitude on the auxiliary sphere drops below 1e-12.

use crate::model::Proximity;
use geo::Point;
use trackcast_env::{Destination, Location};

/// WGS84 semi-major axis (meters)
const WGS84_A: f64 = 6_378_137.0;

/// WGS84 flattening
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Iteration bound for the proximity check. `geo::VincentyDistance` iterates
/// up to 200 times and errors on non-convergence, so it is not a drop-in
/// replacement here.
const MAX_ITERATIONS: usize = 20;
const CONVERGENCE: f64 = 1.0e-12;

/// Surface distance in meters between two `(lon, lat)` points in degrees.
pub fn vincenty_distance(from: Point<f64>, to: Point<f64>) -> f64 {
    let b = (1.0 - WGS84_F) * WGS84_A;

    let l = (to.x() - from.x()).to_radians();
    let u1 = ((1.0 - WGS84_F) * from.y().to_radians().tan()).atan();
    let u2 = ((1.0 - WGS84_F) * to.y().to_radians().tan()).atan();
    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    let mut lambda = l;
    let mut sin_sigma = 0.0;
    let mut cos_sigma = 1.0;
    let mut sigma = 0.0;
    let mut cos_sq_alpha = 1.0;
    let mut cos_2sigma_m = 0.0;

    for _ in 0..MAX_ITERATIONS {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        let t1 = cos_u2 * sin_lambda;
        let t2 = cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda;
        sin_sigma = (t1 * t1 + t2 * t2).sqrt();
        if sin_sigma == 0.0 {
            // Coincident points
            return 0.0;
        }
        cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
        cos_2sigma_m = if cos_sq_alpha != 0.0 {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        } else {
            // Equatorial line
            0.0
        };
        let c = WGS84_F / 16.0 * cos_sq_alpha * (4.0 + WGS84_F * (4.0 - 3.0 * cos_sq_alpha));
        let previous = lambda;
        lambda = l
            + (1.0 - c)
                * WGS84_F
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)));

        let delta = lambda - previous;
        if delta == 0.0 || (delta / lambda).abs() < CONVERGENCE {
            break;
        }
    }

    let u_sq = cos_sq_alpha * (WGS84_A * WGS84_A - b * b) / (b * b);
    let big_a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
    let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
    let delta_sigma = big_b
        * sin_sigma
        * (cos_2sigma_m
            + big_b / 4.0
                * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)
                    - big_b / 6.0
                        * cos_2sigma_m
                        * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                        * (-3.0 + 4.0 * cos_2sigma_m * cos_2sigma_m)));

    b * big_a * (sigma - delta_sigma)
}

fn point_of(location: &Location) -> Point<f64> {
    Point::new(location.longitude, location.latitude)
}

/// Meters between two locations.
pub fn distance_between(a: &Location, b: &Location) -> f64 {
    vincenty_distance(point_of(a), point_of(b))
}

/// Meters from a location to a destination.
pub fn distance_to_destination(location: &Location, destination: &Destination) -> f64 {
    vincenty_distance(
        point_of(location),
        Point::new(destination.longitude, destination.latitude),
    )
}

/// Evaluates a proximity threshold for the active trackable.
///
/// Spatial and temporal halves compose with OR. A half is skipped (treated
/// as not reached) when its bound or its input is missing.
pub fn is_threshold_reached(
    threshold: &Proximity,
    current: &Location,
    now_ms: i64,
    destination: Option<&Destination>,
    estimated_arrival_ms: Option<i64>,
) -> bool {
    let spatial = match (threshold.spatial, destination) {
        (Some(meters), Some(destination)) => distance_to_destination(current, destination) < meters,
        _ => false,
    };
    let temporal = match (threshold.temporal, estimated_arrival_ms) {
        (Some(millis), Some(eta)) => eta - now_ms < millis,
        _ => false,
    };
    spatial || temporal
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::VincentyDistance;

    #[test]
    fn test_coincident_points_are_zero() {
        let p = Point::new(-0.1246, 51.5007);
        assert_eq!(vincenty_distance(p, p), 0.0);
    }

    #[test]
    fn test_flinders_peak_to_buninyong() {
        // Reference line from Vincenty's 1975 paper
        let flinders = Point::new(144.0 + 25.0 / 60.0 + 29.52440 / 3600.0, -(37.0 + 57.0 / 60.0 + 3.72030 / 3600.0));
        let buninyong = Point::new(143.0 + 55.0 / 60.0 + 35.38390 / 3600.0, -(37.0 + 39.0 / 60.0 + 10.15610 / 3600.0));
        assert_relative_eq!(vincenty_distance(flinders, buninyong), 54_972.271, epsilon = 0.01);
    }

    #[test]
    fn test_matches_geo_vincenty() {
        let pairs = [
            (Point::new(0.0, 0.0), Point::new(1.0, 1.0)),
            (Point::new(-0.1246, 51.5007), Point::new(2.2945, 48.8584)),
            (Point::new(139.6917, 35.6895), Point::new(-122.4194, 37.7749)),
            (Point::new(10.0, 10.0), Point::new(10.0, 20.0)),
        ];
        for (a, b) in pairs {
            let expected = a.vincenty_distance(&b).unwrap();
            assert_relative_eq!(vincenty_distance(a, b), expected, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_nearly_antipodal_points_stay_bounded() {
        // Slow to converge; the iteration bound still yields a usable distance
        let distance = vincenty_distance(Point::new(0.0, 0.0), Point::new(179.5, 0.5));
        assert!(distance.is_finite());
        assert!(distance > 0.0);
    }

    #[test]
    fn test_spatial_threshold() {
        let threshold = Proximity::spatial(100.0);
        let destination = Destination::new(51.5007, -0.1246);
        let near = Location::new(51.5010, -0.1246, 0);
        let far = Location::new(51.6, -0.1246, 0);

        assert!(is_threshold_reached(&threshold, &near, 0, Some(&destination), None));
        assert!(!is_threshold_reached(&threshold, &far, 0, Some(&destination), None));
        assert!(!is_threshold_reached(&threshold, &near, 0, None, None));
    }

    #[test]
    fn test_temporal_threshold() {
        let threshold = Proximity::temporal(500);
        let anywhere = Location::new(1.0, 1.0, 0);
        let now = 1_700_000_000_000;

        assert!(is_threshold_reached(&threshold, &anywhere, now, None, Some(now + 300)));
        assert!(!is_threshold_reached(&threshold, &anywhere, now, None, Some(now + 1000)));
        assert!(!is_threshold_reached(&threshold, &anywhere, now, None, None));
    }

    #[test]
    fn test_either_half_reaches_threshold() {
        let threshold = Proximity {
            spatial: Some(1000.0),
            temporal: Some(500),
        };
        let destination = Destination::new(1.0, 1.0);
        let near = Location::new(1.001, 1.001, 0);
        let far = Location::new(20.0, 20.0, 0);
        let now = 1_000_000;

        assert!(is_threshold_reached(&threshold, &near, now, Some(&destination), Some(now + 1500)));
        assert!(is_threshold_reached(&threshold, &far, now, Some(&destination), Some(now + 300)));
        assert!(!is_threshold_reached(&threshold, &far, now, Some(&destination), Some(now + 1500)));
    }
}
