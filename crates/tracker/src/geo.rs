//! Great-circle distance on a spherical earth.
//!
//! Flat-plane distance drifts by tens of meters over multi-kilometer
//! routes, enough to mis-trigger a 500 m threshold, so all proximity
//! math goes through the Haversine formula.

use crate::types::Position;
use geo::{HaversineDistance, Point};

/// Haversine distance between two positions in meters.
pub fn distance_m(a: Position, b: Position) -> f64 {
    // geo::Point is (x, y) = (lon, lat)
    let pa = Point::new(a.lon, a.lat);
    let pb = Point::new(b.lon, b.lat);
    pa.haversine_distance(&pb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_distance() {
        // NYC to LA is roughly 3,936 km
        let nyc = Position::new(40.7128, -74.0060);
        let la = Position::new(34.0522, -118.2437);
        let d = distance_m(nyc, la);
        assert!((d - 3_936_000.0).abs() < 50_000.0);
    }

    #[test]
    fn test_zero_distance() {
        let p = Position::new(9.0325, 38.7469);
        assert!(distance_m(p, p) < 1.0);
    }

    #[test]
    fn test_small_offset() {
        // 0.0025 degrees of latitude is about 278 m
        let a = Position::new(9.0300, 38.7469);
        let b = Position::new(9.0325, 38.7469);
        let d = distance_m(a, b);
        assert!((d - 278.0).abs() < 5.0);
    }
}
