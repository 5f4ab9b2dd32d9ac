//! Great-circle distance and segment kinematics.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use crate::telemetry::presence::{Coordinates, GpsPosition};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in metres.
#[must_use]
pub fn haversine_m(a: Coordinates, b: Coordinates) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Sum of distances between consecutive positions, in input order.
#[must_use]
pub fn path_length_m(positions: &[GpsPosition]) -> f64 {
    positions
        .windows(2)
        .map(|pair| haversine_m(pair[0].coordinates(), pair[1].coordinates()))
        .sum()
}

/// Seconds between the first and last position.
#[must_use]
pub fn elapsed_secs(positions: &[GpsPosition]) -> f64 {
    match (positions.first(), positions.last()) {
        (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0,
        _ => 0.0,
    }
}

/// Mean of the reported speeds, ignoring positions without one.
#[must_use]
pub fn mean_reported_speed(positions: &[GpsPosition]) -> Option<f64> {
    let speeds: Vec<f64> = positions.iter().filter_map(|p| p.speed_kmh).collect();
    if speeds.is_empty() {
        None
    } else {
        Some(speeds.iter().sum::<f64>() / speeds.len() as f64)
    }
}
