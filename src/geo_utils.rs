//! # Geographic Utilities
//!
//! Great-circle distance helpers used by the track filter and route metrics.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two route points |
//! | [`polyline_length`] | Total length of a route in meters |
//!
//! ## Example
//!
//! ```rust
//! use route_capture::{RoutePoint, geo_utils};
//!
//! let track = vec![
//!     RoutePoint::new(51.5074, -0.1278, 0),
//!     RoutePoint::new(51.5080, -0.1290, 10_000),
//!     RoutePoint::new(51.5090, -0.1300, 20_000),
//! ];
//!
//! let length = geo_utils::polyline_length(&track);
//! println!("Track length: {:.0}m", length);
//! ```
//!
//! ## Algorithm Notes
//!
//! The haversine formula calculates the great-circle distance between two points
//! on a sphere using the mean Earth radius. All inputs are WGS84 degrees.
//!
//! Reference: [Haversine formula (Wikipedia)](https://en.wikipedia.org/wiki/Haversine_formula)

use geo::{Distance, Haversine, Point};
use crate::RoutePoint;

/// Calculate the great-circle distance between two route points in meters.
///
/// Timestamps are ignored.
///
/// # Example
///
/// ```rust
/// use route_capture::{RoutePoint, geo_utils};
///
/// let london = RoutePoint::new(51.5074, -0.1278, 0);
/// let paris = RoutePoint::new(48.8566, 2.3522, 0);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: &RoutePoint, p2: &RoutePoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Calculate the total length of a route in meters.
///
/// Sums the haversine distance between consecutive points. Empty or single-point
/// routes return 0.0.
pub fn polyline_length(points: &[RoutePoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

// =============================================================================
// Unit Tests
// =============================================================================
