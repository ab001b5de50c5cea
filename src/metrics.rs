//! Route metrics: distance, duration and display formatting.
//!
//! All functions are pure and stateless.

use serde::{Deserialize, Serialize};

use crate::geo_utils::polyline_length;
use crate::{RouteDraft, RoutePoint};

/// Total route distance in meters, rounded to the nearest meter.
///
/// Returns 0 for fewer than 2 points.
///
/// # Example
/// ```
/// use route_capture::{RoutePoint, metrics};
///
/// let points = vec![
///     RoutePoint::new(51.50, -0.12, 0),
///     RoutePoint::new(51.51, -0.12, 60_000),
/// ];
/// let meters = metrics::total_distance_meters(&points);
/// assert!((meters as i64 - 1112).abs() <= 1);
/// ```
pub fn total_distance_meters(points: &[RoutePoint]) -> u64 {
    polyline_length(points).round() as u64
}

/// Time between the first and last point in milliseconds (0 for fewer than 2 points).
pub fn duration_ms(points: &[RoutePoint]) -> i64 {
    match (points.first(), points.last()) {
        (Some(first), Some(last)) if points.len() > 1 => (last.timestamp - first.timestamp).max(0),
        _ => 0,
    }
}

/// Format a distance for display: whole meters below 1 km, otherwise
/// kilometers with one decimal place.
///
/// ```
/// use route_capture::metrics::format_distance;
/// assert_eq!(format_distance(999), "999m");
/// assert_eq!(format_distance(1000), "1.0km");
/// ```
pub fn format_distance(meters: u64) -> String {
    if meters < 1000 {
        format!("{}m", meters)
    } else {
        format!("{:.1}km", meters as f64 / 1000.0)
    }
}

/// Format a duration as `MM:SS`, or `H:MM:SS` once it reaches an hour.
///
/// ```
/// use route_capture::metrics::format_duration;
/// assert_eq!(format_duration(65_000), "01:05");
/// assert_eq!(format_duration(3_725_000), "1:02:05");
/// ```
pub fn format_duration(milliseconds: i64) -> String {
    let total_seconds = milliseconds.max(0) / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// One coordinate of the stored route polyline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteCoordinate {
    pub lat: f64,
    pub lng: f64,
    /// Milliseconds since the Unix epoch
    pub t: i64,
}

/// Structured route field attached to a published drive record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteData {
    pub coordinates: Vec<RouteCoordinate>,
    pub distance_meters: u64,
    pub duration_seconds: i64,
}

impl RouteData {
    /// Build route data from recorded points.
    ///
    /// Returns `None` for fewer than 2 points; such routes are published
    /// without a route field.
    pub fn from_points(points: &[RoutePoint]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }

        Some(Self {
            coordinates: points
                .iter()
                .map(|p| RouteCoordinate { lat: p.latitude, lng: p.longitude, t: p.timestamp })
                .collect(),
            distance_meters: total_distance_meters(points),
            duration_seconds: (duration_ms(points) as f64 / 1000.0).round() as i64,
        })
    }
}

/// Live recording stats shown while a drive is in progress.
///
/// Recomputed from the persisted draft rather than accumulated, so the values
/// are the same after an app relaunch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveStats {
    pub elapsed_ms: i64,
    pub distance_meters: u64,
    pub point_count: usize,
}

impl LiveStats {
    pub fn from_draft(draft: &RouteDraft, now_ms: i64) -> Self {
        Self {
            elapsed_ms: (now_ms - draft.started_at).max(0),
            distance_meters: total_distance_meters(&draft.points),
            point_count: draft.points.len(),
        }
    }

    pub fn elapsed_display(&self) -> String {
        format_duration(self.elapsed_ms)
    }

    pub fn distance_display(&self) -> String {
        format_distance(self.distance_meters)
    }
}
