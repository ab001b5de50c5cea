//! Track filter: decides which raw fixes become route points.
//!
//! A fix is accepted when it is far enough from the last accepted point
//! (real movement) **or** enough time has passed since it (at least one
//! point per gap interval, so a route keeps going through tunnels and
//! while stationary instead of silently truncating).
//!
//! The platform's own distance pre-filter only reduces delivery volume;
//! acceptance is decided here.

use log::debug;

use crate::geo_utils::haversine_distance;
use crate::{RawFix, RouteDraft, RoutePoint};

/// Configuration for the track filter.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct TrackFilterConfig {
    /// Minimum distance from the last accepted point to accept a fix.
    /// Default: 50.0 meters
    pub min_distance_meters: f64,

    /// Maximum time without an accepted point; a fix this long after the
    /// last accepted point is accepted regardless of distance.
    /// Default: 60,000 ms
    pub max_gap_ms: i64,
}

impl Default for TrackFilterConfig {
    fn default() -> Self {
        Self {
            min_distance_meters: 50.0,
            max_gap_ms: 60_000,
        }
    }
}

/// Select the fixes from `fixes` that should be appended to `draft`, in order.
///
/// The cursor starts at the draft's last point. For an empty draft the first
/// valid fix is accepted and becomes the cursor. Fixes with invalid
/// coordinates, or timestamps earlier than the cursor, are dropped so the
/// route's timestamps never decrease.
///
/// # Example
/// ```
/// use route_capture::{RawFix, RouteDraft, TrackFilterConfig, filter_batch};
///
/// let draft = RouteDraft::new(0);
/// let fixes = vec![
///     RawFix::new(51.50000, -0.12, 0),
///     RawFix::new(51.50004, -0.12, 10_000), // ~5m, 10s: rejected
///     RawFix::new(51.50008, -0.12, 70_000), // ~9m, 70s: accepted on time
/// ];
///
/// let accepted = filter_batch(&draft, &fixes, &TrackFilterConfig::default());
/// assert_eq!(accepted.len(), 2);
/// ```
pub fn filter_batch(draft: &RouteDraft, fixes: &[RawFix], config: &TrackFilterConfig) -> Vec<RoutePoint> {
    let mut cursor: Option<RoutePoint> = draft.last_point().copied();
    let mut accepted = Vec::new();

    for fix in fixes {
        let candidate = fix.to_point();
        if !candidate.is_valid() {
            debug!("[TrackFilter] Dropping invalid fix ({}, {})", fix.latitude, fix.longitude);
            continue;
        }

        let keep = match cursor {
            None => true,
            Some(last) => should_accept(&last, &candidate, config),
        };

        if keep {
            accepted.push(candidate);
            cursor = Some(candidate);
        }
    }

    debug!("[TrackFilter] Accepted {}/{} fixes", accepted.len(), fixes.len());
    accepted
}

/// The dual distance/time rule against the last accepted point.
fn should_accept(last: &RoutePoint, candidate: &RoutePoint, config: &TrackFilterConfig) -> bool {
    // Timestamps come from the platform unchecked; saturate instead of overflowing
    let elapsed = candidate.timestamp.saturating_sub(last.timestamp);
    if elapsed < 0 {
        return false;
    }

    elapsed >= config.max_gap_ms || haversine_distance(last, candidate) >= config.min_distance_meters
}

#[cfg(test)]
mod tests {
    use super::*;

    // ~1.11m per 0.00001 degrees of latitude
    const DEG_PER_METER: f64 = 1.0 / 111_195.0;

    fn fix_at(meters_north: f64, t: i64) -> RawFix {
        RawFix::new(51.5 + meters_north * DEG_PER_METER, -0.12, t)
    }

    #[test]
    fn test_first_fix_accepted_for_empty_draft() {
        let accepted = filter_batch(&RouteDraft::new(0), &[fix_at(0.0, 0)], &TrackFilterConfig::default());
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn test_tunnel_scenario() {
        let t0 = 1_700_000_000_000;
        let fixes = vec![
            fix_at(0.0, t0),
            fix_at(5.0, t0 + 10_000),
            fix_at(5.0, t0 + 70_000),
        ];
        let accepted = filter_batch(&RouteDraft::new(t0), &fixes, &TrackFilterConfig::default());
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].timestamp, t0);
        assert_eq!(accepted[1].timestamp, t0 + 70_000);
    }

    #[test]
    fn test_distance_threshold_accepts_movement() {
        let fixes = vec![fix_at(0.0, 0), fix_at(49.0, 1_000), fix_at(60.0, 2_000)];
        let accepted = filter_batch(&RouteDraft::new(0), &fixes, &TrackFilterConfig::default());
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[1].timestamp, 2_000);
    }

    #[test]
    fn test_cursor_starts_from_existing_draft() {
        let mut draft = RouteDraft::new(0);
        draft.points.push(fix_at(0.0, 0).to_point());

        // Close to the stored point and soon after it: rejected
        let accepted = filter_batch(&draft, &[fix_at(10.0, 5_000)], &TrackFilterConfig::default());
        assert!(accepted.is_empty());

        let accepted = filter_batch(&draft, &[fix_at(10.0, 60_000)], &TrackFilterConfig::default());
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn test_out_of_order_and_invalid_fixes_dropped() {
        let mut draft = RouteDraft::new(0);
        draft.points.push(fix_at(0.0, 100_000).to_point());

        let fixes = vec![
            fix_at(500.0, 50_000),                 // far but older than the cursor
            RawFix::new(f64::NAN, -0.12, 200_000), // invalid
            fix_at(500.0, 110_000),
        ];
        let accepted = filter_batch(&draft, &fixes, &TrackFilterConfig::default());
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].timestamp, 110_000);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let config = TrackFilterConfig::default();

        let mut draft = RouteDraft::new(0);
        draft.points.push(fix_at(0.0, i64::MAX).to_point());
        assert!(filter_batch(&draft, &[fix_at(500.0, i64::MIN)], &config).is_empty());

        let mut draft = RouteDraft::new(0);
        draft.points.push(fix_at(0.0, i64::MIN).to_point());
        let accepted = filter_batch(&draft, &[fix_at(0.0, i64::MAX)], &config);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].timestamp, i64::MAX);
    }

    #[test]
    fn test_accepted_points_always_meet_a_threshold() {
        let config = TrackFilterConfig::default();
        // Deterministic pseudo-random walk
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..50 {
            let mut meters = 0.0;
            let mut t = 0;
            let fixes: Vec<RawFix> = (0..200)
                .map(|_| {
                    meters += (next() % 40) as f64;
                    t += (next() % 30_000) as i64;
                    fix_at(meters, t)
                })
                .collect();

            let accepted = filter_batch(&RouteDraft::new(0), &fixes, &config);
            for pair in accepted.windows(2) {
                let dist = haversine_distance(&pair[0], &pair[1]);
                let gap = pair[1].timestamp - pair[0].timestamp;
                assert!(gap >= 0);
                assert!(
                    dist >= config.min_distance_meters || gap >= config.max_gap_ms,
                    "accepted {}m / {}ms apart",
                    dist,
                    gap
                );
            }
        }
    }
}
