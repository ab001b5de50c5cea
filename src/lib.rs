//! # Route Capture
//!
//! Background GPS route recording with crash-safe drafts and an offline-first
//! publish queue.
//!
//! This library provides:
//! - Filtering of raw location fixes into a clean route polyline
//! - Durable, crash-safe persistence of the in-progress route
//! - A recording session state machine that can be rebuilt after relaunch
//! - A publish pipeline that falls back to a durable upload queue when offline
//!
//! ## Features
//!
//! - **`http`** - Enable the HTTP backend (PostgREST inserts + Storage uploads)
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_capture::{RawFix, RouteDraft, TrackFilterConfig, filter_batch, metrics};
//!
//! let draft = RouteDraft::new(0);
//! let fixes = vec![
//!     RawFix::new(51.5074, -0.1278, 0),
//!     RawFix::new(51.5084, -0.1278, 20_000), // ~111m north
//! ];
//!
//! let accepted = filter_batch(&draft, &fixes, &TrackFilterConfig::default());
//! assert_eq!(accepted.len(), 2);
//!
//! let meters = metrics::total_distance_meters(&accepted);
//! println!("Recorded {}", metrics::format_distance(meters));
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod error;
pub use error::{CaptureError, UserAction, ValidationError};

pub mod geo_utils;

// Distance/duration computation and display formatting
pub mod metrics;
pub use metrics::{LiveStats, RouteCoordinate, RouteData};

pub mod track_filter;
pub use track_filter::{filter_batch, TrackFilterConfig};

// Local durable storage
pub mod storage;
pub use storage::{FileKvStore, KeyValueStore};

pub mod draft_store;
pub use draft_store::DraftStore;

// Platform location service + background task registration
pub mod sampler;
pub use sampler::{
    define_location_task, dispatch_location_event, handle_location_batch, Accuracy, ActivityType,
    GeoSampler, LocationProvider, SamplerOptions, BACKGROUND_LOCATION_TASK,
};

pub mod session;
pub use session::{ElapsedTicker, RecordingSession, SessionState};

pub mod photos;
pub use photos::{JpegCompressor, PhotoCompressor, PhotoStash};

pub mod backend;
pub use backend::{Backend, Connectivity, NewDrive, NewDriveStop};

// HTTP backend against PostgREST + Storage
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{BackendConfig, HttpBackend};

pub mod publish;
pub use publish::{DriveTag, PublishConfig, PublishInput, PublishOutcome, PublishReport, Publisher, Stop};

pub mod upload_queue;
pub use upload_queue::{DrainReport, PendingUpload, QueueDrainer, UploadQueue};

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RouteCaptureRust")
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A recorded route point.
///
/// Immutable once created. Within any route, points are ordered by
/// `timestamp` ascending.
///
/// # Example
/// ```
/// use route_capture::RoutePoint;
/// let point = RoutePoint::new(51.5074, -0.1278, 1_700_000_000_000);
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl RoutePoint {
    /// Create a new route point.
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self { latitude, longitude, timestamp }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A raw location reading as delivered by the platform location service.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Horizontal accuracy in meters, if the platform reports it
    pub accuracy: Option<f64>,
}

impl RawFix {
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self { latitude, longitude, timestamp, accuracy: None }
    }

    /// The route point this fix becomes once accepted.
    pub fn to_point(&self) -> RoutePoint {
        RoutePoint::new(self.latitude, self.longitude, self.timestamp)
    }
}

/// The in-progress (or finished but unpublished) recording.
///
/// Exactly one draft exists at a time. It is created empty when recording
/// starts and only ever grows by appending accepted points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RouteDraft {
    /// Milliseconds since the Unix epoch
    pub started_at: i64,
    pub points: Vec<RoutePoint>,
}

impl RouteDraft {
    /// Create an empty draft.
    pub fn new(started_at: i64) -> Self {
        Self { started_at, points: Vec::new() }
    }

    /// Last recorded point, if any.
    pub fn last_point(&self) -> Option<&RoutePoint> {
        self.points.last()
    }

    /// A route needs at least two points to be publishable.
    pub fn is_usable(&self) -> bool {
        self.points.len() >= 2
    }
}

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }
}

// ============================================================================
// FFI Exports (only compiled with "ffi" feature)
// ============================================================================

#[cfg(feature = "ffi")]
mod ffi {
    use super::*;
    use log::{info, warn};
    use std::future::Future;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// Run an async operation to completion on a short-lived runtime.
    fn block_on<F: Future>(future: F) -> Option<F::Output> {
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => Some(rt.block_on(future)),
            Err(e) => {
                warn!("[RouteCaptureRust] Failed to create tokio runtime: {}", e);
                None
            }
        }
    }

    fn draft_store(data_dir: &str) -> DraftStore<FileKvStore> {
        DraftStore::new(FileKvStore::new(PathBuf::from(data_dir)))
    }

    /// Register the background location handler.
    ///
    /// Call this at process start, before any UI is shown: the OS may relaunch
    /// the app purely to deliver a location batch.
    #[uniffi::export]
    pub fn init_capture(data_dir: String) -> bool {
        init_logging();
        let defined = define_location_task(Arc::new(draft_store(&data_dir)), TrackFilterConfig::default());
        info!("[RouteCaptureRust] init_capture({}) defined={}", data_dir, defined);
        defined
    }

    /// Deliver a batch of fixes from the platform location task.
    /// Returns the number of points appended to the draft.
    #[uniffi::export]
    pub fn on_location_batch(fixes: Vec<RawFix>) -> u32 {
        init_logging();
        block_on(dispatch_location_event(Ok(fixes))).unwrap_or(0) as u32
    }

    /// Report a delivery error from the platform location task.
    #[uniffi::export]
    pub fn on_location_error(message: String) {
        init_logging();
        block_on(dispatch_location_event(Err(message)));
    }

    #[uniffi::export]
    pub fn load_route_draft(data_dir: String) -> Option<RouteDraft> {
        init_logging();
        match block_on(draft_store(&data_dir).load())? {
            Ok(draft) => draft,
            Err(e) => {
                warn!("[RouteCaptureRust] load_route_draft failed: {}", e);
                None
            }
        }
    }

    #[uniffi::export]
    pub fn clear_route_draft(data_dir: String) -> bool {
        init_logging();
        matches!(block_on(draft_store(&data_dir).clear()), Some(Ok(())))
    }

    #[uniffi::export]
    pub fn route_distance_meters(points: Vec<RoutePoint>) -> u64 {
        metrics::total_distance_meters(&points)
    }

    #[uniffi::export]
    pub fn format_route_distance(meters: u64) -> String {
        metrics::format_distance(meters)
    }

    #[uniffi::export]
    pub fn format_route_duration(milliseconds: i64) -> String {
        metrics::format_duration(milliseconds)
    }

    /// Number of publishes waiting for connectivity.
    #[uniffi::export]
    pub fn pending_upload_count(data_dir: String) -> u32 {
        init_logging();
        let queue = UploadQueue::new(
            FileKvStore::new(PathBuf::from(&data_dir)),
            PhotoStash::in_data_dir(PathBuf::from(&data_dir)),
        );
        match block_on(queue.pending_count()) {
            Some(Ok(count)) => count as u32,
            Some(Err(e)) => {
                warn!("[RouteCaptureRust] pending_upload_count failed: {}", e);
                0
            }
            None => 0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
