//! Geo sampler: continuous background location delivery.
//!
//! Platform location services are abstracted behind [`LocationProvider`]
//! (one implementation per target). Delivered batches are handled by a
//! process-wide task registered with [`define_location_task`], which must
//! run at process start: the OS can relaunch a terminated app purely to
//! deliver a batch, before any UI exists.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use log::{debug, error, info, warn};

use crate::draft_store::DraftStore;
use crate::storage::{FileKvStore, KeyValueStore};
use crate::track_filter::{filter_batch, TrackFilterConfig};
use crate::{CaptureError, RawFix};

/// Name under which the background location task is registered with the OS.
pub const BACKGROUND_LOCATION_TASK: &str = "ROUTE_CAPTURE_BACKGROUND_LOCATION";

/// Requested positioning accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum Accuracy {
    Lowest,
    Low,
    Balanced,
    High,
    Highest,
}

/// Hint to the platform about what the user is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum ActivityType {
    Other,
    AutomotiveNavigation,
    Fitness,
    OtherNavigation,
}

/// Parameters passed to the platform when location updates start.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct SamplerOptions {
    /// Default: Balanced
    pub accuracy: Accuracy,
    /// Coarse OS-level movement pre-filter, used only to save battery.
    /// Default: 20.0 meters
    pub distance_interval_meters: f64,
    /// Minimum interval between batched deliveries.
    /// Default: 30,000 ms
    pub deferred_updates_interval_ms: u64,
    /// Default: AutomotiveNavigation
    pub activity_type: ActivityType,
    /// Must stay false: a parked car in traffic is not the end of a drive.
    pub pauses_updates_automatically: bool,
    /// Show the system background-location indicator while active.
    pub shows_background_indicator: bool,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            accuracy: Accuracy::Balanced,
            distance_interval_meters: 20.0,
            deferred_updates_interval_ms: 30_000,
            activity_type: ActivityType::AutomotiveNavigation,
            pauses_updates_automatically: false,
            shows_background_indicator: true,
        }
    }
}

/// Platform location service.
///
/// `has_started_location_updates` must reflect OS registration state, not an
/// in-memory flag, so it stays correct across relaunches.
pub trait LocationProvider: Send + Sync {
    fn request_foreground_permission(&self) -> impl Future<Output = bool> + Send;

    fn request_background_permission(&self) -> impl Future<Output = bool> + Send;

    fn start_location_updates(
        &self,
        task_name: &str,
        options: &SamplerOptions,
    ) -> impl Future<Output = Result<(), CaptureError>> + Send;

    fn stop_location_updates(&self, task_name: &str) -> impl Future<Output = Result<(), CaptureError>> + Send;

    fn has_started_location_updates(&self, task_name: &str) -> impl Future<Output = bool> + Send;
}

/// Starts, stops and queries background location sampling.
pub struct GeoSampler<P: LocationProvider> {
    provider: P,
    options: SamplerOptions,
}

impl<P: LocationProvider> GeoSampler<P> {
    pub fn new(provider: P) -> Self {
        Self::with_options(provider, SamplerOptions::default())
    }

    pub fn with_options(provider: P, options: SamplerOptions) -> Self {
        Self { provider, options }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Obtain foreground and then background ("always") authorization.
    /// Returns false if either is denied.
    pub async fn request_permission(&self) -> bool {
        if !self.provider.request_foreground_permission().await {
            info!("[GeoSampler] Foreground location permission denied");
            return false;
        }
        let granted = self.provider.request_background_permission().await;
        if !granted {
            info!("[GeoSampler] Background location permission denied");
        }
        granted
    }

    /// Begin continuous delivery. A no-op if already registered.
    pub async fn start(&self) -> Result<(), CaptureError> {
        if self.is_active().await {
            debug!("[GeoSampler] Already active");
            return Ok(());
        }
        self.provider
            .start_location_updates(BACKGROUND_LOCATION_TASK, &self.options)
            .await?;
        info!(
            "[GeoSampler] Started ({:?}, {}m pre-filter, {}ms batches)",
            self.options.accuracy, self.options.distance_interval_meters, self.options.deferred_updates_interval_ms
        );
        Ok(())
    }

    /// Cease delivery. Stopping an inactive sampler is a no-op.
    pub async fn stop(&self) -> Result<(), CaptureError> {
        if !self.is_active().await {
            return Ok(());
        }
        self.provider.stop_location_updates(BACKGROUND_LOCATION_TASK).await?;
        info!("[GeoSampler] Stopped");
        Ok(())
    }

    pub async fn is_active(&self) -> bool {
        self.provider.has_started_location_updates(BACKGROUND_LOCATION_TASK).await
    }
}

// ============================================================================
// Background delivery
// ============================================================================

/// Filter a delivered batch and append the accepted points to the draft.
///
/// If no draft exists the recording was stopped and the batch is discarded
/// (late deliveries must not resurrect it). Returns the number of points
/// appended.
pub async fn handle_location_batch<K: KeyValueStore>(
    drafts: &DraftStore<K>,
    fixes: &[RawFix],
    config: &TrackFilterConfig,
) -> Result<usize, CaptureError> {
    if fixes.is_empty() {
        return Ok(0);
    }

    match drafts.append_with(|draft| filter_batch(draft, fixes, config)).await? {
        Some(count) => Ok(count),
        None => {
            debug!("[GeoSampler] Dropping {} fix(es): no recording in progress", fixes.len());
            Ok(0)
        }
    }
}

struct LocationTask {
    drafts: Arc<DraftStore<FileKvStore>>,
    config: TrackFilterConfig,
}

static LOCATION_TASK: OnceLock<LocationTask> = OnceLock::new();

/// Register the process-wide background location handler.
///
/// Returns false if a handler was already registered (the first one wins).
pub fn define_location_task(drafts: Arc<DraftStore<FileKvStore>>, config: TrackFilterConfig) -> bool {
    LOCATION_TASK.set(LocationTask { drafts, config }).is_ok()
}

/// Entry point for OS location deliveries.
///
/// Never fails: delivery errors, an unregistered handler and storage
/// failures are logged and yield 0 appended points.
pub async fn dispatch_location_event(event: Result<Vec<RawFix>, String>) -> usize {
    let fixes = match event {
        Ok(fixes) => fixes,
        Err(message) => {
            error!("[GeoSampler] Background task error: {}", message);
            return 0;
        }
    };

    let Some(task) = LOCATION_TASK.get() else {
        warn!("[GeoSampler] Delivery of {} fix(es) before the location task was defined", fixes.len());
        return 0;
    };

    match handle_location_batch(&task.drafts, &fixes, &task.config).await {
        Ok(count) => count,
        Err(e) => {
            warn!("[GeoSampler] Failed to record batch: {}", e);
            0
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeProvider;
    use super::*;
    use crate::RouteDraft;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_permission_requires_both_grants() {
        let sampler = GeoSampler::new(FakeProvider::default());
        assert!(sampler.request_permission().await);

        sampler.provider().deny_background.store(true, Ordering::SeqCst);
        assert!(!sampler.request_permission().await);

        sampler.provider().deny_background.store(false, Ordering::SeqCst);
        sampler.provider().deny_foreground.store(true, Ordering::SeqCst);
        assert!(!sampler.request_permission().await);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let sampler = GeoSampler::new(FakeProvider::default());
        sampler.start().await.unwrap();
        sampler.start().await.unwrap();
        assert_eq!(sampler.provider().starts.load(Ordering::SeqCst), 1);
        assert!(sampler.is_active().await);

        sampler.stop().await.unwrap();
        sampler.stop().await.unwrap();
        assert_eq!(sampler.provider().stops.load(Ordering::SeqCst), 1);
        assert!(!sampler.is_active().await);
    }

    #[test]
    fn test_default_options() {
        let options = SamplerOptions::default();
        assert_eq!(options.accuracy, Accuracy::Balanced);
        assert_eq!(options.distance_interval_meters, 20.0);
        assert_eq!(options.deferred_updates_interval_ms, 30_000);
        assert_eq!(options.activity_type, ActivityType::AutomotiveNavigation);
        assert!(options.shows_background_indicator);
    }

    #[tokio::test]
    async fn test_batch_without_draft_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let drafts = DraftStore::new(FileKvStore::new(dir.path()));
        let fixes = vec![RawFix::new(51.5, -0.12, 0)];

        let appended = handle_location_batch(&drafts, &fixes, &TrackFilterConfig::default()).await.unwrap();
        assert_eq!(appended, 0);
        assert_eq!(drafts.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_registered_task_records_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let drafts = Arc::new(DraftStore::new(FileKvStore::new(dir.path())));

        assert_eq!(dispatch_location_event(Err("kCLErrorDomain 0".into())).await, 0);

        assert!(define_location_task(drafts.clone(), TrackFilterConfig::default()));
        assert!(!define_location_task(drafts.clone(), TrackFilterConfig::default()));

        // No draft yet: stale delivery
        assert_eq!(dispatch_location_event(Ok(vec![RawFix::new(51.5, -0.12, 0)])).await, 0);

        drafts.save(&RouteDraft::new(0)).await.unwrap();
        let batch = vec![
            RawFix::new(51.500, -0.12, 0),
            RawFix::new(51.501, -0.12, 30_000),
        ];
        assert_eq!(dispatch_location_event(Ok(batch)).await, 2);
        assert_eq!(drafts.load().await.unwrap().unwrap().points.len(), 2);
    }
}
