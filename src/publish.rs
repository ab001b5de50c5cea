//! Publish pipeline: turns a finished route plus user metadata into a
//! backend drive record.
//!
//! When the backend is unreachable the publish is packaged into the upload
//! queue instead of failing; the caller gets [`PublishOutcome::SavedOffline`].
//! [`submit_drive`] is shared with the queue drainer so live and queued
//! publishes produce identical records.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::backend::{photo_object_path, Backend, Connectivity, NewDrive, NewDriveStop};
use crate::draft_store::DraftStore;
use crate::metrics::RouteData;
use crate::photos::{JpegCompressor, PhotoCompressor};
use crate::storage::KeyValueStore;
use crate::upload_queue::UploadQueue;
use crate::{CaptureError, Clock, RoutePoint, SystemClock, ValidationError};

// ============================================================================
// Input
// ============================================================================

/// Predefined drive tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DriveTag {
    Scenic,
    Twisty,
    Coastal,
    Mountain,
    Urban,
    Highway,
    #[serde(rename = "Off-road")]
    OffRoad,
}

impl DriveTag {
    pub const ALL: [DriveTag; 7] = [
        DriveTag::Scenic,
        DriveTag::Twisty,
        DriveTag::Coastal,
        DriveTag::Mountain,
        DriveTag::Urban,
        DriveTag::Highway,
        DriveTag::OffRoad,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            DriveTag::Scenic => "Scenic",
            DriveTag::Twisty => "Twisty",
            DriveTag::Coastal => "Coastal",
            DriveTag::Mountain => "Mountain",
            DriveTag::Urban => "Urban",
            DriveTag::Highway => "Highway",
            DriveTag::OffRoad => "Off-road",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.label() == label)
    }
}

/// A point of interest along the drive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// User-entered metadata plus the recorded route.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// 0 (unrated) to 5
    #[serde(default)]
    pub rating: u8,
    #[serde(default)]
    pub tags: Vec<DriveTag>,
    #[serde(default)]
    pub stops: Vec<Stop>,
    #[serde(default)]
    pub route_points: Vec<RoutePoint>,
}

/// Publish tunables and input limits.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Default: 1080 px
    pub max_photo_width: u32,
    /// Default: 80
    pub jpeg_quality: u8,
    pub max_title_chars: usize,
    pub max_description_chars: usize,
    pub max_photos: usize,
    pub max_tags: usize,
    pub max_stop_name_chars: usize,
    pub max_stop_description_chars: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_photo_width: 1080,
            jpeg_quality: 80,
            max_title_chars: 100,
            max_description_chars: 2000,
            max_photos: 10,
            max_tags: 10,
            max_stop_name_chars: 100,
            max_stop_description_chars: 500,
        }
    }
}

impl PublishConfig {
    pub fn compressor(&self) -> JpegCompressor {
        JpegCompressor { max_width: self.max_photo_width, quality: self.jpeg_quality }
    }
}

/// Validate and normalize publish input.
///
/// Trims text, drops empty stop descriptions and duplicate tags.
pub fn validate(input: PublishInput, photo_count: usize, config: &PublishConfig) -> Result<PublishInput, ValidationError> {
    let title = input.title.trim().to_string();
    if title.is_empty() {
        return Err(ValidationError::MissingTitle);
    }
    if title.chars().count() > config.max_title_chars {
        return Err(ValidationError::TitleTooLong { max: config.max_title_chars });
    }

    if photo_count == 0 {
        return Err(ValidationError::NoPhotos);
    }
    if photo_count > config.max_photos {
        return Err(ValidationError::TooManyPhotos { max: config.max_photos });
    }

    let description = input.description.trim().to_string();
    if description.chars().count() > config.max_description_chars {
        return Err(ValidationError::DescriptionTooLong { max: config.max_description_chars });
    }

    if input.rating > 5 {
        return Err(ValidationError::RatingOutOfRange(input.rating));
    }

    let mut tags = Vec::with_capacity(input.tags.len());
    for tag in input.tags {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    if tags.len() > config.max_tags {
        return Err(ValidationError::TooManyTags { max: config.max_tags });
    }

    let mut stops = Vec::with_capacity(input.stops.len());
    for (index, stop) in input.stops.into_iter().enumerate() {
        let name = stop.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::StopNameMissing { index });
        }
        if name.chars().count() > config.max_stop_name_chars {
            return Err(ValidationError::StopNameTooLong { index, max: config.max_stop_name_chars });
        }
        let description = stop
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if description.as_ref().is_some_and(|d| d.chars().count() > config.max_stop_description_chars) {
            return Err(ValidationError::StopDescriptionTooLong { index, max: config.max_stop_description_chars });
        }
        stops.push(Stop { name, description });
    }

    Ok(PublishInput {
        title,
        description,
        rating: input.rating,
        tags,
        stops,
        route_points: input.route_points,
    })
}

// ============================================================================
// Submission
// ============================================================================

/// What a backend submission achieved.
///
/// Photo and stop failures do not fail the submission; they are counted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub drive_id: String,
    pub photos_uploaded: usize,
    pub photos_failed: usize,
    pub stops_attached: usize,
    pub stops_failed: usize,
}

impl PublishReport {
    /// Some photos were dropped.
    pub fn is_partial(&self) -> bool {
        self.photos_failed > 0
    }
}

/// Result of a publish attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The drive is live on the backend.
    Published(PublishReport),
    /// The backend was unreachable; the drive waits in the upload queue.
    SavedOffline { upload_id: String },
}

/// Create the drive record, then upload and attach photos, then attach stops.
///
/// Only failures before the record exists are returned as errors. Once the
/// record is created every photo and stop is attempted in turn; individual
/// failures are logged and counted in the report.
pub async fn submit_drive<B, P>(
    backend: &B,
    compressor: &Arc<P>,
    input: &PublishInput,
    photos: &[PathBuf],
    now_ms: i64,
) -> Result<PublishReport, CaptureError>
where
    B: Backend,
    P: PhotoCompressor,
{
    let user_id = backend.current_user_id().await?;

    let drive = NewDrive {
        user_id,
        title: input.title.clone(),
        description: Some(input.description.clone()).filter(|d| !d.is_empty()),
        rating: Some(input.rating).filter(|r| *r > 0),
        route_data: RouteData::from_points(&input.route_points),
        tags: input.tags.clone(),
    };
    let drive_id = backend.create_drive(&drive).await?;
    info!("[Publish] Created drive {} ({} route points)", drive_id, input.route_points.len());

    let mut report = PublishReport {
        drive_id,
        photos_uploaded: 0,
        photos_failed: 0,
        stops_attached: 0,
        stops_failed: 0,
    };

    for (index, path) in photos.iter().enumerate() {
        let attached = match upload_photo(backend, compressor, &report.drive_id, path, index, now_ms).await {
            Ok(url) => backend
                .create_drive_photo(&report.drive_id, &url, report.photos_uploaded as u32)
                .await,
            Err(e) => Err(e),
        };
        match attached {
            Ok(()) => report.photos_uploaded += 1,
            Err(e) => {
                warn!("[Publish] Photo {} skipped: {}", index, e);
                report.photos_failed += 1;
            }
        }
    }

    for (index, stop) in input.stops.iter().enumerate() {
        let new_stop = NewDriveStop {
            name: stop.name.clone(),
            description: stop.description.clone(),
            order_index: index as u32,
        };
        match backend.create_drive_stop(&report.drive_id, &new_stop).await {
            Ok(()) => report.stops_attached += 1,
            Err(e) => {
                warn!("[Publish] Stop {} not attached: {}", index, e);
                report.stops_failed += 1;
            }
        }
    }

    info!(
        "[Publish] Drive {} done: {}/{} photos, {}/{} stops",
        report.drive_id,
        report.photos_uploaded,
        photos.len(),
        report.stops_attached,
        input.stops.len()
    );
    Ok(report)
}

async fn upload_photo<B, P>(
    backend: &B,
    compressor: &Arc<P>,
    drive_id: &str,
    path: &Path,
    index: usize,
    now_ms: i64,
) -> Result<String, CaptureError>
where
    B: Backend,
    P: PhotoCompressor,
{
    let bytes = tokio::fs::read(path).await?;

    let worker = Arc::clone(compressor);
    let compressed = tokio::task::spawn_blocking(move || worker.compress(&bytes))
        .await
        .map_err(|e| CaptureError::Photo(e.to_string()))??;

    backend
        .upload_media(&photo_object_path(drive_id, now_ms, index), compressed, compressor.content_type())
        .await
}

// ============================================================================
// Pipeline
// ============================================================================

/// Publishes finished routes, falling back to the upload queue when offline.
pub struct Publisher<B, N, K, P = JpegCompressor, C = SystemClock>
where
    B: Backend,
    N: Connectivity,
    K: KeyValueStore,
    P: PhotoCompressor,
    C: Clock,
{
    backend: Arc<B>,
    connectivity: Arc<N>,
    drafts: Arc<DraftStore<K>>,
    queue: Arc<UploadQueue<K, C>>,
    compressor: Arc<P>,
    config: PublishConfig,
    clock: C,
}

impl<B, N, K, C> Publisher<B, N, K, JpegCompressor, C>
where
    B: Backend,
    N: Connectivity,
    K: KeyValueStore,
    C: Clock,
{
    pub fn new(
        backend: Arc<B>,
        connectivity: Arc<N>,
        drafts: Arc<DraftStore<K>>,
        queue: Arc<UploadQueue<K, C>>,
        config: PublishConfig,
        clock: C,
    ) -> Self {
        let compressor = Arc::new(config.compressor());
        Publisher::with_compressor(backend, connectivity, drafts, queue, compressor, config, clock)
    }
}

impl<B, N, K, P, C> Publisher<B, N, K, P, C>
where
    B: Backend,
    N: Connectivity,
    K: KeyValueStore,
    P: PhotoCompressor,
    C: Clock,
{
    pub fn with_compressor(
        backend: Arc<B>,
        connectivity: Arc<N>,
        drafts: Arc<DraftStore<K>>,
        queue: Arc<UploadQueue<K, C>>,
        compressor: Arc<P>,
        config: PublishConfig,
        clock: C,
    ) -> Self {
        Self { backend, connectivity, drafts, queue, compressor, config, clock }
    }

    pub fn compressor(&self) -> &Arc<P> {
        &self.compressor
    }

    /// Publish a drive.
    ///
    /// Validation failures are returned before any storage or network
    /// activity. On success, or once the drive is safely queued, the draft is
    /// cleared. A backend rejection leaves the draft in place for a retry.
    pub async fn publish(&self, input: PublishInput, photos: Vec<PathBuf>) -> Result<PublishOutcome, CaptureError> {
        let input = validate(input, photos.len(), &self.config)?;

        if !self.connectivity.is_connected().await {
            info!("[Publish] Offline, queueing \"{}\"", input.title);
            return self.save_offline(&input, &photos).await;
        }

        match submit_drive(&*self.backend, &self.compressor, &input, &photos, self.clock.now_ms()).await {
            Ok(report) => {
                self.clear_draft().await;
                Ok(PublishOutcome::Published(report))
            }
            Err(e) if e.is_network() => {
                info!("[Publish] Lost connectivity ({}), queueing \"{}\"", e, input.title);
                self.save_offline(&input, &photos).await
            }
            Err(e) => {
                warn!("[Publish] Failed: {}", e);
                Err(e)
            }
        }
    }

    async fn save_offline(&self, input: &PublishInput, photos: &[PathBuf]) -> Result<PublishOutcome, CaptureError> {
        let upload_id = self.queue.enqueue(input, photos).await?;
        self.clear_draft().await;
        Ok(PublishOutcome::SavedOffline { upload_id })
    }

    async fn clear_draft(&self) {
        if let Err(e) = self.drafts.clear().await {
            warn!("[Publish] Failed to clear draft after handoff: {}", e);
        }
    }
}
