//! Record a simulated drive, publish it while offline, then drain the queue
//! once connectivity returns.
//!
//! Run with: cargo run --example record_and_publish

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use route_capture::{
    handle_location_batch, metrics, Backend, CaptureError, Clock, Connectivity, DraftStore, DriveTag, FileKvStore,
    GeoSampler, LocationProvider, NewDrive, NewDriveStop, PhotoStash, PublishConfig, PublishInput, PublishOutcome,
    Publisher, QueueDrainer, RawFix, RecordingSession, SamplerOptions, Stop, SystemClock, TrackFilterConfig,
    UploadQueue,
};

/// Location service that is always authorized.
#[derive(Default)]
struct SimulatedGps {
    active: AtomicBool,
}

impl LocationProvider for SimulatedGps {
    async fn request_foreground_permission(&self) -> bool {
        true
    }

    async fn request_background_permission(&self) -> bool {
        true
    }

    async fn start_location_updates(&self, _task: &str, _options: &SamplerOptions) -> Result<(), CaptureError> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_location_updates(&self, _task: &str) -> Result<(), CaptureError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn has_started_location_updates(&self, _task: &str) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Backend that prints what it receives.
#[derive(Default)]
struct ConsoleBackend {
    online: AtomicBool,
    drives: AtomicUsize,
}

impl ConsoleBackend {
    fn record(&self, line: String) -> Result<(), CaptureError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(CaptureError::NetworkUnavailable("airplane mode".into()));
        }
        println!("   backend: {}", line);
        Ok(())
    }
}

impl Backend for ConsoleBackend {
    async fn current_user_id(&self) -> Result<String, CaptureError> {
        Ok("demo-user".into())
    }

    async fn create_drive(&self, drive: &NewDrive) -> Result<String, CaptureError> {
        let id = format!("drive-{}", self.drives.load(Ordering::SeqCst) + 1);
        let route = drive
            .route_data
            .as_ref()
            .map(|r| format!("{}, {}s", metrics::format_distance(r.distance_meters), r.duration_seconds))
            .unwrap_or_else(|| "no route".into());
        self.record(format!("insert drive {} \"{}\" ({}) tags={:?}", id, drive.title, route, drive.tags))?;
        self.drives.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn create_drive_photo(&self, drive_id: &str, photo_url: &str, order_index: u32) -> Result<(), CaptureError> {
        self.record(format!("attach photo #{} to {}: {}", order_index, drive_id, photo_url))
    }

    async fn create_drive_stop(&self, drive_id: &str, stop: &NewDriveStop) -> Result<(), CaptureError> {
        self.record(format!("attach stop #{} \"{}\" to {}", stop.order_index, stop.name, drive_id))
    }

    async fn upload_media(&self, object_path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, CaptureError> {
        self.record(format!("upload {} ({} bytes, {})", object_path, bytes.len(), content_type))?;
        Ok(format!("https://storage.local/{}", object_path))
    }
}

impl Connectivity for ConsoleBackend {
    async fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

fn write_photo(path: &Path) {
    let img = image::RgbImage::from_fn(1920, 1080, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    if let Err(e) = img.save(path) {
        eprintln!("could not write demo photo: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<(), CaptureError> {
    let data_dir = tempfile::tempdir()?;
    println!("Route Capture demo (data dir: {})\n", data_dir.path().display());

    let drafts = Arc::new(DraftStore::new(FileKvStore::new(data_dir.path())));
    let session = RecordingSession::new(GeoSampler::new(SimulatedGps::default()), drafts.clone(), SystemClock);

    // 1. Record
    println!("1. Recording");
    let state = session.start().await?;
    println!("   state: {:?}", state);

    // Coastal road heading north, one batch every 30s; the last fix is jitter
    let base = SystemClock.now_ms();
    let batches = vec![
        vec![RawFix::new(50.6000, -1.3000, base), RawFix::new(50.6004, -1.3000, base + 10_000)],
        vec![RawFix::new(50.6010, -1.3002, base + 30_000), RawFix::new(50.6020, -1.3005, base + 60_000)],
        vec![RawFix::new(50.6032, -1.3010, base + 90_000), RawFix::new(50.6032, -1.3011, base + 95_000)],
    ];
    for batch in &batches {
        let appended = handle_location_batch(&drafts, batch, &TrackFilterConfig::default()).await?;
        println!("   batch of {} fix(es): {} accepted", batch.len(), appended);
    }

    let draft = session.finish().await?;
    println!(
        "   finished: {} points, {}, {}\n",
        draft.points.len(),
        metrics::format_distance(metrics::total_distance_meters(&draft.points)),
        metrics::format_duration(metrics::duration_ms(&draft.points))
    );

    // 2. Publish while offline
    println!("2. Publishing offline");
    let photo_dir = data_dir.path().join("picker");
    std::fs::create_dir_all(&photo_dir)?;
    let photos = vec![photo_dir.join("cliffs.png"), photo_dir.join("harbour.png")];
    photos.iter().for_each(|p| write_photo(p));

    let backend = Arc::new(ConsoleBackend::default());
    let queue = Arc::new(UploadQueue::new(
        FileKvStore::new(data_dir.path()),
        PhotoStash::in_data_dir(data_dir.path()),
    ));
    let publisher = Publisher::new(
        backend.clone(),
        backend.clone(),
        drafts.clone(),
        queue.clone(),
        PublishConfig::default(),
        SystemClock,
    );

    let input = PublishInput {
        title: "Coastal Run".into(),
        description: "Cliff road with sea views".into(),
        rating: 5,
        tags: vec![DriveTag::Coastal, DriveTag::Scenic],
        stops: vec![Stop { name: "Harbour cafe".into(), description: Some("Good coffee".into()) }],
        route_points: draft.points,
    };
    match publisher.publish(input, photos).await? {
        PublishOutcome::SavedOffline { upload_id } => println!("   saved for later as {}", upload_id),
        PublishOutcome::Published(report) => println!("   published as {}", report.drive_id),
    }

    // The picker's files are gone; the queue kept its own copies
    std::fs::remove_dir_all(&photo_dir)?;
    println!("   pending uploads: {}\n", queue.pending_count().await?);

    // 3. Connectivity returns
    println!("3. Back online");
    backend.online.store(true, Ordering::SeqCst);
    let drainer = QueueDrainer::new(queue.clone(), backend.clone(), publisher.compressor().clone());
    if let Some(handle) = drainer.on_connectivity_changed(true) {
        match handle.await {
            Ok(report) => println!("   {}", report?.summary()),
            Err(e) => eprintln!("   drain task failed: {}", e),
        }
    }
    println!("   pending uploads: {}", queue.pending_count().await?);

    Ok(())
}
