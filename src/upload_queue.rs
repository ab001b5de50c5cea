//! Durable queue of publishes waiting for connectivity.
//!
//! ## Storage layout
//!
//! | What | Where |
//! |------|-------|
//! | Index of pending items | key `pending_uploads` in the key-value store |
//! | Photo copies | `<stash dir>/<id>_<index>.jpg` |
//!
//! Every photo path in the index points at a file that exists inside the
//! stash. Removing an item deletes its photo copies.
//!
//! Draining is sequential, FIFO by creation time, and never runs twice at
//! once. A successful item is removed immediately so a drain interrupted
//! half way does not re-upload it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::Backend;
use crate::photos::{PhotoCompressor, PhotoStash};
use crate::publish::{submit_drive, PublishInput};
use crate::storage::{record_lock, KeyValueStore};
use crate::{CaptureError, Clock, SystemClock};

/// Key-value key of the queue index.
pub const QUEUE_STORAGE_KEY: &str = "pending_uploads";

/// A publish deferred until the backend is reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpload {
    /// Opaque unique id
    pub id: String,
    #[serde(flatten)]
    pub input: PublishInput,
    /// Copies inside the photo stash, in the user's order
    pub stable_photo_paths: Vec<PathBuf>,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Items a submission was attempted for
    pub attempted: usize,
    pub uploaded: usize,
    /// Items still queued after the pass
    pub remaining: usize,
    /// Another drain was already running; nothing was done
    pub skipped: bool,
}

impl DrainReport {
    /// Banner text, e.g. "2 of 3 uploaded".
    pub fn summary(&self) -> String {
        format!("{} of {} uploaded", self.uploaded, self.attempted)
    }
}

/// Persistent FIFO of [`PendingUpload`]s.
pub struct UploadQueue<K: KeyValueStore, C: Clock = SystemClock> {
    kv: K,
    stash: PhotoStash,
    clock: C,
    /// Serializes read-modify-write of the index across handles
    index_lock: Arc<Mutex<()>>,
    draining: AtomicBool,
}

impl<K: KeyValueStore> UploadQueue<K, SystemClock> {
    pub fn new(kv: K, stash: PhotoStash) -> Self {
        Self::with_clock(kv, stash, SystemClock)
    }
}

impl<K: KeyValueStore, C: Clock> UploadQueue<K, C> {
    pub fn with_clock(kv: K, stash: PhotoStash, clock: C) -> Self {
        let index_lock = record_lock(&kv.location(QUEUE_STORAGE_KEY));
        Self {
            kv,
            stash,
            clock,
            index_lock,
            draining: AtomicBool::new(false),
        }
    }

    pub fn stash(&self) -> &PhotoStash {
        &self.stash
    }

    /// True while a drain pass is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Queue a publish, copying its photos into the stash first.
    ///
    /// Returns the new item's id. If the index cannot be written the stashed
    /// copies are removed again.
    pub async fn enqueue(&self, input: &PublishInput, photo_paths: &[PathBuf]) -> Result<String, CaptureError> {
        let id = Uuid::new_v4().to_string();
        let stable_photo_paths = self.stash.stash(&id, photo_paths).await?;
        if stable_photo_paths.len() < photo_paths.len() {
            warn!(
                "[UploadQueue] {} of {} photos could not be stashed for {}",
                photo_paths.len() - stable_photo_paths.len(),
                photo_paths.len(),
                id
            );
        }

        let item = PendingUpload {
            id: id.clone(),
            input: input.clone(),
            stable_photo_paths,
            created_at: self.clock.now_ms(),
        };

        let _guard = self.index_lock.lock().await;
        let written = match self.read_index().await {
            Ok(mut items) => {
                items.push(item.clone());
                self.write_index(&items).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("[UploadQueue] Failed to queue {}: {}", id, e);
            self.stash.delete(&item.stable_photo_paths).await;
            return Err(e);
        }

        info!("[UploadQueue] Queued {} \"{}\"", id, item.input.title);
        Ok(id)
    }

    /// Pending items, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<PendingUpload>, CaptureError> {
        let mut items = self.read_index().await?;
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    pub async fn pending_count(&self) -> Result<usize, CaptureError> {
        Ok(self.read_index().await?.len())
    }

    /// Remove an item and delete its photo copies.
    ///
    /// Returns false if no item has that id. Removing twice is harmless.
    pub async fn remove(&self, id: &str) -> Result<bool, CaptureError> {
        let _guard = self.index_lock.lock().await;
        let mut items = self.read_index().await?;
        let Some(pos) = items.iter().position(|item| item.id == id) else {
            return Ok(false);
        };
        let removed = items.remove(pos);
        self.write_index(&items).await?;
        self.stash.delete(&removed.stable_photo_paths).await;
        debug!("[UploadQueue] Removed {}", id);
        Ok(true)
    }

    /// Remove every item and its photo copies.
    pub async fn clear(&self) -> Result<(), CaptureError> {
        let _guard = self.index_lock.lock().await;
        let items = self.read_index().await?;
        self.kv.remove(QUEUE_STORAGE_KEY).await?;
        for item in &items {
            self.stash.delete(&item.stable_photo_paths).await;
        }
        info!("[UploadQueue] Cleared {} item(s)", items.len());
        Ok(())
    }

    /// Submit every pending item in order.
    ///
    /// Items that fail stay queued. A connectivity failure ends the pass
    /// early since the rest would fail the same way. If a drain is already
    /// running this returns immediately with `skipped` set.
    pub async fn drain<B, P>(&self, backend: &B, compressor: &Arc<P>) -> Result<DrainReport, CaptureError>
    where
        B: Backend,
        P: PhotoCompressor,
    {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[UploadQueue] Drain already running");
            return Ok(DrainReport { skipped: true, ..Default::default() });
        }
        let _running = DrainGuard(&self.draining);

        let items = self.list_pending().await?;
        let mut report = DrainReport::default();
        if items.is_empty() {
            return Ok(report);
        }
        info!("[UploadQueue] Draining {} item(s)", items.len());

        for item in &items {
            report.attempted += 1;
            let submitted = submit_drive(
                backend,
                compressor,
                &item.input,
                &item.stable_photo_paths,
                self.clock.now_ms(),
            )
            .await;

            match submitted {
                Ok(_) => {
                    report.uploaded += 1;
                    if let Err(e) = self.remove(&item.id).await {
                        warn!("[UploadQueue] Uploaded {} but could not dequeue it: {}", item.id, e);
                    }
                }
                Err(e) if e.is_network() => {
                    warn!("[UploadQueue] Lost connectivity during drain: {}", e);
                    break;
                }
                Err(e) => warn!("[UploadQueue] {} stays queued: {}", item.id, e),
            }
        }

        report.remaining = self.pending_count().await?;
        info!("[UploadQueue] {} ({} remaining)", report.summary(), report.remaining);
        Ok(report)
    }

    async fn read_index(&self) -> Result<Vec<PendingUpload>, CaptureError> {
        match self.kv.get(QUEUE_STORAGE_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn write_index(&self, items: &[PendingUpload]) -> Result<(), CaptureError> {
        if items.is_empty() {
            return self.kv.remove(QUEUE_STORAGE_KEY).await;
        }
        let raw = serde_json::to_string(items)?;
        self.kv.set(QUEUE_STORAGE_KEY, &raw).await
    }
}

/// Clears the draining flag however the pass ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Connectivity-triggered draining
// ============================================================================

/// Starts a drain when connectivity comes back.
///
/// The initial state is "offline", so the first online report after launch
/// drains anything queued in an earlier run.
pub struct QueueDrainer<K, C, B, P>
where
    K: KeyValueStore,
    C: Clock,
    B: Backend,
    P: PhotoCompressor,
{
    queue: Arc<UploadQueue<K, C>>,
    backend: Arc<B>,
    compressor: Arc<P>,
    was_connected: AtomicBool,
}

impl<K, C, B, P> QueueDrainer<K, C, B, P>
where
    K: KeyValueStore + 'static,
    C: Clock + 'static,
    B: Backend + 'static,
    P: PhotoCompressor,
{
    pub fn new(queue: Arc<UploadQueue<K, C>>, backend: Arc<B>, compressor: Arc<P>) -> Self {
        Self {
            queue,
            backend,
            compressor,
            was_connected: AtomicBool::new(false),
        }
    }

    /// Feed a connectivity change.
    ///
    /// Spawns a drain on an offline to online transition unless one is
    /// already running. Must be called from within a tokio runtime.
    pub fn on_connectivity_changed(&self, connected: bool) -> Option<JoinHandle<Result<DrainReport, CaptureError>>> {
        let was_connected = self.was_connected.swap(connected, Ordering::AcqRel);
        if !connected || was_connected {
            return None;
        }
        if self.queue.is_draining() {
            debug!("[QueueDrainer] Back online, drain already running");
            return None;
        }

        info!("[QueueDrainer] Back online, draining queue");
        let queue = Arc::clone(&self.queue);
        let backend = Arc::clone(&self.backend);
        let compressor = Arc::clone(&self.compressor);
        Some(tokio::spawn(async move { queue.drain(&*backend, &compressor).await }))
    }

    /// Drain now, regardless of the last reported connectivity.
    pub async fn drain_now(&self) -> Result<DrainReport, CaptureError> {
        self.queue.drain(&*self.backend, &self.compressor).await
    }
}
