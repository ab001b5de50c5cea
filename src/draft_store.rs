//! Draft store: durable persistence of the single in-progress route.
//!
//! The draft is one record under a fixed key (there is never more than one
//! recording). `save` replaces it wholesale; appends are read-modify-write
//! under a lock shared by every handle over the same storage, so a background
//! delivery and a foreground reset cannot interleave even when each side
//! opened its own store.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::Mutex;

use crate::storage::{record_lock, KeyValueStore};
use crate::{CaptureError, RouteDraft, RoutePoint};

/// Storage key of the draft record.
pub const DRAFT_STORAGE_KEY: &str = "route_draft";

pub struct DraftStore<K: KeyValueStore> {
    kv: K,
    write_lock: Arc<Mutex<()>>,
}

impl<K: KeyValueStore> DraftStore<K> {
    pub fn new(kv: K) -> Self {
        let write_lock = record_lock(&kv.location(DRAFT_STORAGE_KEY));
        Self { kv, write_lock }
    }

    /// Load the current draft, if one exists.
    ///
    /// A record that no longer decodes is reported as absent.
    pub async fn load(&self) -> Result<Option<RouteDraft>, CaptureError> {
        let Some(raw) = self.kv.get(DRAFT_STORAGE_KEY).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<RouteDraft>(&raw) {
            Ok(draft) => Ok(Some(draft)),
            Err(e) => {
                warn!("[DraftStore] Discarding undecodable draft: {}", e);
                Ok(None)
            }
        }
    }

    /// Replace the stored draft.
    pub async fn save(&self, draft: &RouteDraft) -> Result<(), CaptureError> {
        let _guard = self.write_lock.lock().await;
        self.write(draft).await
    }

    /// Delete the stored draft. Clearing an absent draft is not an error.
    pub async fn clear(&self) -> Result<(), CaptureError> {
        let _guard = self.write_lock.lock().await;
        self.kv.remove(DRAFT_STORAGE_KEY).await?;
        debug!("[DraftStore] Cleared draft");
        Ok(())
    }

    /// Append the points chosen by `select` to the stored draft.
    ///
    /// `select` sees the current draft and returns the points to append.
    /// Returns `None` without writing if no draft exists (recording stopped),
    /// otherwise the number of points appended. Nothing is written when
    /// `select` returns no points.
    pub async fn append_with<F>(&self, select: F) -> Result<Option<usize>, CaptureError>
    where
        F: FnOnce(&RouteDraft) -> Vec<RoutePoint> + Send,
    {
        let _guard = self.write_lock.lock().await;

        let Some(mut draft) = self.load().await? else {
            return Ok(None);
        };

        let new_points = select(&draft);
        let count = new_points.len();
        if count == 0 {
            return Ok(Some(0));
        }

        draft.points.extend(new_points);
        self.write(&draft).await?;
        debug!("[DraftStore] Appended {} point(s), draft now has {}", count, draft.points.len());
        Ok(Some(count))
    }

    async fn write(&self, draft: &RouteDraft) -> Result<(), CaptureError> {
        let raw = serde_json::to_string(draft)?;
        self.kv.set(DRAFT_STORAGE_KEY, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileKvStore;

    fn store(dir: &tempfile::TempDir) -> DraftStore<FileKvStore> {
        DraftStore::new(FileKvStore::new(dir.path()))
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let drafts = store(&dir);

        let mut draft = RouteDraft::new(1_700_000_000_000);
        draft.points.push(RoutePoint::new(51.5074, -0.1278, 1_700_000_000_000));
        draft.points.push(RoutePoint::new(51.5084, -0.1278, 1_700_000_030_000));

        drafts.save(&draft).await.unwrap();
        assert_eq!(drafts.load().await.unwrap(), Some(draft));
    }

    #[tokio::test]
    async fn test_draft_survives_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).save(&RouteDraft::new(42)).await.unwrap();

        let loaded = store(&dir).load().await.unwrap().unwrap();
        assert_eq!(loaded.started_at, 42);
        assert!(loaded.points.is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_draft() {
        let dir = tempfile::tempdir().unwrap();
        let drafts = store(&dir);
        drafts.save(&RouteDraft::new(1)).await.unwrap();
        drafts.clear().await.unwrap();
        drafts.clear().await.unwrap();
        assert_eq!(drafts.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_without_draft_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let drafts = store(&dir);
        let appended = drafts
            .append_with(|_| vec![RoutePoint::new(51.5, -0.12, 0)])
            .await
            .unwrap();
        assert_eq!(appended, None);
        assert_eq!(drafts.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_extends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let drafts = store(&dir);
        drafts.save(&RouteDraft::new(0)).await.unwrap();

        let appended = drafts
            .append_with(|d| {
                assert!(d.points.is_empty());
                vec![RoutePoint::new(51.5, -0.12, 1), RoutePoint::new(51.6, -0.12, 2)]
            })
            .await
            .unwrap();
        assert_eq!(appended, Some(2));

        drafts.append_with(|_| vec![RoutePoint::new(51.7, -0.12, 3)]).await.unwrap();
        let timestamps: Vec<i64> = drafts.load().await.unwrap().unwrap().points.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_undecodable_draft_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKvStore::new(dir.path());
        kv.set(DRAFT_STORAGE_KEY, "{not json").await.unwrap();
        let drafts = DraftStore::new(kv);
        assert_eq!(drafts.load().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clear_from_other_handle_waits_for_append() {
        let dir = tempfile::tempdir().unwrap();
        let background = Arc::new(store(&dir));
        let foreground = store(&dir);
        background.save(&RouteDraft::new(0)).await.unwrap();

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let delivery = background.clone();
        let append = tokio::spawn(async move {
            delivery
                .append_with(move |_| {
                    let _ = entered_tx.send(());
                    // Hold the read-modify-write open while the reset arrives
                    std::thread::sleep(std::time::Duration::from_millis(200));
                    vec![RoutePoint::new(51.5, -0.12, 1)]
                })
                .await
        });

        entered_rx.await.unwrap();
        foreground.clear().await.unwrap();

        assert_eq!(append.await.unwrap().unwrap(), Some(1));
        assert_eq!(foreground.load().await.unwrap(), None);
        assert_eq!(store(&dir).load().await.unwrap(), None);
    }
}
