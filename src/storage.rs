//! Local durable key-value storage.
//!
//! Values survive process termination between calls. Writes are atomic
//! (temp file, fsync, rename), so a reader running concurrently with a writer
//! observes either the previous value or the new one, never a torn write.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::CaptureError;

/// Durable string key-value storage.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, or `None` if absent.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, CaptureError>> + Send;

    /// Replace the value stored under `key`.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), CaptureError>> + Send;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> impl Future<Output = Result<(), CaptureError>> + Send;

    /// Identifies where `key` is persisted. Two handles over the same
    /// backing storage return the same location.
    fn location(&self, key: &str) -> String;
}

static RECORD_LOCKS: OnceLock<std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>> = OnceLock::new();

/// Process-wide write lock for one persisted record.
///
/// Every caller passing the same location gets the same lock for as long as
/// any of them holds it, so separate store handles still serialize their
/// read-modify-write cycles.
pub fn record_lock(location: &str) -> Arc<Mutex<()>> {
    let registry = RECORD_LOCKS.get_or_init(Default::default);
    let mut locks = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(lock) = locks.get(location).and_then(Weak::upgrade) {
        return lock;
    }
    locks.retain(|_, lock| lock.strong_count() > 0);
    let lock = Arc::new(Mutex::new(()));
    locks.insert(location.to_string(), Arc::downgrade(&lock));
    lock
}

/// [`KeyValueStore`] keeping one file per key inside a private directory.
#[derive(Debug)]
pub struct FileKvStore {
    dir: PathBuf,
    write_seq: AtomicU64,
}

impl FileKvStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), write_seq: AtomicU64::new(0) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

/// Map a key onto a safe file name.
fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl KeyValueStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CaptureError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CaptureError::Storage(format!("read {}: {}", key, e))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CaptureError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let target = self.path_for(key);
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!(".{}.{}.tmp", file_stem(key), seq));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(value.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CaptureError::Storage(format!("commit {}: {}", key, e)));
        }

        debug!("[Storage] Wrote {} ({} bytes)", key, value.len());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CaptureError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CaptureError::Storage(format!("remove {}: {}", key, e))),
        }
    }

    fn location(&self, key: &str) -> String {
        let path = self.path_for(key);
        std::path::absolute(&path).unwrap_or(path).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path());
        assert_eq!(store.get("nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("nested"));
        store.set("@app/route_draft", "first").await.unwrap();
        store.set("@app/route_draft", "second").await.unwrap();

        // A fresh handle over the same directory, as after a relaunch
        let reopened = FileKvStore::new(dir.path().join("nested"));
        assert_eq!(reopened.get("@app/route_draft").await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path());
        store.set("k", "v").await.unwrap();
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path());
        for i in 0..5 {
            store.set("k", &i.to_string()).await.unwrap();
        }
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["k.json".to_string()]);
    }

    #[test]
    fn test_handles_over_same_dir_share_record_lock() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileKvStore::new(dir.path());
        let held = record_lock(&first.location("route_draft"));

        assert!(Arc::ptr_eq(&held, &record_lock(&FileKvStore::new(dir.path()).location("route_draft"))));
        assert!(!Arc::ptr_eq(&held, &record_lock(&first.location("pending_uploads"))));
    }

    #[tokio::test]
    async fn test_record_lock_blocks_other_handle() {
        let dir = tempfile::tempdir().unwrap();
        let location = FileKvStore::new(dir.path()).location("k");
        let held = record_lock(&location);
        let _guard = held.lock().await;
        assert!(record_lock(&location).try_lock().is_err());
    }

    #[test]
    fn test_file_stem_sanitizes_keys() {
        assert_eq!(file_stem("@app/pending_uploads"), "_app_pending_uploads");
    }
}
