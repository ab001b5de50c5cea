//! Photo handling: durable stashing and upload compression.
//!
//! Photo picker URIs are ephemeral (they can vanish once the picker call
//! returns or after a restart), so queued publishes keep their own copies
//! inside the app's private storage.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use log::{debug, warn};

use crate::CaptureError;

/// Directory (under the data directory) holding stashed photos.
pub const STASH_DIR_NAME: &str = "pending_uploads";

/// Private directory of durable photo copies.
#[derive(Debug, Clone)]
pub struct PhotoStash {
    dir: PathBuf,
}

impl PhotoStash {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The stash directory inside an app data directory.
    pub fn in_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(STASH_DIR_NAME))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `sources` into the stash as `<upload_id>_<index>.jpg`.
    ///
    /// A source that can no longer be copied is skipped; the returned list
    /// holds only the copies that exist.
    pub async fn stash(&self, upload_id: &str, sources: &[PathBuf]) -> Result<Vec<PathBuf>, CaptureError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut stable = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let dest = self.dir.join(format!("{}_{}.jpg", upload_id, index));
            match tokio::fs::copy(source, &dest).await {
                Ok(bytes) => {
                    debug!("[PhotoStash] Stashed {} ({} bytes)", dest.display(), bytes);
                    stable.push(dest);
                }
                Err(e) => warn!("[PhotoStash] Skipping photo {}: {}", source.display(), e),
            }
        }
        Ok(stable)
    }

    /// True if `path` is a file directly inside the stash directory.
    pub fn owns(&self, path: &Path) -> bool {
        path.parent() == Some(self.dir.as_path())
            && path.file_name().is_some_and(|name| name != "." && name != "..")
    }

    /// Delete stashed copies. Missing files are ignored and paths outside the
    /// stash are never touched.
    pub async fn delete(&self, paths: &[PathBuf]) {
        for path in paths {
            if !self.owns(path) {
                warn!("[PhotoStash] Refusing to delete {} outside the stash", path.display());
                continue;
            }
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("[PhotoStash] Failed to delete {}: {}", path.display(), e),
            }
        }
    }
}

/// Re-encodes photos before upload.
pub trait PhotoCompressor: Send + Sync + 'static {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CaptureError>;

    /// MIME type of the compressed output.
    fn content_type(&self) -> &'static str;
}

/// Downscales to a maximum width and re-encodes as JPEG.
#[derive(Debug, Clone, Copy)]
pub struct JpegCompressor {
    pub max_width: u32,
    /// 1-100
    pub quality: u8,
}

impl Default for JpegCompressor {
    fn default() -> Self {
        Self { max_width: 1080, quality: 80 }
    }
}

impl PhotoCompressor for JpegCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CaptureError> {
        let img = image::load_from_memory(bytes).map_err(|e| CaptureError::Photo(e.to_string()))?;

        let img = if img.width() > self.max_width {
            img.resize(self.max_width, u32::MAX, FilterType::Triangle)
        } else {
            img
        };

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&img.to_rgb8())
            .map_err(|e| CaptureError::Photo(e.to_string()))?;
        Ok(out)
    }

    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }
}
