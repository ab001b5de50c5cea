//! External collaborators of the publish path.
//!
//! The hosted backend (record creation + media storage) and the network
//! reachability probe are traits so the pipeline and the queue drainer can
//! run against any implementation. The `http` feature provides one.

use std::future::Future;

use serde::Serialize;

use crate::metrics::RouteData;
use crate::publish::DriveTag;
use crate::CaptureError;

/// Payload of the drive record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewDrive {
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    /// `None` when the user left the rating at 0
    pub rating: Option<u8>,
    pub route_data: Option<RouteData>,
    pub tags: Vec<DriveTag>,
}

/// Payload of a stop attached to a drive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewDriveStop {
    pub name: String,
    pub description: Option<String>,
    pub order_index: u32,
}

/// Hosted backend used to persist published drives.
///
/// Implementations should report transport failures as
/// [`CaptureError::NetworkUnavailable`] and refusals as
/// [`CaptureError::BackendRejected`]; the publish path routes the former to
/// the upload queue.
pub trait Backend: Send + Sync {
    /// Id of the signed-in user, or [`CaptureError::NotSignedIn`].
    fn current_user_id(&self) -> impl Future<Output = Result<String, CaptureError>> + Send;

    /// Create the drive record and return its id.
    fn create_drive(&self, drive: &NewDrive) -> impl Future<Output = Result<String, CaptureError>> + Send;

    fn create_drive_photo(
        &self,
        drive_id: &str,
        photo_url: &str,
        order_index: u32,
    ) -> impl Future<Output = Result<(), CaptureError>> + Send;

    fn create_drive_stop(
        &self,
        drive_id: &str,
        stop: &NewDriveStop,
    ) -> impl Future<Output = Result<(), CaptureError>> + Send;

    /// Upload media bytes under `object_path`; returns the public URL.
    fn upload_media(
        &self,
        object_path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = Result<String, CaptureError>> + Send;
}

/// Network reachability check made before a publish attempt.
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> impl Future<Output = bool> + Send;
}

/// Object path of an uploaded drive photo.
pub fn photo_object_path(drive_id: &str, timestamp_ms: i64, index: usize) -> String {
    format!("drives/{}/{}_{}.jpg", drive_id, timestamp_ms, index)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Backend that records every call in memory.
    #[derive(Default)]
    pub struct FakeBackend {
        pub offline: AtomicBool,
        /// Calls fail as unreachable while `is_connected` still reports online
        pub connection_drops: AtomicBool,
        pub reject_drives: AtomicBool,
        pub signed_out: AtomicBool,
        /// Upload indices (by call order) that fail
        pub failing_uploads: Mutex<HashSet<usize>>,
        pub drives: Mutex<Vec<NewDrive>>,
        pub photos: Mutex<Vec<(String, String, u32)>>,
        pub stops: Mutex<Vec<(String, NewDriveStop)>>,
        pub uploads: Mutex<Vec<(String, usize, String)>>,
        upload_calls: AtomicUsize,
    }

    impl FakeBackend {
        fn check_online(&self) -> Result<(), CaptureError> {
            if self.offline.load(Ordering::SeqCst) {
                Err(CaptureError::NetworkUnavailable("offline".into()))
            } else if self.connection_drops.load(Ordering::SeqCst) {
                Err(CaptureError::NetworkUnavailable("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    impl Backend for FakeBackend {
        async fn current_user_id(&self) -> Result<String, CaptureError> {
            if self.signed_out.load(Ordering::SeqCst) {
                return Err(CaptureError::NotSignedIn);
            }
            Ok("user-1".into())
        }

        async fn create_drive(&self, drive: &NewDrive) -> Result<String, CaptureError> {
            self.check_online()?;
            if self.reject_drives.load(Ordering::SeqCst) {
                return Err(CaptureError::BackendRejected("HTTP 400".into()));
            }
            let mut drives = self.drives.lock().unwrap();
            drives.push(drive.clone());
            Ok(format!("drive-{}", drives.len()))
        }

        async fn create_drive_photo(&self, drive_id: &str, photo_url: &str, order_index: u32) -> Result<(), CaptureError> {
            self.check_online()?;
            self.photos.lock().unwrap().push((drive_id.into(), photo_url.into(), order_index));
            Ok(())
        }

        async fn create_drive_stop(&self, drive_id: &str, stop: &NewDriveStop) -> Result<(), CaptureError> {
            self.check_online()?;
            self.stops.lock().unwrap().push((drive_id.into(), stop.clone()));
            Ok(())
        }

        async fn upload_media(&self, object_path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, CaptureError> {
            self.check_online()?;
            let call = self.upload_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_uploads.lock().unwrap().contains(&call) {
                return Err(CaptureError::BackendRejected("HTTP 413".into()));
            }
            self.uploads.lock().unwrap().push((object_path.into(), bytes.len(), content_type.into()));
            Ok(format!("https://cdn.example/{}", object_path))
        }
    }

    impl Connectivity for FakeBackend {
        async fn is_connected(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }
    }
}
