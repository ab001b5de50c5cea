//! HTTP backend against a PostgREST + object storage API.
//!
//! - Drive, photo and stop rows are inserted through PostgREST
//!   (`/rest/v1/drives`, `/rest/v1/drive_photos`, `/rest/v1/drive_stops`)
//! - Photos go to the storage bucket (`/storage/v1/object/<bucket>/<path>`)
//!   and are referenced by their public URL
//! - Automatic retry with exponential backoff on 429 and transport errors
//!
//! Transport failures that survive the retries surface as
//! [`CaptureError::NetworkUnavailable`] so a publish falls back to the queue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, Connectivity, NewDrive, NewDriveStop};
use crate::CaptureError;

const MAX_RETRIES: u32 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub base_url: String,
    /// Public (anon) API key, sent as `apikey`
    pub api_key: String,
    /// Session token of the signed-in user. Falls back to the API key.
    pub access_token: Option<String>,
    /// Signed-in user. If unset it is looked up with the access token.
    pub user_id: Option<String>,
    /// Default: "drives"
    pub bucket: String,
    /// Per-request timeout. Default: 30s
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            access_token: None,
            user_id: None,
            bucket: "drives".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base(), table)
    }

    fn upload_url(&self, object_path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base(), self.bucket, object_path)
    }

    /// Public URL of an uploaded object.
    pub fn public_url(&self, object_path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base(), self.bucket, object_path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token.as_deref().unwrap_or(&self.api_key))
    }
}

#[derive(Serialize)]
struct DrivePhotoRow<'a> {
    drive_id: &'a str,
    photo_url: &'a str,
    order_index: u32,
}

#[derive(Serialize)]
struct DriveStopRow<'a> {
    drive_id: &'a str,
    name: &'a str,
    description: Option<&'a str>,
    order_index: u32,
}

#[derive(Deserialize)]
struct InsertedRow {
    id: serde_json::Value,
}

#[derive(Deserialize)]
struct AuthUser {
    id: String,
}

/// Row ids may be UUID strings or integers.
fn row_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Backend talking to PostgREST and object storage over HTTPS.
pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
    consecutive_429s: AtomicU32,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self, CaptureError> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(config.timeout)
            .build()
            .map_err(|e| CaptureError::BackendRejected(format!("Failed to create HTTP client: {}", e)))?;

        info!("[HttpBackend] Using {} (bucket {})", config.base(), config.bucket);
        Ok(Self {
            client,
            config,
            consecutive_429s: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.config.api_key)
            .header("Authorization", self.config.bearer())
    }

    fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        // 1s, 2s, 4s max
        Duration::from_millis(500 * (1 << count.min(3)))
    }

    /// Send a request, retrying on 429 and transport errors.
    ///
    /// Non-success statuses other than 429 are returned as
    /// [`CaptureError::BackendRejected`] without retrying.
    async fn send<F>(&self, label: &str, build: F) -> Result<Response, CaptureError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut retries = 0;
        loop {
            match self.authorized(build()).send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            return Err(CaptureError::BackendRejected(format!("{}: max retries exceeded (429)", label)));
                        }
                        let wait = self.record_429();
                        warn!("[HttpBackend] {} got 429, retry {} after {:?}", label, retries, wait);
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    self.consecutive_429s.store(0, Ordering::Relaxed);

                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(CaptureError::BackendRejected(format!("{}: HTTP {} {}", label, status, body)));
                    }
                    debug!("[HttpBackend] {} -> {}", label, status);
                    return Ok(resp);
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(CaptureError::NetworkUnavailable(format!("{}: {}", label, e)));
                    }
                    let wait = Duration::from_millis(200 * (1 << retries));
                    warn!("[HttpBackend] {} error: {}, retry {} after {:?}", label, e, retries, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn insert<T: Serialize + Sync>(&self, table: &str, row: &T, return_row: bool) -> Result<Response, CaptureError> {
        let url = self.config.rest_url(table);
        let prefer = if return_row { "return=representation" } else { "return=minimal" };
        self.send(table, || self.client.post(&url).header("Prefer", prefer).json(row)).await
    }
}

impl Backend for HttpBackend {
    async fn current_user_id(&self) -> Result<String, CaptureError> {
        if let Some(id) = &self.config.user_id {
            return Ok(id.clone());
        }
        if self.config.access_token.is_none() {
            return Err(CaptureError::NotSignedIn);
        }

        let url = format!("{}/auth/v1/user", self.config.base());
        let resp = match self.send("auth/user", || self.client.get(&url)).await {
            Err(CaptureError::BackendRejected(msg)) => {
                debug!("[HttpBackend] Session lookup rejected: {}", msg);
                return Err(CaptureError::NotSignedIn);
            }
            other => other?,
        };
        let user: AuthUser = resp
            .json()
            .await
            .map_err(|e| CaptureError::Serialization(format!("auth/user: {}", e)))?;
        Ok(user.id)
    }

    async fn create_drive(&self, drive: &NewDrive) -> Result<String, CaptureError> {
        let resp = self.insert("drives", drive, true).await?;
        let rows: Vec<InsertedRow> = resp
            .json()
            .await
            .map_err(|e| CaptureError::Serialization(format!("drives: {}", e)))?;
        rows.first()
            .and_then(|row| row_id(&row.id))
            .ok_or_else(|| CaptureError::BackendRejected("drives: insert returned no id".to_string()))
    }

    async fn create_drive_photo(&self, drive_id: &str, photo_url: &str, order_index: u32) -> Result<(), CaptureError> {
        let row = DrivePhotoRow { drive_id, photo_url, order_index };
        self.insert("drive_photos", &row, false).await.map(drop)
    }

    async fn create_drive_stop(&self, drive_id: &str, stop: &NewDriveStop) -> Result<(), CaptureError> {
        let row = DriveStopRow {
            drive_id,
            name: &stop.name,
            description: stop.description.as_deref(),
            order_index: stop.order_index,
        };
        self.insert("drive_stops", &row, false).await.map(drop)
    }

    async fn upload_media(&self, object_path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, CaptureError> {
        let url = self.config.upload_url(object_path);
        let size = bytes.len();
        self.send("storage", || {
            self.client
                .post(&url)
                .header("Content-Type", content_type)
                .header("x-upsert", "false")
                .body(bytes.clone())
        })
        .await?;

        debug!("[HttpBackend] Uploaded {} ({}KB)", object_path, size / 1024);
        Ok(self.config.public_url(object_path))
    }
}

impl Connectivity for HttpBackend {
    /// Any HTTP response counts as reachable; only transport failures do not.
    async fn is_connected(&self) -> bool {
        let probe = self
            .authorized(self.client.get(format!("{}/rest/v1/", self.config.base())))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match probe {
            Ok(_) => true,
            Err(e) => {
                debug!("[HttpBackend] Reachability probe failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackendConfig {
        BackendConfig::new("https://abc.example.co/", "anon-key")
    }

    #[test]
    fn test_urls() {
        let config = config();
        assert_eq!(config.rest_url("drives"), "https://abc.example.co/rest/v1/drives");
        assert_eq!(
            config.upload_url("drives/d1/1_0.jpg"),
            "https://abc.example.co/storage/v1/object/drives/drives/d1/1_0.jpg"
        );
        assert_eq!(
            config.public_url("drives/d1/1_0.jpg"),
            "https://abc.example.co/storage/v1/object/public/drives/drives/d1/1_0.jpg"
        );
    }

    #[test]
    fn test_bearer_prefers_session_token() {
        let mut config = config();
        assert_eq!(config.bearer(), "Bearer anon-key");
        config.access_token = Some("session".into());
        assert_eq!(config.bearer(), "Bearer session");
    }

    #[test]
    fn test_row_id_accepts_uuid_and_integer() {
        assert_eq!(row_id(&serde_json::json!("9b2c")), Some("9b2c".to_string()));
        assert_eq!(row_id(&serde_json::json!(42)), Some("42".to_string()));
        assert_eq!(row_id(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_stop_row_shape() {
        let row = DriveStopRow { drive_id: "d1", name: "Cafe", description: None, order_index: 2 };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["order_index"], 2);
        assert!(json["description"].is_null());
    }

    #[tokio::test]
    async fn test_signed_out_without_session() {
        let backend = HttpBackend::new(config()).unwrap();
        assert!(matches!(backend.current_user_id().await, Err(CaptureError::NotSignedIn)));

        let mut with_user = config();
        with_user.user_id = Some("u1".into());
        let backend = HttpBackend::new(with_user).unwrap();
        assert_eq!(backend.current_user_id().await.unwrap(), "u1");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_offline() {
        let mut config = BackendConfig::new("http://127.0.0.1:9", "anon-key");
        config.timeout = Duration::from_secs(2);
        let backend = HttpBackend::new(config).unwrap();
        assert!(!backend.is_connected().await);
    }
}
