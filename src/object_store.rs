//! Thin REST client against the remote object store, grounded 1:1 on
//! `original_source/src/drive_manager.py`'s three operations. Retries are a
//! plain loop rather than a decorator (Rust has no decorators), ported from
//! `original_source/utils/helpers.py::retry_on_failure`'s exponential
//! backoff shape — the teacher itself never needed a retry helper, so this
//! one piece of ambient plumbing is grounded directly in the source rather
//! than in `numbleroot-autotube`.

use crate::errors::CoordinatorError;
use crate::models::MediaFile;
use tracing::{event, Level};

#[derive(Debug, Clone)]
pub(crate) struct DriveFile {
    pub id: String,
    pub name: String,
    pub parent_folder_id: String,
    pub view_url: String,
}

#[derive(Clone)]
pub(crate) struct ObjectStoreClient {
    http: reqwest::Client,
    max_retries: u8,
    retry_delay_secs: u64,
}

impl ObjectStoreClient {
    pub(crate) fn new(http: reqwest::Client, max_retries: u8, retry_delay_secs: u64) -> Self {
        Self {
            http,
            max_retries,
            retry_delay_secs,
        }
    }

    /// Create a child folder, shared-drive aware (`supportsAllDrives`).
    pub(crate) async fn create_folder(
        &self,
        name: &str,
        parent_id: &str,
    ) -> Result<String, CoordinatorError> {
        let body = serde_json::json!({
            "name": name,
            "mimeType": "application/vnd.google-apps.folder",
            "parents": [parent_id],
        });

        let resp = self
            .http
            .post("https://www.googleapis.com/drive/v3/files")
            .query(&[("fields", "id"), ("supportsAllDrives", "true")])
            .json(&body)
            .send()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_http_error(status, "create_folder"));
        }

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
        parsed["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CoordinatorError::Permanent("create_folder response missing id".into()))
    }

    /// List-by-name probe, trashed items excluded.
    pub(crate) async fn file_exists(
        &self,
        name: &str,
        folder_id: &str,
    ) -> Result<(bool, Option<String>), CoordinatorError> {
        let query = format!("name = '{name}' and '{folder_id}' in parents and trashed = false");
        let resp = self
            .http
            .get("https://www.googleapis.com/drive/v3/files")
            .query(&[
                ("q", query.as_str()),
                ("spaces", "drive"),
                ("fields", "files(id, name)"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            // If there's an error checking, assume the file doesn't exist,
            // matching the source's fail-open stance for this probe.
            event!(Level::WARN, "file_exists probe failed with {}", resp.status());
            return Ok((false, None));
        }

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
        let files = parsed["files"].as_array().cloned().unwrap_or_default();
        if let Some(first) = files.first() {
            let id = first["id"].as_str().map(str::to_string);
            return Ok((true, id));
        }
        Ok((false, None))
    }

    async fn upload_file(
        &self,
        media_file: &MediaFile,
        folder_id: &str,
    ) -> Result<DriveFile, CoordinatorError> {
        let file = tokio::fs::File::open(&media_file.path)
            .await
            .map_err(|e| CoordinatorError::Permanent(e.to_string()))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| CoordinatorError::Permanent(e.to_string()))?
            .len();
        // Stream the file into the request body instead of buffering it
        // whole in memory: scratch videos routinely run into the hundreds
        // of megabytes.
        let stream = tokio_util::io::ReaderStream::new(file);
        let media_part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(stream),
            size,
        );

        let metadata = serde_json::json!({
            "name": media_file.filename,
            "parents": [folder_id],
        });
        let form = reqwest::multipart::Form::new()
            .part(
                "metadata",
                reqwest::multipart::Part::text(metadata.to_string())
                    .mime_str("application/json")
                    .map_err(|e| CoordinatorError::Permanent(e.to_string()))?,
            )
            .part("media", media_part);

        let resp = self
            .http
            .post("https://www.googleapis.com/upload/drive/v3/files")
            .query(&[("uploadType", "multipart"), ("fields", "id"), ("supportsAllDrives", "true")])
            .multipart(form)
            .send()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_http_error(status, "upload_file"));
        }

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoordinatorError::Transient(e.to_string()))?;
        let id = parsed["id"]
            .as_str()
            .ok_or_else(|| CoordinatorError::Permanent("upload response missing id".into()))?
            .to_string();

        Ok(DriveFile {
            view_url: format!("https://drive.google.com/file/d/{id}/view"),
            id,
            name: media_file.filename.clone(),
            parent_folder_id: folder_id.to_string(),
        })
    }

    /// Upload wrapped in exponential-backoff retry (spec §4.5).
    async fn upload_with_retry(
        &self,
        media_file: &MediaFile,
        folder_id: &str,
    ) -> Result<DriveFile, CoordinatorError> {
        let mut attempt: u8 = 0;
        loop {
            match self.upload_file(media_file, folder_id).await {
                Ok(f) => return Ok(f),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let wait_secs = self.retry_delay_secs.saturating_mul(1u64 << attempt);
                    event!(
                        Level::WARN,
                        "upload_file failed (attempt {}/{}), retrying in {wait_secs}s: {e}",
                        attempt + 1,
                        self.max_retries + 1,
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;
                    attempt += 1;
                }
                Err(e) => {
                    event!(Level::ERROR, "upload_file exhausted retries: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// If the name already exists in that folder, return the existing id
    /// without uploading; otherwise upload.
    pub(crate) async fn upload_if_absent(
        &self,
        media_file: &MediaFile,
        folder_id: &str,
    ) -> Result<(bool, DriveFile), CoordinatorError> {
        let (exists, existing_id) = self.file_exists(&media_file.filename, folder_id).await?;
        if exists {
            let id = existing_id.unwrap_or_default();
            return Ok((
                false,
                DriveFile {
                    view_url: format!("https://drive.google.com/file/d/{id}/view"),
                    id,
                    name: media_file.filename.clone(),
                    parent_folder_id: folder_id.to_string(),
                },
            ));
        }

        let file = self.upload_with_retry(media_file, folder_id).await?;
        Ok((true, file))
    }
}

fn classify_http_error(status: reqwest::StatusCode, op: &str) -> CoordinatorError {
    if status.as_u16() == 429 || status.is_server_error() {
        CoordinatorError::Transient(format!("{op} returned {status}"))
    } else {
        CoordinatorError::Permanent(format!("{op} returned {status}"))
    }
}
