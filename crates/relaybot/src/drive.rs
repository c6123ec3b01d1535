//! Google Drive as the storage provider.
//!
//! Authenticates with an OAuth authorized-user document (client id, client
//! secret and refresh token) and keeps a cached access token. Uploads use the
//! resumable protocol so progress can be reported and cancellation observed
//! between chunks.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::GoogleToken;
use crate::progress::ProgressReporter;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const OBJECT_FIELDS: &str = "id, name, size, mimeType, createdTime";

/// Resumable chunks must be multiples of 256 KiB.
const CHUNK_SIZE: usize = 16 * 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub created_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemotePage {
    pub items: Vec<RemoteObject>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Uploads the file, grants public read access and returns the storage id.
    async fn upload(&self, local_path: &Path, name: &str, progress: ProgressReporter) -> Result<String>;

    async fn delete(&self, storage_id: &str) -> Result<()>;

    async fn list(&self, folder_id: &str, page_token: Option<&str>, page_size: u32) -> Result<RemotePage>;

    /// `None` when the object no longer exists.
    async fn metadata(&self, storage_id: &str) -> Result<Option<RemoteObject>>;

    async fn account_email(&self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    created_time: Option<String>,
}

impl From<DriveFile> for RemoteObject {
    fn from(file: DriveFile) -> Self {
        Self {
            name: file.name.unwrap_or_else(|| "unnamed".to_string()),
            size: file
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            mime_type: file.mime_type.unwrap_or_default(),
            created_time: file.created_time,
            id: file.id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct DriveClient {
    http: Client,
    credentials: GoogleToken,
    folder_id: String,
    api_base: String,
    upload_base: String,
    access: AsyncMutex<Option<AccessToken>>,
}

impl DriveClient {
    pub fn new(http: Client, credentials: GoogleToken, folder_id: impl Into<String>) -> Self {
        Self {
            http,
            credentials,
            folder_id: folder_id.into(),
            api_base: API_BASE.to_string(),
            upload_base: UPLOAD_BASE.to_string(),
            access: AsyncMutex::new(None),
        }
    }

    /// Points the client at other Drive hosts, e.g. an emulator.
    pub fn with_endpoints(mut self, api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.upload_base = upload_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn authorized_user(&self) -> Result<AuthorizedUser> {
        let raw = match &self.credentials {
            GoogleToken::Inline(data) => data.clone(),
            GoogleToken::File(path) => tokio::fs::read_to_string(path).await.with_context(|| {
                format!(
                    "Google Drive token not found at {}; set TOKEN_JSON_DATA or TOKEN_JSON_PATH",
                    path.display()
                )
            })?,
        };
        serde_json::from_str(&raw).context("Google token is not a valid authorized-user JSON document")
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.access.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let user = self.authorized_user().await?;
        let token_uri = user.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        debug!("refreshing Google access token");
        let response = self
            .http
            .post(token_uri)
            .form(&[
                ("client_id", user.client_id.as_str()),
                ("client_secret", user.client_secret.as_str()),
                ("refresh_token", user.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .context("Google token refresh request failed")?;
        let refreshed: TokenResponse = ensure_success(response, "Google token refresh")
            .await?
            .json()
            .await
            .context("invalid Google token refresh response")?;

        let lifetime = Duration::from_secs(refreshed.expires_in.unwrap_or(3600).saturating_sub(60));
        *cached = Some(AccessToken {
            value: refreshed.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        info!("Google access token refreshed");
        Ok(refreshed.access_token)
    }

    async fn share_publicly(&self, file_id: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}/files/{file_id}/permissions", self.api_base))
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&json!({
                "type": "anyone",
                "role": "reader",
                "allowFileDiscovery": false,
            }))
            .send()
            .await
            .context("Drive permission request failed")?;
        ensure_success(response, "Drive permission grant").await?;
        info!("shared Drive file {file_id} publicly");
        Ok(())
    }

    async fn start_session(&self, name: &str, total: u64) -> Result<String> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(token)
            .query(&[("uploadType", "resumable"), ("fields", "id")])
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", total)
            .json(&json!({ "name": name, "parents": [self.folder_id] }))
            .send()
            .await
            .context("Drive upload session request failed")?;
        let response = ensure_success(response, "Drive upload session").await?;
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .context("Drive upload session response has no Location header")
    }
}

#[async_trait]
impl StorageProvider for DriveClient {
    async fn upload(&self, local_path: &Path, name: &str, progress: ProgressReporter) -> Result<String> {
        let mut file = File::open(local_path)
            .await
            .with_context(|| format!("failed to open {}", local_path.display()))?;
        let total = file.metadata().await?.len();
        info!("uploading {} ({total} bytes) to Drive as {name:?}", local_path.display());

        let session = self.start_session(name, total).await?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;

        let file_id = loop {
            progress.report(sent, total)?;

            let n = read_chunk(&mut file, &mut buffer).await?;
            let end = sent + n as u64;
            let range = if total == 0 {
                "bytes */0".to_string()
            } else {
                format!("bytes {sent}-{}/{total}", end.saturating_sub(1))
            };

            let response = self
                .http
                .put(&session)
                .header(CONTENT_RANGE, range)
                .header(CONTENT_LENGTH, n)
                .body(buffer[..n].to_vec())
                .send()
                .await
                .context("Drive chunk upload failed")?;

            match response.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    let created: DriveFile = response
                        .json()
                        .await
                        .context("invalid Drive upload response")?;
                    break created.id;
                }
                StatusCode::PERMANENT_REDIRECT => {
                    // Range: bytes=0-N is what the server persisted so far.
                    let persisted = response
                        .headers()
                        .get(RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.rsplit('-').next())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(|last| last + 1)
                        .unwrap_or(0);
                    if persisted != end {
                        debug!("Drive persisted {persisted} of {end} bytes, rewinding");
                        file.seek(SeekFrom::Start(persisted)).await?;
                    }
                    sent = persisted;
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    bail!("Drive chunk upload failed: {status} - {body}");
                }
            }
        };

        let _ = progress.report(total, total);
        info!("Drive upload complete, file id {file_id}");
        self.share_publicly(&file_id).await?;
        Ok(file_id)
    }

    async fn delete(&self, storage_id: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(format!("{}/files/{storage_id}", self.api_base))
            .bearer_auth(token)
            .send()
            .await
            .context("Drive delete request failed")?;
        ensure_success(response, "Drive delete").await?;
        info!("deleted Drive file {storage_id}");
        Ok(())
    }

    async fn list(&self, folder_id: &str, page_token: Option<&str>, page_size: u32) -> Result<RemotePage> {
        let token = self.access_token().await?;
        let query = format!("'{folder_id}' in parents and trashed = false");
        let fields = format!("nextPageToken, files({OBJECT_FIELDS})");
        let page_size = page_size.to_string();
        let mut params = vec![
            ("q", query.as_str()),
            ("pageSize", page_size.as_str()),
            ("fields", fields.as_str()),
            ("orderBy", "createdTime desc"),
        ];
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token));
        }

        let response = self
            .http
            .get(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&params)
            .send()
            .await
            .context("Drive list request failed")?;
        let list: FileList = ensure_success(response, "Drive list")
            .await?
            .json()
            .await
            .context("invalid Drive list response")?;

        Ok(RemotePage {
            items: list.files.into_iter().map(RemoteObject::from).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn metadata(&self, storage_id: &str) -> Result<Option<RemoteObject>> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}/files/{storage_id}", self.api_base))
            .bearer_auth(token)
            .query(&[("fields", OBJECT_FIELDS)])
            .send()
            .await
            .context("Drive metadata request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let file: DriveFile = ensure_success(response, "Drive metadata")
            .await?
            .json()
            .await
            .context("invalid Drive metadata response")?;
        Ok(Some(file.into()))
    }

    async fn account_email(&self) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct About {
            user: AboutUser,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AboutUser {
            email_address: Option<String>,
        }

        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}/about", self.api_base))
            .bearer_auth(token)
            .query(&[("fields", "user")])
            .send()
            .await
            .context("Drive about request failed")?;
        let about: About = ensure_success(response, "Drive about")
            .await?
            .json()
            .await
            .context("invalid Drive about response")?;
        Ok(about.user.email_address.unwrap_or_else(|| "unknown".to_string()))
    }
}

async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{what} failed: {status} - {body}")
}

/// Fills `buffer` unless the file ends first; returns the byte count.
async fn read_chunk(file: &mut File, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file
            .read(&mut buffer[filled..])
            .await
            .context("failed to read file chunk")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
