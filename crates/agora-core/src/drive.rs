//! Google Drive v3 adapter for [`RemoteStore`].
//!
//! Authenticates with a service-account key: an RS256-signed JWT assertion is exchanged
//! for a bearer token, which is cached until shortly before it expires. A fixed access
//! token can be supplied instead.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::remote::{FileQuery, RemoteError, RemoteFile, RemoteStore, FOLDER_MIME};

pub const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
pub const UPLOAD_API: &str = "https://www.googleapis.com/upload/drive/v3";
pub const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

const JWT_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they expire.
const TOKEN_MARGIN_SECS: i64 = 60;
const MULTIPART_BOUNDARY: &str = "agora-upload-boundary";

/// The fields of a Google service-account key file that token minting needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountKey {
    pub fn from_json(json: &str) -> Result<Self, RemoteError> {
        serde_json::from_str(json).map_err(|e| RemoteError::Credentials(e.to_string()))
    }
}

enum DriveAuth {
    Static(String),
    ServiceAccount {
        key: ServiceAccountKey,
        encoding_key: EncodingKey,
    },
}

struct CachedToken {
    token: String,
    expires_at: i64,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteFile>,
    next_page_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewFile<'a> {
    name: &'a str,
    parents: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
}

/// Google Drive [`RemoteStore`].
pub struct DriveStore {
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
    auth: DriveAuth,
    token: Mutex<Option<CachedToken>>,
}

impl DriveStore {
    /// Authenticates as the service account in `key`.
    pub fn with_service_account(key: ServiceAccountKey, timeout: Duration) -> Result<Self, RemoteError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| RemoteError::Credentials(format!("bad private key: {e}")))?;
        Self::with_auth(DriveAuth::ServiceAccount { key, encoding_key }, timeout)
    }

    /// Authenticates with the contents of a service-account key file.
    pub fn from_credentials_json(json: &str, timeout: Duration) -> Result<Self, RemoteError> {
        Self::with_service_account(ServiceAccountKey::from_json(json)?, timeout)
    }

    /// Uses a fixed bearer token.
    pub fn with_access_token(token: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        Self::with_auth(DriveAuth::Static(token.into()), timeout)
    }

    fn with_auth(auth: DriveAuth, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Request(e.to_string()))?;
        Ok(Self {
            client,
            api_base: DRIVE_API.to_string(),
            upload_base: UPLOAD_API.to_string(),
            auth,
            token: Mutex::new(None),
        })
    }

    /// Points the client at other API roots (a proxy or a test server).
    pub fn with_base_urls(mut self, api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.upload_base = upload_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn access_token(&self) -> Result<String, RemoteError> {
        let (key, encoding_key) = match &self.auth {
            DriveAuth::Static(token) => return Ok(token.clone()),
            DriveAuth::ServiceAccount { key, encoding_key } => (key, encoding_key),
        };
        let mut cached = self.token.lock().await;
        let now = Utc::now().timestamp();
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at - TOKEN_MARGIN_SECS > now) {
            return Ok(token.token.clone());
        }

        let token_uri = key.token_uri.as_deref().unwrap_or(TOKEN_URI);
        let claims = Claims {
            iss: &key.client_email,
            scope: DRIVE_SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, encoding_key)
            .map_err(|e| RemoteError::Credentials(format!("cannot sign token request: {e}")))?;
        let response = self
            .client
            .post(token_uri)
            .form(&[("grant_type", JWT_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(request_error)?;
        let response = check(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Auth(format!("bad token response: {e}")))?;
        debug!(client = %key.client_email, "obtained remote store access token");
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: now + token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS),
        });
        Ok(token.access_token)
    }
}

/// Drive query string: `'<parent>' in parents and trashed = false [and name = ..] [and mimeType = ..]`.
fn build_query(parent: &str, query: &FileQuery) -> String {
    let mut q = format!("'{}' in parents and trashed = false", escape(parent));
    if let Some(name) = &query.name {
        q.push_str(&format!(" and name = '{}'", escape(name)));
    }
    if let Some(mime) = &query.mime_type {
        q.push_str(&format!(" and mimeType = '{}'", escape(mime)));
    }
    q
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn request_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Request(e.to_string())
}

/// Maps non-success statuses to errors; 401/403 are authentication failures.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.pointer("/error_description"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);
    match status.as_u16() {
        401 | 403 => Err(RemoteError::Auth(message)),
        code => Err(RemoteError::Status {
            status: code,
            message,
        }),
    }
}

/// `multipart/related` body: JSON metadata part, then the media part.
fn multipart_body(metadata: &NewFile<'_>, content: &[u8]) -> Result<Vec<u8>, RemoteError> {
    let metadata = serde_json::to_string(metadata).map_err(|e| RemoteError::Request(e.to_string()))?;
    let mut body = Vec::with_capacity(content.len() + metadata.len() + 256);
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
             --{MULTIPART_BOUNDARY}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    Ok(body)
}

#[async_trait]
impl RemoteStore for DriveStore {
    async fn list(&self, parent: &str, query: &FileQuery) -> Result<Vec<RemoteFile>, RemoteError> {
        let q = build_query(parent, query);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = self.access_token().await?;
            let mut request = self
                .client
                .get(format!("{}/files", self.api_base))
                .bearer_auth(token)
                .query(&[
                    ("q", q.as_str()),
                    ("fields", "nextPageToken, files(id, name)"),
                    ("pageSize", "1000"),
                ]);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }
            let response = check(request.send().await.map_err(request_error)?).await?;
            let page: FileList = response
                .json()
                .await
                .map_err(|e| RemoteError::Request(format!("bad file list: {e}")))?;
            files.extend(page.files);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        debug!(parent, query = %q, found = files.len(), "listed remote files");
        Ok(files)
    }

    async fn download_to(&self, file_id: &str, dest: &Path) -> Result<u64, RemoteError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}/files/{}", self.api_base, file_id))
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(request_error)?;
        let mut response = check(response).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        debug!(file_id, bytes = written, "downloaded remote file");
        Ok(written)
    }

    async fn create(&self, parent: &str, name: &str, content: Vec<u8>) -> Result<RemoteFile, RemoteError> {
        let token = self.access_token().await?;
        let metadata = NewFile {
            name,
            parents: [parent],
            mime_type: None,
        };
        let response = self
            .client
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("fields", "id, name")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            )
            .body(multipart_body(&metadata, &content)?)
            .send()
            .await
            .map_err(request_error)?;
        let file: RemoteFile = check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Request(format!("bad create response: {e}")))?;
        info!(name, id = %file.id, "created remote file");
        Ok(file)
    }

    async fn update(&self, file_id: &str, content: Vec<u8>) -> Result<(), RemoteError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .patch(format!("{}/files/{}", self.upload_base, file_id))
            .bearer_auth(token)
            .query(&[("uploadType", "media")])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await
            .map_err(request_error)?;
        check(response).await?;
        info!(file_id, "updated remote file");
        Ok(())
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteFile, RemoteError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[("fields", "id, name")])
            .json(&NewFile {
                name,
                parents: [parent],
                mime_type: Some(FOLDER_MIME),
            })
            .send()
            .await
            .map_err(request_error)?;
        let folder: RemoteFile = check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Request(format!("bad create response: {e}")))?;
        info!(name, id = %folder.id, "created remote folder");
        Ok(folder)
    }
}
