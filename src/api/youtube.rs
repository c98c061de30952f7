use super::{Publisher, VideoMetadata};
use crate::config::PublishConfig;
use crate::error::{Result, VideoError};
use crate::secrets::{OAuthToken, TokenStore};
use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::Utc;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

const UPLOAD_URL: &str = "https://www.googleapis.com/upload/youtube/v3/videos";
/// Google answers an incomplete resumable chunk with 308.
const RESUME_INCOMPLETE: u16 = 308;
/// Every chunk but the last must be a multiple of this.
const CHUNK_GRANULARITY: usize = 256 * 1024;
const MAX_RESUME_DELAY: Duration = Duration::from_secs(32);

/// OAuth client registration as downloaded from the Google console.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ClientSecretsFile = serde_json::from_str(raw)?;
        file.installed
            .or(file.web)
            .ok_or_else(|| VideoError::Config("client secrets has no 'installed' or 'web' section".into()))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            VideoError::Config(format!("cannot read client secrets {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
}

impl TokenResponse {
    fn into_token(self, previous_refresh: Option<String>) -> OAuthToken {
        OAuthToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".into()),
        }
    }
}

/// Resumable uploads to YouTube with a cached OAuth token.
pub struct YouTubePublisher {
    client: Client,
    secrets: ClientSecrets,
    tokens: Arc<dyn TokenStore>,
    config: PublishConfig,
    upload_url: String,
}

impl YouTubePublisher {
    pub fn new(
        secrets: ClientSecrets,
        tokens: Arc<dyn TokenStore>,
        config: PublishConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VideoError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            secrets,
            tokens,
            config,
            upload_url: UPLOAD_URL.to_string(),
        })
    }

    /// Sends uploads somewhere other than the YouTube upload endpoint.
    pub fn with_upload_url(mut self, upload_url: impl Into<String>) -> Self {
        self.upload_url = upload_url.into();
        self
    }

    fn resume_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.resume_delay)
            .with_max_delay(MAX_RESUME_DELAY)
            .with_max_times(self.config.max_resumes as usize)
    }

    /// Returns a usable access token, refreshing or re-authorizing as needed.
    async fn access_token(&self) -> Result<String> {
        let cached = self.tokens.load().await?;
        let token = match cached {
            Some(token) if !token.is_expired() => token,
            Some(OAuthToken {
                refresh_token: Some(refresh),
                ..
            }) => {
                info!("Access token expired, refreshing...");
                let token = self.refresh(&refresh).await?;
                self.tokens.save(&token).await?;
                token
            }
            _ => {
                let token = self.authorize().await?;
                self.tokens.save(&token).await?;
                token
            }
        };
        Ok(token.access_token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OAuthToken> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.secrets.client_id.as_str()),
            ("client_secret", self.secrets.client_secret.as_str()),
        ];
        let response = self
            .client
            .post(&self.secrets.token_uri)
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VideoError::Auth(format!("token refresh failed: {}", error_text)));
        }
        let tokens: TokenResponse = response.json().await?;
        Ok(tokens.into_token(Some(refresh_token.to_string())))
    }

    /// Installed-app flow: the user opens the consent URL and Google redirects
    /// back to a one-shot listener on the loopback interface.
    async fn authorize(&self) -> Result<OAuthToken> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let redirect_uri = format!("http://127.0.0.1:{}", listener.local_addr()?.port());
        let state = Uuid::new_v4().to_string();

        let auth_url = Url::parse_with_params(
            &self.secrets.auth_uri,
            &[
                ("client_id", self.secrets.client_id.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", self.config.scopes.join(" ").as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| VideoError::Config(format!("bad auth_uri: {}", e)))?;

        info!("Open this URL in a browser to authorize uploads:\n{}", auth_url);

        let (mut socket, _) = listener.accept().await?;
        let mut request_line = String::new();
        BufReader::new(&mut socket).read_line(&mut request_line).await?;
        let outcome = parse_redirect(&request_line, &state);
        let page = match &outcome {
            Ok(_) => "Authorization complete. You can close this window.",
            Err(_) => "Authorization failed. Check the terminal for details.",
        };
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            page.len(),
            page
        );
        socket.write_all(reply.as_bytes()).await?;
        socket.shutdown().await.ok();
        let code = outcome?;

        let params = [
            ("code", code.as_str()),
            ("client_id", self.secrets.client_id.as_str()),
            ("client_secret", self.secrets.client_secret.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];
        let response = self
            .client
            .post(&self.secrets.token_uri)
            .form(&params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(VideoError::Auth(format!("token exchange failed: {}", body)));
        }
        let tokens: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| VideoError::Auth(format!("bad token response: {}", e)))?;
        info!("Authorization granted");
        Ok(tokens.into_token(None))
    }

    async fn start_session(
        &self,
        access_token: &str,
        metadata: &VideoMetadata,
        total: u64,
    ) -> Result<String> {
        let response = self
            .client
            .post(&self.upload_url)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(access_token)
            .header("X-Upload-Content-Length", total.to_string())
            .header("X-Upload-Content-Type", "video/*")
            .json(&upload_body(metadata))
            .send()
            .await
            .map_err(|e| VideoError::Transfer(format!("cannot start upload: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VideoError::Transfer(format!(
                "upload session rejected (HTTP {}): {}",
                status.as_u16(),
                error_text
            )));
        }
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| VideoError::Transfer("upload session has no Location header".into()))
    }

    /// Asks the session how many bytes it holds after an interrupted chunk.
    async fn query_offset(&self, session: &str, access_token: &str, total: u64) -> Result<ChunkOutcome> {
        let response = self
            .client
            .put(session)
            .bearer_auth(access_token)
            .header(CONTENT_LENGTH, "0")
            .header(CONTENT_RANGE, format!("bytes */{}", total))
            .send()
            .await?;
        chunk_outcome(response).await
    }

    async fn send_chunk(
        &self,
        session: &str,
        access_token: &str,
        chunk: Vec<u8>,
        offset: u64,
        total: u64,
    ) -> Result<ChunkOutcome> {
        let end = offset + chunk.len() as u64;
        let response = self
            .client
            .put(session)
            .bearer_auth(access_token)
            .header(CONTENT_TYPE, "video/*")
            .header(CONTENT_RANGE, content_range(offset, end, total))
            .body(chunk)
            .send()
            .await?;
        chunk_outcome(response).await
    }
}

enum ChunkOutcome {
    /// Upload finished; carries the new video id.
    Done(String),
    /// Session holds this many bytes.
    Incomplete(u64),
    /// Server-side hiccup worth resuming after.
    Interrupted(String),
}

async fn chunk_outcome(response: reqwest::Response) -> Result<ChunkOutcome> {
    let status = response.status();
    match status.as_u16() {
        200 | 201 => {
            let body: Value = response.json().await?;
            match body["id"].as_str().filter(|id| !id.is_empty()) {
                Some(id) => Ok(ChunkOutcome::Done(id.to_string())),
                None => Err(VideoError::Transfer(
                    "upload finished without a video id".into(),
                )),
            }
        }
        RESUME_INCOMPLETE => {
            let received = response
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(next_offset)
                .unwrap_or(0);
            Ok(ChunkOutcome::Incomplete(received))
        }
        code if status.is_server_error() => Ok(ChunkOutcome::Interrupted(format!("HTTP {}", code))),
        code => {
            let error_text = response.text().await.unwrap_or_default();
            Err(VideoError::Transfer(format!("HTTP {}: {}", code, error_text)))
        }
    }
}

/// Rounds the configured chunk size down to the upload granularity.
fn upload_chunk_size(requested: usize) -> u64 {
    (requested.max(CHUNK_GRANULARITY) / CHUNK_GRANULARITY * CHUNK_GRANULARITY) as u64
}

/// `Content-Range` for bytes `[start, end)` of `total`.
fn content_range(start: u64, end: u64, total: u64) -> String {
    format!("bytes {}-{}/{}", start, end.saturating_sub(1), total)
}

/// Parses a `Range: bytes=0-N` reply into the next byte to send.
fn next_offset(range: &str) -> Option<u64> {
    let last = range.trim().strip_prefix("bytes=")?.split('-').nth(1)?;
    last.trim().parse::<u64>().ok().map(|n| n + 1)
}

fn upload_body(metadata: &VideoMetadata) -> Value {
    json!({
        "snippet": {
            "title": metadata.title,
            "description": metadata.description,
            "tags": metadata.tags,
            "categoryId": metadata.category,
        },
        "status": {
            "privacyStatus": metadata.privacy_status,
        }
    })
}

/// Pulls the authorization code out of the redirect's request line.
fn parse_redirect(request_line: &str, expected_state: &str) -> Result<String> {
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| VideoError::Auth("malformed redirect request".into()))?;
    let url = Url::parse(&format!("http://127.0.0.1{}", target))
        .map_err(|e| VideoError::Auth(format!("malformed redirect target: {}", e)))?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(VideoError::Auth(format!("authorization denied: {}", value))),
            _ => {}
        }
    }
    if state.as_deref() != Some(expected_state) {
        return Err(VideoError::Auth("state mismatch in redirect".into()));
    }
    code.ok_or_else(|| VideoError::Auth("redirect carried no code".into()))
}

async fn read_chunk(file: &mut tokio::fs::File, offset: u64, len: usize) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl Publisher for YouTubePublisher {
    async fn publish(&self, video: &Path, metadata: &VideoMetadata) -> Result<String> {
        let total = tokio::fs::metadata(video)
            .await
            .map_err(|e| VideoError::Transfer(format!("cannot stat {}: {}", video.display(), e)))?
            .len();
        if total == 0 {
            return Err(VideoError::Transfer(format!("{} is empty", video.display())));
        }

        let access_token = self.access_token().await?;
        info!("Uploading {} ({} bytes) as '{}'", video.display(), total, metadata.title);
        let session = self.start_session(&access_token, metadata, total).await?;

        let mut file = tokio::fs::File::open(video).await?;
        let chunk_size = upload_chunk_size(self.config.chunk_size);
        let mut offset = 0u64;
        let mut resume_delays = self.resume_backoff().build();

        loop {
            let outcome = if offset < total {
                let len = chunk_size.min(total - offset) as usize;
                let chunk = read_chunk(&mut file, offset, len).await?;
                self.send_chunk(&session, &access_token, chunk, offset, total).await
            } else {
                self.query_offset(&session, &access_token, total).await
            };

            let reason = match outcome {
                Ok(ChunkOutcome::Done(id)) => {
                    info!("Upload complete: video id {}", id);
                    return Ok(id);
                }
                Ok(ChunkOutcome::Incomplete(received)) => {
                    offset = received;
                    info!("Uploaded {}%.", offset * 100 / total);
                    continue;
                }
                Ok(ChunkOutcome::Interrupted(reason)) => reason,
                Err(VideoError::Http(e)) => e.to_string(),
                Err(e) => return Err(e),
            };

            let Some(delay) = resume_delays.next() else {
                return Err(VideoError::Transfer(format!(
                    "giving up after {} resumes: {}",
                    self.config.max_resumes, reason
                )));
            };
            warn!("Upload interrupted ({}), resuming in {:?}", reason, delay);
            tokio::time::sleep(delay).await;

            // The session remembers what it already has; ask instead of resending blindly.
            match self.query_offset(&session, &access_token, total).await {
                Ok(ChunkOutcome::Done(id)) => {
                    info!("Upload complete: video id {}", id);
                    return Ok(id);
                }
                Ok(ChunkOutcome::Incomplete(received)) => offset = received,
                Ok(ChunkOutcome::Interrupted(_)) | Err(VideoError::Http(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
}
