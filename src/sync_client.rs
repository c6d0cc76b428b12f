//! Bot-side client for the ingestor's Sync Control API

use crate::auth::JwtAuth;
use crate::sync::SyncProgress;
use crate::types::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Response to sync commands (enqueue, pause, resume).
#[derive(Debug, Clone, Deserialize)]
pub struct SyncCommandResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub chat_id: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Response to status queries.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncStatusResponse {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub chats: Vec<SyncProgress>,
}

/// HTTP client for the ingestor's sync endpoints. Mints a fresh token per
/// request with issuer `bot` and audience `userbot`.
pub struct SyncHttpClient {
    base_url: String,
    http: reqwest::Client,
    auth: Option<Arc<JwtAuth>>,
}

impl SyncHttpClient {
    pub fn new(base_url: &str, timeout_secs: u64, auth: Option<Arc<JwtAuth>>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            auth,
        })
    }

    fn bearer(&self) -> Result<Option<String>> {
        match &self.auth {
            Some(auth) => Ok(Some(auth.mint(Some("userbot"))?)),
            None => Ok(None),
        }
    }

    async fn post_command(&self, path: &str, chat_id: i64, requested_by: Option<i64>) -> Result<SyncCommandResponse> {
        let url = format!("{}{}", self.base_url, path);
        let mut body = serde_json::json!({ "chat_id": chat_id });
        if let Some(uid) = requested_by {
            body["requested_by"] = serde_json::json!(uid);
        }

        let mut req = self.http.post(&url).json(&body);
        if let Some(token) = self.bearer()? {
            req = req.bearer_auth(token);
        }
        let response = req.send().await?;
        let status = response.status();
        debug!(%url, %status, chat_id, "sync command sent");

        // Conflict responses carry the same body shape with success=false.
        if status.is_success() || status.as_u16() == 409 || status.as_u16() == 400 {
            Ok(response.json().await?)
        } else {
            Err(Error::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }

    /// Enroll a chat for history sync.
    pub async fn add_sync(&self, chat_id: i64, requested_by: Option<i64>) -> Result<SyncCommandResponse> {
        self.post_command("/api/v1/sync", chat_id, requested_by).await
    }

    pub async fn pause_sync(&self, chat_id: i64) -> Result<SyncCommandResponse> {
        self.post_command("/api/v1/sync/pause", chat_id, None).await
    }

    pub async fn resume_sync(&self, chat_id: i64) -> Result<SyncCommandResponse> {
        self.post_command("/api/v1/sync/resume", chat_id, None).await
    }

    /// Sync status for one chat or all chats.
    pub async fn sync_status(&self, chat_id: Option<i64>) -> Result<SyncStatusResponse> {
        let mut url = format!("{}/api/v1/sync/status", self.base_url);
        if let Some(id) = chat_id {
            url = format!("{}?chat_id={}", url, id);
        }

        let mut req = self.http.get(&url);
        if let Some(token) = self.bearer()? {
            req = req.bearer_auth(token);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// True when the sync API answers its health endpoint.
    pub async fn health(&self) -> bool {
        #[derive(Deserialize)]
        struct Health {
            #[serde(default)]
            status: String,
        }
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(r) => r
                .json::<Health>()
                .await
                .map(|h| h.status == "healthy")
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}
