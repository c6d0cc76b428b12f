//! Ingestor-side client for the bot's HTTP API
//!
//! Used to relay files to the owner through the bot session and to drop
//! asynchronous notifications into the bot's message queue.

use crate::auth::JwtAuth;
use crate::types::{Error, Result};
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub struct SendFileResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_id: i32,
}

/// Acknowledgement for an enqueued relay message.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueAck {
    pub id: String,
    #[serde(default)]
    pub created_at: String,
}

/// HTTP client for the bot API. Mints a fresh token per request with issuer
/// `userbot` and audience `bot`.
pub struct BotHttpClient {
    base_url: String,
    http: reqwest::Client,
    auth: Option<Arc<JwtAuth>>,
}

impl BotHttpClient {
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
            Some(auth) => Ok(Some(auth.mint(Some("bot"))?)),
            None => Ok(None),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url).json(&body);
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
        Ok(response)
    }

    /// Relay a file to the owner (or an explicit recipient) via the bot.
    pub async fn send_file(
        &self,
        file_name: &str,
        data: &[u8],
        caption: &str,
        recipient_id: Option<i64>,
    ) -> Result<SendFileResponse> {
        let mut body = serde_json::json!({
            "file_data": base64::engine::general_purpose::STANDARD.encode(data),
            "file_name": file_name,
            "caption": caption,
        });
        if let Some(recipient) = recipient_id {
            body["recipient_id"] = serde_json::json!(recipient);
        }

        info!(file_name, bytes = data.len(), "relaying file via bot API");
        let response = self.post("/api/v1/send_file", body).await?;
        Ok(response.json().await?)
    }

    /// Drop a notification into the bot's relay queue.
    pub async fn enqueue_message(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<EnqueueAck> {
        let body = serde_json::json!({
            "from": "userbot",
            "to": "bot",
            "type": kind,
            "payload": payload,
        });
        debug!(kind, "enqueueing relay message");
        let response = self.post("/api/v1/messages", body).await?;
        Ok(response.json().await?)
    }

    /// True when the bot API answers its health endpoint.
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
