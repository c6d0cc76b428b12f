//! HTTP client for the search engine
//!
//! The engine is an external service with a fixed REST contract; this module
//! implements the client side only. Calls retry up to `max_retries` times on
//! 5xx responses; timeouts and 4xx are surfaced immediately.

use crate::auth::JwtAuth;
use crate::document::MessageDocument;
use crate::types::{Error, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Long-operation timeout (dedup walks the whole index).
const DEDUP_TIMEOUT: Duration = Duration::from_secs(600);

/// Search request body for `POST /api/v1/search`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchRequest {
    pub keyword: String,
    pub page: u32,
    pub page_size: u32,
    pub exact_match: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_users: Option<Vec<i64>>,
    pub include_deleted: bool,
}

/// Search response from the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub hits: Vec<MessageDocument>,
    #[serde(default)]
    pub total_hits: u64,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_hits_per_page")]
    pub hits_per_page: u32,
    #[serde(default)]
    pub took_ms: u64,
}

fn default_hits_per_page() -> u32 {
    10
}

/// Result of a batch upsert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    #[serde(default)]
    pub indexed_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub total_documents: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupResponse {
    #[serde(default)]
    pub duplicates_found: u64,
    #[serde(default)]
    pub duplicates_removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStatsRequest {
    pub group_id: i64,
    pub user_id: i64,
    pub from_timestamp: i64,
    pub to_timestamp: i64,
    pub include_mentions: bool,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserStatsResponse {
    #[serde(default)]
    pub user_message_count: u64,
    #[serde(default)]
    pub group_message_total: u64,
    #[serde(default)]
    pub user_ratio: f64,
    #[serde(default)]
    pub mentions_out: Option<u64>,
    #[serde(default)]
    pub mentions_in: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeletedCountResponse {
    #[serde(default)]
    deleted_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Client for the search engine REST API.
pub struct SearchHttpClient {
    base_url: String,
    http: reqwest::Client,
    auth: Option<Arc<JwtAuth>>,
    max_retries: u32,
}

impl SearchHttpClient {
    pub fn new(
        base_url: &str,
        timeout_secs: u64,
        max_retries: u32,
        auth: Option<Arc<JwtAuth>>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            auth,
            max_retries: max_retries.max(1),
        })
    }

    async fn request<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 1..=self.max_retries {
            let mut req = self.http.request(method.clone(), &url);
            if let Some(t) = timeout {
                req = req.timeout(t);
            }
            if let Some(auth) = &self.auth {
                req = req.bearer_auth(auth.mint(None)?);
            }
            if let Some(b) = body {
                req = req.json(b);
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => return Err(e.into()),
                Err(e) => {
                    if attempt < self.max_retries {
                        warn!(%url, attempt, error = %e, "search request failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    return Err(e.into());
                }
            };

            let status = response.status();
            if status.is_server_error() && attempt < self.max_retries {
                warn!(%url, attempt, %status, "search engine 5xx, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            if !status.is_success() {
                let message = response
                    .json::<ErrorBody>()
                    .await
                    .map(|e| {
                        if e.message.is_empty() {
                            e.error
                        } else {
                            e.message
                        }
                    })
                    .unwrap_or_else(|_| status.to_string());
                return Err(Error::Http {
                    status: status.as_u16(),
                    message,
                });
            }

            return Ok(response.json::<R>().await?);
        }

        unreachable!("retry loop always returns")
    }

    /// `GET /health` - true when the engine answers healthy.
    pub async fn health(&self) -> bool {
        #[derive(Deserialize)]
        struct Health {
            #[serde(default)]
            status: String,
        }
        match self
            .request::<(), Health>(Method::GET, "/health", None, Some(Duration::from_secs(5)))
            .await
        {
            Ok(h) => h.status == "healthy",
            Err(e) => {
                debug!(error = %e, "search engine health check failed");
                false
            }
        }
    }

    pub async fn ping(&self) -> Result<PingResponse> {
        self.request::<(), _>(Method::GET, "/api/v1/ping", None, None)
            .await
    }

    pub async fn upsert(&self, doc: &MessageDocument) -> Result<()> {
        #[derive(Deserialize)]
        struct Ack {
            #[serde(default)]
            success: bool,
        }
        let ack: Ack = self
            .request(Method::POST, "/api/v1/upsert", Some(doc), None)
            .await?;
        if !ack.success {
            return Err(Error::Search(format!("upsert rejected for {}", doc.id)));
        }
        Ok(())
    }

    pub async fn upsert_batch(&self, docs: &[MessageDocument]) -> Result<BatchOutcome> {
        let body = serde_json::json!({ "messages": docs });
        self.request(Method::POST, "/api/v1/upsert/batch", Some(&body), None)
            .await
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        self.request(Method::POST, "/api/v1/search", Some(req), None)
            .await
    }

    pub async fn clear(&self) -> Result<()> {
        let _: serde_json::Value = self
            .request::<(), _>(Method::DELETE, "/api/v1/clear", None, None)
            .await?;
        Ok(())
    }

    /// Delete every document of one chat; returns the deleted count.
    pub async fn delete_chat(&self, chat_id: i64) -> Result<u64> {
        let path = format!("/api/v1/messages?chat_id={}", chat_id);
        let resp: DeletedCountResponse = self.request::<(), _>(Method::DELETE, &path, None, None).await?;
        Ok(resp.deleted_count)
    }

    /// Delete every document of one sender (privacy opt-out purge).
    pub async fn delete_user(&self, user_id: i64) -> Result<u64> {
        let path = format!("/api/v1/users/{}", user_id);
        let resp: DeletedCountResponse = self.request::<(), _>(Method::DELETE, &path, None, None).await?;
        Ok(resp.deleted_count)
    }

    /// Soft-delete one document; the record stays with `is_deleted` set.
    pub async fn soft_delete(&self, chat_id: i64, message_id: i32) -> Result<()> {
        let body = serde_json::json!({ "chat_id": chat_id, "message_id": message_id });
        let _: serde_json::Value = self
            .request(Method::POST, "/api/v1/messages/soft-delete", Some(&body), None)
            .await?;
        Ok(())
    }

    pub async fn dedup(&self) -> Result<DedupResponse> {
        self.request::<(), _>(Method::POST, "/api/v1/dedup", None, Some(DEDUP_TIMEOUT))
            .await
    }

    /// Purge indexed bot commands; returns the deleted count.
    pub async fn delete_commands(&self) -> Result<u64> {
        let resp: DeletedCountResponse = self
            .request::<(), _>(Method::DELETE, "/api/v1/commands", None, None)
            .await?;
        Ok(resp.deleted_count)
    }

    pub async fn user_stats(&self, req: &UserStatsRequest) -> Result<UserStatsResponse> {
        self.request(Method::POST, "/api/v1/stats/user", Some(req), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_request_omits_unset_filters() {
        let req = SearchRequest {
            keyword: "alpha".into(),
            page: 1,
            page_size: 10,
            exact_match: false,
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["keyword"], "alpha");
        assert!(json.get("chat_type").is_none());
        assert!(json.get("username").is_none());
        assert!(json.get("chat_id").is_none());
        assert!(json.get("blocked_users").is_none());
        assert_eq!(json["include_deleted"], false);
    }

    #[test]
    fn test_search_request_serializes_filters() {
        let req = SearchRequest {
            keyword: "alpha".into(),
            page: 2,
            page_size: 10,
            exact_match: true,
            chat_type: Some("SUPERGROUP".into()),
            username: Some("alice".into()),
            chat_id: Some(-1001),
            blocked_users: Some(vec![7, 8]),
            include_deleted: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["chat_type"], "SUPERGROUP");
        assert_eq!(json["blocked_users"], serde_json::json!([7, 8]));
        assert_eq!(json["exact_match"], true);
    }

    #[test]
    fn test_search_response_defaults() {
        let resp: SearchResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp.hits_per_page, 10);
        assert!(resp.hits.is_empty());
        assert_eq!(resp.total_hits, 0);
    }

    #[test]
    fn test_batch_outcome_parses_engine_shape() {
        let json = serde_json::json!({
            "indexed_count": 98,
            "failed_count": 2,
            "errors": ["bad doc 1", "bad doc 2"]
        });
        let outcome: BatchOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(outcome.indexed_count, 98);
        assert_eq!(outcome.failed_count, 2);
        assert_eq!(outcome.errors.len(), 2);
    }
}
