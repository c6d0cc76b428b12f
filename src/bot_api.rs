//! Bot HTTP API server
//!
//! Accepts file-relay requests from the ingestor and hosts the relay
//! message queue. All `/api/v1` routes require a JWT; `/health` is open.

use crate::auth::{AuthLayer, error_response, require_jwt};
use crate::message_store::MessageStore;
use crate::types::Result;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Seam over the bot session so the server can send documents without
/// owning the Telegram client type.
#[async_trait]
pub trait FileSender: Send + Sync {
    /// Send a document; returns the sent message id.
    async fn send_document(
        &self,
        recipient_id: i64,
        file_name: &str,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<i32>;
}

#[derive(Clone)]
pub struct BotApiState {
    pub sender: Arc<dyn FileSender>,
    pub store: Arc<MessageStore>,
    pub owner_id: i64,
}

#[derive(Debug, Deserialize)]
struct SendFileBody {
    file_data: Option<String>,
    file_name: Option<String>,
    #[serde(default)]
    caption: String,
    recipient_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EnqueueBody {
    from: Option<String>,
    to: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DequeueParams {
    to: Option<String>,
    after_id: Option<String>,
    limit: Option<usize>,
}

pub fn router(state: BotApiState, auth: AuthLayer) -> Router {
    let api = Router::new()
        .route("/send_file", post(send_file))
        .route("/messages", post(enqueue_message).get(dequeue_messages))
        .route("/messages/:id", delete(acknowledge_message))
        .layer(middleware::from_fn_with_state(auth, require_jwt))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
}

pub async fn serve(state: BotApiState, auth: AuthLayer, addr: SocketAddr) -> Result<()> {
    let app = router(state, auth);
    info!(%addr, "bot API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(crate::types::Error::Io)?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn send_file(State(state): State<BotApiState>, Json(body): Json<SendFileBody>) -> Response {
    let (Some(file_data), Some(file_name)) = (body.file_data, body.file_name) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Bad Request",
            "file_data and file_name are required",
        );
    };

    let bytes = match base64::engine::general_purpose::STANDARD.decode(&file_data) {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Bad Request",
                &format!("file_data is not valid base64: {}", e),
            );
        }
    };

    let recipient = body.recipient_id.unwrap_or(state.owner_id);
    info!(file_name, bytes = bytes.len(), recipient, "sending relayed file");

    match state
        .sender
        .send_document(recipient, &file_name, bytes, &body.caption)
        .await
    {
        Ok(message_id) => Json(serde_json::json!({
            "success": true,
            "message": "File sent successfully",
            "message_id": message_id,
        }))
        .into_response(),
        Err(e) => {
            error!(file_name, "failed to send relayed file: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                &e.to_string(),
            )
        }
    }
}

async fn enqueue_message(
    State(state): State<BotApiState>,
    Json(body): Json<EnqueueBody>,
) -> Response {
    let (Some(from), Some(to), Some(kind)) = (body.from, body.to, body.kind) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Bad Request",
            "from, to and type are required",
        );
    };

    let payload = body.payload.unwrap_or(serde_json::Value::Null);
    match state.store.enqueue(&from, &to, &kind, payload) {
        Ok(message) => Json(serde_json::json!({
            "id": message.id,
            "created_at": message.created_at,
        }))
        .into_response(),
        Err(e) => {
            error!("failed to enqueue relay message: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                &e.to_string(),
            )
        }
    }
}

async fn dequeue_messages(
    State(state): State<BotApiState>,
    Query(params): Query<DequeueParams>,
) -> Response {
    let Some(to) = params.to else {
        return error_response(StatusCode::BAD_REQUEST, "Bad Request", "to is required");
    };
    let limit = params.limit.unwrap_or(10).min(100);

    match state.store.dequeue(&to, params.after_id.as_deref(), limit) {
        Ok((items, next_after_id)) => Json(serde_json::json!({
            "items": items,
            "next_after_id": next_after_id,
        }))
        .into_response(),
        Err(e) => {
            error!("failed to dequeue relay messages: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                &e.to_string(),
            )
        }
    }
}

async fn acknowledge_message(
    State(state): State<BotApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.store.acknowledge(&id) {
        Ok(true) => Json(serde_json::json!({ "success": true })).into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            "Not Found",
            &format!("Unknown message id: {}", id),
        ),
        Err(e) => {
            error!(%id, "failed to acknowledge relay message: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                &e.to_string(),
            )
        }
    }
}
