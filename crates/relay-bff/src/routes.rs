use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt as _;
use relay_core::{AgentClient, RelayError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::ws;

/// Shared state passed to handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub client: AgentClient,
}

impl AppState {
    pub fn new(client: AgentClient) -> Self {
        Self { client }
    }
}

/// Body of `/v1/chat` and `/v1/chat/stream`, and of each WebSocket message.
#[derive(Clone, Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
}

impl ChatRequest {
    pub fn actor_id(&self) -> &str {
        self.actor_id
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .unwrap_or("default")
    }

    fn session_id_or_new(&self) -> String {
        self.session_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatResponse {
    pub message: String,
    pub session_id: String,
}

/// Error response: `{"detail": ...}` with a status derived from the error.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = match err {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/v1/chat", post(chat))
        .route("/v1/chat/stream", post(chat_stream))
        .route("/v1/ws/chat", get(ws::ws_chat))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn ready() -> Json<serde_json::Value> {
    Json(json!({ "status": "ready" }))
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let session_id = request.session_id_or_new();
    let message = state
        .client
        .invoke(&request.message, &session_id, request.actor_id())
        .await
        .inspect_err(|e| error!(session_id = %session_id, error = %e, "chat invocation failed"))?;
    Ok(Json(ChatResponse {
        message,
        session_id,
    }))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let session_id = request.session_id_or_new();
    let relay = state
        .client
        .invoke_stream(&request.message, &session_id, request.actor_id())?;
    info!(session_id = %session_id, "streaming chat");
    let body = relay
        .into_sse()
        .map(|event| Ok::<_, Infallible>(Bytes::from(event.to_sse())));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body))
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: format!("failed to build SSE response: {e}"),
        })
}
