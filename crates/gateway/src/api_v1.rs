//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST /v1/chat/stream`                     — Run one turn, receive an SSE event stream
//! - `POST /v1/threads/{threadId}/messages`     — Append a message to a thread
//! - `GET  /v1/threads/{threadId}/messages`     — Full thread history
//! - `GET  /v1/threads/{threadId}/messages/last`— Most recent message of a thread
//! - `POST /v1/documents/extract`               — Extract text from an uploaded document
//! - `GET  /v1/events`                          — SSE stream of domain events
//!
//! Thread routes are scoped by the `X-Org-Id` header.

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::Json,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parley_agent::TurnRequest;
use parley_core::document::Extraction;
use parley_core::error::StoreError;
use parley_core::message::Message;
use parley_core::stream::ChatRequest;

use crate::{ORG_HEADER, SharedState};

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat/stream", post(chat_stream_handler))
        .route(
            "/threads/{thread_id}/messages",
            post(append_message_handler).get(history_handler),
        )
        .route("/threads/{thread_id}/messages/last", get(last_message_handler))
        .route("/documents/extract", post(extract_document_handler))
        .route("/events", get(event_stream_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub id: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: message.into() }))
}

fn store_error(err: StoreError) -> ApiError {
    let status = match &err {
        StoreError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        StoreError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, "Store request failed");
    api_error(status, err.to_string())
}

fn org_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(ORG_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing X-Org-Id header"))
}

// ── Chat stream ───────────────────────────────────────────────────────────

/// `POST /v1/chat/stream` — Run one turn and stream its events.
///
/// The turn is cancelled when the response stream is dropped, i.e. when
/// the client disconnects.
async fn chat_stream_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if payload.new_message_text.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "newMessageText must not be empty"));
    }
    if payload.thread_id.is_empty() || payload.org_id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "threadId and orgId are required"));
    }

    info!(
        thread_id = %payload.thread_id,
        history = payload.history.len(),
        files = payload.file_manifest.len(),
        "v1/chat/stream request"
    );

    let mut user_message = Message::user(payload.new_message_text.trim());
    if let Some(id) = payload.message_id {
        user_message.id = id;
    }
    let profile = state.profiles.load(&payload.user_id, &payload.org_id).await;

    let request = TurnRequest {
        thread_id: payload.thread_id,
        org_id: payload.org_id,
        user_id: payload.user_id,
        history: payload.history,
        user_message,
        files: payload.file_manifest,
        profile,
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let rx = state.engine.run_stream(request, cancel);

    let stream = ReceiverStream::new(rx).map(move |event| {
        let _alive = &guard;
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.event_type()).data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── Threads ───────────────────────────────────────────────────────────────

/// `POST /v1/threads/{threadId}/messages`
async fn append_message_handler(
    State(state): State<SharedState>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    Json(message): Json<Message>,
) -> Result<(StatusCode, Json<AppendResponse>), ApiError> {
    let org_id = org_id(&headers)?;
    let id = state
        .store
        .append(&thread_id, &org_id, &message)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(AppendResponse { id })))
}

/// `GET /v1/threads/{threadId}/messages`
async fn history_handler(
    State(state): State<SharedState>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, ApiError> {
    let org_id = org_id(&headers)?;
    let messages = state.store.history(&thread_id, &org_id).await.map_err(store_error)?;
    Ok(Json(messages))
}

/// `GET /v1/threads/{threadId}/messages/last` — `null` for an empty thread.
async fn last_message_handler(
    State(state): State<SharedState>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Option<Message>>, ApiError> {
    let org_id = org_id(&headers)?;
    let message = state
        .store
        .last_message(&thread_id, &org_id)
        .await
        .map_err(store_error)?;
    Ok(Json(message))
}

// ── Documents ─────────────────────────────────────────────────────────────

/// `POST /v1/documents/extract` — body is the raw document, typed by `Content-Type`.
async fn extract_document_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Extraction> {
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    Json(state.extractor.extract(&body, media_type).await)
}

// ── Domain event stream ───────────────────────────────────────────────────

/// `GET /v1/events` — SSE stream of domain events. Lagging subscribers skip ahead.
async fn event_stream_handler(
    State(state): State<SharedState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.engine.event_bus().subscribe();
    let stream = BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .map(|event| {
            let data = serde_json::to_string(event.as_ref()).unwrap_or_default();
            Ok(SseEvent::default().event(event.kind()).data(data))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
