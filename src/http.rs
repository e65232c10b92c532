//! HTTP/WebSocket surface consumed by the UI collaborator (spec.md §6)
//!
//! Deliberately thin: every handler here delegates to the store, sync
//! service, or registry and translates [`AppError`] into the stable
//! `{error, details?}` JSON shape (spec.md §7 "User-visible behavior").

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::AppError;
use crate::listeners::ListenerRegistry;
use crate::notification::BroadcastNotificationSink;
use crate::store::{DateRange, MailStore, SearchCriteria};
use crate::sync::{SyncOptions, SyncReport, SyncService};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MailStore>,
    pub sync_service: Arc<SyncService>,
    pub registry: Arc<ListenerRegistry>,
    pub notifications: Arc<BroadcastNotificationSink>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", post(run_sync))
        .route("/api/sync/status", get(sync_status))
        .route("/api/emails/inbox", get(inbox))
        .route("/api/emails/search", post(search_emails))
        .route("/api/email/{message_id}", get(get_email))
        .route("/api/emails/batch", post(batch_emails))
        .route("/api/listeners", get(list_listeners))
        .route("/api/listener/{filename}", get(get_listener))
        .route("/ws", get(websocket_upgrade))
        .with_state(state)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_body())).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SyncRequestBody {
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    since: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    before: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    from: Vec<String>,
    #[serde(default)]
    to: Vec<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    unread_only: bool,
    #[serde(default)]
    starred_only: bool,
    #[serde(default)]
    has_attachments: Option<bool>,
    #[serde(default)]
    min_size: Option<i64>,
    #[serde(default)]
    max_size: Option<i64>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    exclude_folders: Vec<String>,
}

async fn run_sync(
    State(state): State<AppState>,
    Json(body): Json<SyncRequestBody>,
) -> Result<Json<SyncReport>, AppError> {
    let options = SyncOptions {
        folder: body.folder,
        since: body.since,
        before: body.before,
        from: body.from,
        to: body.to,
        subject: body.subject,
        unread_only: body.unread_only,
        starred_only: body.starred_only,
        has_attachments: body.has_attachments,
        min_size: body.min_size,
        max_size: body.max_size,
        query: body.query,
        limit: body.limit.unwrap_or(30),
        exclude_folders: body.exclude_folders,
    };
    let report = state
        .sync_service
        .sync(&options, crate::store::SyncType::Manual)
        .await?;
    Ok(Json(report))
}

async fn sync_status(
    State(state): State<AppState>,
) -> Result<Json<Option<crate::store::SyncMetadataRow>>, AppError> {
    Ok(Json(state.store.last_sync_run()?))
}

#[derive(Debug, Deserialize)]
struct InboxQuery {
    #[serde(default = "default_inbox_limit")]
    limit: usize,
    #[serde(default)]
    include_read: bool,
}

fn default_inbox_limit() -> usize {
    30
}

async fn inbox(
    State(state): State<AppState>,
    axum::extract::Query(query): axum::extract::Query<InboxQuery>,
) -> Result<Json<Vec<crate::store::Email>>, AppError> {
    Ok(Json(
        state.store.recent_emails(query.limit, query.include_read)?,
    ))
}

#[derive(Debug, Deserialize, Default)]
struct SearchRequestBody {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    from: Vec<String>,
    #[serde(default)]
    to: Vec<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    since: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    before: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    has_attachments: Option<bool>,
    #[serde(default)]
    is_unread: Option<bool>,
    #[serde(default)]
    is_starred: Option<bool>,
    #[serde(default)]
    folders: Vec<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    min_size: Option<i64>,
    #[serde(default)]
    max_size: Option<i64>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    gmail_query: Option<String>,
}

async fn search_emails(
    State(state): State<AppState>,
    Json(body): Json<SearchRequestBody>,
) -> Result<Json<Vec<crate::store::Email>>, AppError> {
    let criteria = SearchCriteria {
        query: body.query,
        from: body.from,
        to: body.to,
        subject: body.subject,
        date_range: if body.since.is_some() || body.before.is_some() {
            Some(DateRange {
                since: body.since,
                before: body.before,
            })
        } else {
            None
        },
        has_attachments: body.has_attachments,
        is_unread: body.is_unread,
        is_starred: body.is_starred,
        folders: body.folders,
        thread_id: body.thread_id,
        labels: body.labels,
        min_size: body.min_size,
        max_size: body.max_size,
        limit: body.limit.unwrap_or(30),
        offset: body.offset.unwrap_or(0),
        gmail_query: body.gmail_query,
    };
    Ok(Json(state.store.search_emails(&criteria)?))
}

async fn get_email(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<crate::store::Email>, AppError> {
    state
        .store
        .get_by_message_id(&message_id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no email with message_id '{message_id}'")))
}

#[derive(Debug, Deserialize)]
struct BatchRequestBody {
    ids: Vec<String>,
}

async fn batch_emails(
    State(state): State<AppState>,
    Json(body): Json<BatchRequestBody>,
) -> Result<Json<Vec<crate::store::Email>>, AppError> {
    Ok(Json(state.store.get_by_message_ids(&body.ids)?))
}

#[derive(Debug, Serialize)]
struct ListenersResponse {
    listeners: Vec<crate::listeners::ListenerConfig>,
    stats: crate::listeners::RegistryStats,
}

async fn list_listeners(State(state): State<AppState>) -> Json<ListenersResponse> {
    Json(ListenersResponse {
        listeners: state.registry.get_all(),
        stats: state.registry.stats(),
    })
}

#[derive(Debug, Serialize)]
struct ListenerSourceResponse {
    config: crate::listeners::ListenerConfig,
    source: String,
}

async fn get_listener(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<ListenerSourceResponse>, AppError> {
    let path = state.registry.directory().join(&filename);
    let source = std::fs::read_to_string(&path)
        .map_err(|_| AppError::NotFound(format!("no listener file '{filename}'")))?;
    let module = crate::listeners::load_module(&path)?;
    Ok(Json(ListenerSourceResponse {
        config: module.config,
        source,
    }))
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Streams `listener_notification` frames to the client; `listeners_update`
/// frames are pushed by the registry's hot-reload watcher via the same
/// broadcast mechanism in `main`.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut receiver = state.notifications.subscribe();
    loop {
        tokio::select! {
            notification = receiver.recv() => {
                match notification {
                    Ok(notification) => {
                        let frame = serde_json::json!({
                            "type": "listener_notification",
                            "payload": notification,
                        });
                        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket client lagged behind notification stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
}
