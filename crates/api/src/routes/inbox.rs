use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use huddle_domain::inbox::{ConversationSummary, InboxEntry, ReconcileReport};
use serde::{Deserialize, Serialize};

use super::snapshot_stream;
use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/inbox", get(list_conversations))
        .route("/v1/inbox/stream", get(stream_conversations))
        .route("/v1/inbox/unread", get(total_unread))
        .route("/v1/inbox/reconcile", post(reconcile))
        .route("/v1/inbox/:chat_id/pin", put(set_pinned))
        .route("/v1/inbox/:chat_id/archive", put(set_archived))
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let actor = auth.session()?;
    let conversations = state.inbox.list_conversations(&actor.user_id).await?;
    Ok(Json(conversations))
}

async fn stream_conversations(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let actor = auth.session()?;
    let snapshots = state.inbox.subscribe_to_user_chats(&actor.user_id).await?;
    Ok(snapshot_stream("conversations", snapshots).into_response())
}

#[derive(Serialize)]
struct UnreadResponse {
    unread: i64,
}

async fn total_unread(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<UnreadResponse>, ApiError> {
    let actor = auth.session()?;
    let unread = state.inbox.total_unread(&actor.user_id).await?;
    Ok(Json(UnreadResponse { unread }))
}

async fn reconcile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<ReconcileReport>, ApiError> {
    let actor = auth.session()?;
    let report = state.inbox.reconcile(&actor.user_id).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct PinRequest {
    pinned: bool,
}

async fn set_pinned(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<PinRequest>,
) -> Result<Json<InboxEntry>, ApiError> {
    let entry = state
        .inbox
        .set_pinned(auth.session()?, &chat_id, payload.pinned)
        .await?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
struct ArchiveRequest {
    archived: bool,
}

async fn set_archived(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<ArchiveRequest>,
) -> Result<Json<InboxEntry>, ApiError> {
    let entry = state
        .inbox
        .set_archived(auth.session()?, &chat_id, payload.archived)
        .await?;
    Ok(Json(entry))
}
