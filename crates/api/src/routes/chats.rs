use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use huddle_domain::chat::{
    Chat, DeletionReport, GroupChatCreate, Message, MessageContent, MessagePage, ReadReceipt,
};
use huddle_domain::idempotency::{OP_CREATE_GROUP_CHAT, OP_SEND_MESSAGE};
use huddle_domain::inbox::{ChatRepair, InboxRepair};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{idempotent, snapshot_stream};
use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;
use crate::validation::ValidJson;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/chats/groups", post(create_group_chat))
        .route("/v1/chats/direct/:user_id", get(find_direct_chat))
        .route("/v1/chats/:chat_id", get(get_chat).delete(delete_chat))
        .route("/v1/chats/:chat_id/visibility", post(set_visibility))
        .route("/v1/chats/:chat_id/repair", post(repair_chat))
        .route(
            "/v1/chats/:chat_id/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/v1/chats/:chat_id/messages/stream",
            get(stream_messages),
        )
        .route(
            "/v1/chats/:chat_id/messages/:message_id",
            patch(edit_message),
        )
        .route("/v1/chats/:chat_id/read", post(mark_read))
        .route("/v1/chats/:chat_id/members", post(add_members))
        .route("/v1/chats/:chat_id/leave", post(leave_group))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateGroupChatRequest {
    #[validate(length(min = 1, max = 100))]
    name: String,
    #[serde(default)]
    #[validate(length(max = 500))]
    description: String,
    #[validate(url)]
    avatar: Option<String>,
    #[validate(length(min = 1, max = 255))]
    member_ids: Vec<String>,
}

async fn create_group_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(auth): Extension<AuthContext>,
    ValidJson(payload): ValidJson<CreateGroupChatRequest>,
) -> Result<Response, ApiError> {
    let actor = auth.session()?.clone();
    let input = GroupChatCreate {
        name: payload.name,
        description: payload.description,
        avatar: payload.avatar,
        member_ids: payload.member_ids,
    };
    idempotent(&state, &headers, OP_CREATE_GROUP_CHAT, &actor.user_id, || async {
        let chat = state.chats.create_group_chat(&actor, input).await?;
        Ok::<_, ApiError>((StatusCode::CREATED, chat))
    })
    .await
}

async fn find_direct_chat(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Chat>, ApiError> {
    let actor = auth.session()?;
    state
        .chats
        .check_existing_chat(&actor.user_id, &user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("chat".into()))
}

async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Chat>, ApiError> {
    let chat = state.chats.get_chat(auth.session()?, &chat_id).await?;
    Ok(Json(chat))
}

async fn delete_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<DeletionReport>, ApiError> {
    let report = state
        .chats
        .delete_chat_permanently(auth.session()?, &chat_id)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct VisibilityRequest {
    active: bool,
}

async fn set_visibility(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<VisibilityRequest>,
) -> Result<Json<Chat>, ApiError> {
    let chat = state
        .chats
        .set_chat_active(auth.session()?, &chat_id, payload.active)
        .await?;
    Ok(Json(chat))
}

#[derive(Serialize)]
struct RepairResponse {
    chat: Chat,
    reconstructed: bool,
    entries: InboxRepair,
}

async fn repair_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<RepairResponse>, ApiError> {
    let (chat, reconstructed) = match state.inbox.repair(auth.session()?, &chat_id).await? {
        ChatRepair::Unrecoverable(_) => {
            return Err(ApiError::Validation(
                "chat participants cannot be recovered".into(),
            ));
        }
        ChatRepair::Ok(chat) => (chat, false),
        ChatRepair::Reconstructed(chat) => (chat, true),
    };
    let entries = state.chats.ensure_user_chat_entries(&chat_id).await?;
    Ok(Json(RepairResponse {
        chat,
        reconstructed,
        entries,
    }))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    before_ms: Option<i64>,
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<MessagesQuery>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<MessagePage>, ApiError> {
    let page = state
        .chats
        .fetch_messages(auth.session()?, &chat_id, query.before_ms, query.limit)
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize, Validate)]
struct SendMessageRequest {
    #[serde(default)]
    #[validate(length(max = 2000))]
    text: String,
    #[validate(url)]
    image_url: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
    Extension(auth): Extension<AuthContext>,
    ValidJson(payload): ValidJson<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let actor = auth.session()?.clone();
    let content = MessageContent {
        text: payload.text,
        image_url: payload.image_url,
    };
    idempotent(&state, &headers, OP_SEND_MESSAGE, &actor.user_id, || async {
        let message = state.chats.send_message(&actor, &chat_id, content).await?;
        Ok::<_, ApiError>((StatusCode::CREATED, message))
    })
    .await
}

async fn stream_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<MessagesQuery>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let snapshots = state
        .chats
        .subscribe_to_messages(auth.session()?, &chat_id, query.limit)
        .await?;
    Ok(snapshot_stream("messages", snapshots).into_response())
}

#[derive(Debug, Deserialize, Validate)]
struct EditMessageRequest {
    #[validate(length(min = 1, max = 2000))]
    text: String,
}

async fn edit_message(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    ValidJson(payload): ValidJson<EditMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let message = state
        .chats
        .edit_message(auth.session()?, &chat_id, &message_id, &payload.text)
        .await?;
    Ok(Json(message))
}

async fn mark_read(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<ReadReceipt>, ApiError> {
    let receipt = state
        .chats
        .mark_messages_as_read(auth.session()?, &chat_id)
        .await?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize, Validate)]
struct AddMembersRequest {
    #[validate(length(min = 1, max = 255))]
    member_ids: Vec<String>,
}

async fn add_members(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    ValidJson(payload): ValidJson<AddMembersRequest>,
) -> Result<Json<Chat>, ApiError> {
    let chat = state
        .chats
        .add_group_members(auth.session()?, &chat_id, payload.member_ids)
        .await?;
    Ok(Json(chat))
}

async fn leave_group(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Chat>, ApiError> {
    let chat = state.chats.leave_group(auth.session()?, &chat_id).await?;
    Ok(Json(chat))
}
