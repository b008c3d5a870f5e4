use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use huddle_domain::idempotency::{OP_SEND_MESSAGE_REQUEST, OP_START_CONVERSATION};
use huddle_domain::requests::{
    AcceptedRequest, ConversationStart, MessageRequest, RequestView, SendRequestOutcome,
};
use serde::Deserialize;
use validator::Validate;

use super::{idempotent, snapshot_stream};
use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::observability;
use crate::state::AppState;
use crate::validation::ValidJson;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/conversations", post(start_conversation))
        .route("/v1/message-requests", post(send_request))
        .route("/v1/message-requests/sent", get(list_sent))
        .route("/v1/message-requests/received", get(list_received))
        .route("/v1/message-requests/stream", get(stream_received))
        .route("/v1/message-requests/:request_id/accept", post(accept_request))
        .route("/v1/message-requests/:request_id/reject", post(reject_request))
        .route("/v1/message-requests/:request_id", delete(delete_request))
}

#[derive(Debug, Deserialize, Validate)]
struct SendRequestPayload {
    #[validate(length(min = 1, max = 128))]
    recipient_id: String,
    #[serde(default)]
    #[validate(length(max = 1000))]
    message: String,
}

async fn send_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(auth): Extension<AuthContext>,
    ValidJson(payload): ValidJson<SendRequestPayload>,
) -> Result<Response, ApiError> {
    let actor = auth.session()?.clone();
    idempotent(&state, &headers, OP_SEND_MESSAGE_REQUEST, &actor.user_id, || async {
        let outcome = state
            .requests
            .send(&actor, &payload.recipient_id, &payload.message)
            .await?;
        let status = match outcome {
            SendRequestOutcome::Created(_) => StatusCode::CREATED,
            SendRequestOutcome::AlreadyPending(_) => StatusCode::OK,
        };
        Ok::<_, ApiError>((status, outcome))
    })
    .await
}

#[derive(Debug, Deserialize, Validate)]
struct StartConversationPayload {
    #[validate(length(min = 1, max = 128))]
    recipient_id: String,
    #[serde(default)]
    #[validate(length(max = 1000))]
    text: String,
}

async fn start_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(auth): Extension<AuthContext>,
    ValidJson(payload): ValidJson<StartConversationPayload>,
) -> Result<Response, ApiError> {
    let actor = auth.session()?.clone();
    idempotent(&state, &headers, OP_START_CONVERSATION, &actor.user_id, || async {
        let start = state
            .requests
            .start_conversation(&actor, &payload.recipient_id, &payload.text)
            .await?;
        let status = match &start {
            ConversationStart::Existing { .. } => StatusCode::OK,
            ConversationStart::Opened { .. } | ConversationStart::Requested { .. } => {
                StatusCode::CREATED
            }
        };
        Ok::<_, ApiError>((status, start))
    })
    .await
}

async fn list_sent(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<RequestView>>, ApiError> {
    let actor = auth.session()?;
    Ok(Json(state.requests.pending_sent_by(&actor.user_id).await?))
}

async fn list_received(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<RequestView>>, ApiError> {
    let actor = auth.session()?;
    Ok(Json(state.requests.pending_received_by(&actor.user_id).await?))
}

async fn stream_received(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let actor = auth.session()?;
    let snapshots = state
        .requests
        .subscribe_to_message_requests(&actor.user_id)
        .await?;
    Ok(snapshot_stream("message_requests", snapshots).into_response())
}

async fn accept_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<AcceptedRequest>, ApiError> {
    let accepted = state
        .requests
        .accept(auth.session()?, &request_id)
        .await?;
    observability::register_request_resolution("accepted");
    Ok(Json(accepted))
}

async fn reject_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<MessageRequest>, ApiError> {
    let rejected = state
        .requests
        .reject(auth.session()?, &request_id)
        .await?;
    observability::register_request_resolution("rejected");
    Ok(Json(rejected))
}

async fn delete_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<StatusCode, ApiError> {
    state
        .requests
        .delete(auth.session()?, &request_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
