use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use huddle_domain::profiles::{ProfileUpdate, UserProfile};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;
use crate::validation::ValidJson;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/profile", put(upsert_profile))
        .route("/v1/profiles/:user_id", get(get_profile))
        .route(
            "/v1/profiles/:user_id/follow",
            post(follow).delete(unfollow),
        )
        .route("/v1/profiles/:user_id/relationship", get(relationship))
}

#[derive(Debug, Deserialize, Validate)]
struct UpsertProfileRequest {
    #[validate(length(min = 1, max = 80))]
    name: String,
    #[validate(length(min = 1, max = 40))]
    username: String,
    #[validate(url)]
    avatar: Option<String>,
    #[validate(length(max = 500))]
    bio: Option<String>,
}

async fn upsert_profile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ValidJson(payload): ValidJson<UpsertProfileRequest>,
) -> Result<Json<UserProfile>, ApiError> {
    let update = ProfileUpdate {
        name: payload.name,
        username: payload.username,
        avatar: payload.avatar,
        bio: payload.bio,
    };
    let profile = state
        .profiles
        .upsert_profile(auth.session()?, update)
        .await?;
    Ok(Json(profile))
}

async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>, ApiError> {
    state
        .profiles
        .get_profile(&user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("profile".into()))
}

async fn follow(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<StatusCode, ApiError> {
    state.profiles.follow(auth.session()?, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unfollow(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<StatusCode, ApiError> {
    state.profiles.unfollow(auth.session()?, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct RelationshipResponse {
    following: bool,
    followed_by: bool,
    mutual: bool,
}

async fn relationship(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<RelationshipResponse>, ApiError> {
    let actor = auth.session()?;
    let following = state.profiles.is_following(&actor.user_id, &user_id).await?;
    let followed_by = state.profiles.is_following(&user_id, &actor.user_id).await?;
    let mutual = state
        .requests
        .check_mutual_follow(&actor.user_id, &user_id)
        .await;
    Ok(Json(RelationshipResponse {
        following,
        followed_by,
        mutual,
    }))
}
