use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    routing::{get, post},
};
use huddle_domain::projects::{CollaborationProject, ProjectCreate};
use serde::Deserialize;
use validator::Validate;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;
use crate::validation::ValidJson;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/projects", post(create_project))
        .route("/v1/projects/:project_id", get(get_project))
        .route("/v1/projects/:project_id/invites", post(invite_collaborator))
        .route("/v1/projects/:project_id/accept", post(accept_invite))
        .route("/v1/projects/:project_id/complete", post(complete_project))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateProjectRequest {
    #[validate(length(min = 1, max = 120))]
    title: String,
    #[serde(default)]
    #[validate(length(max = 2000))]
    about: String,
    #[serde(default)]
    #[validate(length(max = 20))]
    tech: Vec<String>,
    #[validate(url)]
    github_repo: Option<String>,
}

async fn create_project(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ValidJson(payload): ValidJson<CreateProjectRequest>,
) -> Result<(StatusCode, Json<CollaborationProject>), ApiError> {
    let input = ProjectCreate {
        title: payload.title,
        about: payload.about,
        tech: payload.tech,
        github_repo: payload.github_repo,
    };
    let project = state
        .projects
        .create_project(auth.session()?, input)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<CollaborationProject>, ApiError> {
    Ok(Json(state.projects.get_project(&project_id).await?))
}

#[derive(Debug, Deserialize, Validate)]
struct InviteRequest {
    #[validate(length(min = 1, max = 128))]
    user_id: String,
}

async fn invite_collaborator(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    ValidJson(payload): ValidJson<InviteRequest>,
) -> Result<Json<CollaborationProject>, ApiError> {
    let project = state
        .projects
        .invite_collaborator(auth.session()?, &project_id, &payload.user_id)
        .await?;
    Ok(Json(project))
}

async fn accept_invite(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<CollaborationProject>, ApiError> {
    let project = state
        .projects
        .accept_invite(auth.session()?, &project_id)
        .await?;
    Ok(Json(project))
}

async fn complete_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<CollaborationProject>, ApiError> {
    let project = state
        .projects
        .complete_project(auth.session()?, &project_id)
        .await?;
    Ok(Json(project))
}
