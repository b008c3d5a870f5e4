mod chats;
mod inbox;
mod profiles;
mod projects;
mod requests;

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{Stream, StreamExt};
use huddle_domain::idempotency::BeginOutcome;
use huddle_domain::ports::BoxStream;
use huddle_domain::ports::idempotency::{IdempotencyKey, StoredResponse};
use huddle_domain::util::{format_ms_rfc3339, now_ms};
use serde::Serialize;

use crate::middleware::{self as app_middleware, REQUEST_ID_HEADER};
use crate::observability::{self, StreamGuard};
use crate::{error::ApiError, state::AppState};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(profiles::routes())
        .merge(chats::routes())
        .merge(inbox::routes())
        .merge(requests::routes())
        .merge(projects::routes())
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer(state.config.request_timeout()))
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    server_time: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
        server_time: format_ms_rfc3339(now_ms()),
    })
}

async fn metrics() -> Result<Response, ApiError> {
    let body = observability::render_metrics().ok_or(ApiError::Unavailable)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

fn request_id_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Validation("missing request id".into()))
}

/// Runs a non-idempotent write at most once per `(operation, actor, x-request-id)`.
/// A replayed key returns the stored response; a key still in flight is a conflict.
async fn idempotent<T, F, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    operation: &str,
    actor_id: &str,
    run: F,
) -> Result<Response, ApiError>
where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, T), ApiError>>,
{
    let request_id = request_id_from_headers(headers)?;
    let key = IdempotencyKey::new(operation, actor_id, request_id);

    let outcome = state.idempotency.begin(&key).await.map_err(|err| {
        tracing::error!(error = %err, operation, "idempotency begin failed");
        ApiError::Unavailable
    })?;

    match outcome {
        BeginOutcome::Replay(response) => {
            observability::register_idempotent_replay(operation);
            Ok(to_response(response))
        }
        BeginOutcome::InProgress => Err(ApiError::Conflict),
        BeginOutcome::Started => {
            let (status, value) = match run().await {
                Ok(result) => result,
                Err(err) => {
                    if let Err(release) = state.idempotency.abandon(&key).await {
                        tracing::warn!(error = %release, operation, "failed to release idempotency key");
                    }
                    return Err(err);
                }
            };
            let response = StoredResponse {
                status_code: status.as_u16(),
                body: serde_json::to_value(&value).map_err(|_| ApiError::Internal)?,
            };
            if let Err(err) = state.idempotency.complete(&key, response.clone()).await {
                tracing::error!(error = %err, operation, "idempotency complete failed");
            }
            Ok(to_response(response))
        }
    }
}

fn to_response(response: StoredResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);
    (status, Json(response.body)).into_response()
}

/// Streams each snapshot of a domain subscription as one named SSE event.
fn snapshot_stream<T>(
    feed: &'static str,
    snapshots: BoxStream<T>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Serialize + Send + 'static,
{
    let guard = StreamGuard::open(feed);
    let events = snapshots.filter_map(move |snapshot| {
        let _open = &guard;
        let event = match Event::default().event(feed).json_data(&snapshot) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                tracing::warn!(error = %err, feed, "dropping unserializable snapshot");
                None
            }
        };
        std::future::ready(event)
    });
    Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}
