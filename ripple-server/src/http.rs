//! HTTP push/pull endpoints.
//!
//! Routes:
//! - `POST /push?docID={id}` — apply a mutation batch, `204` on success
//! - `POST /pull?docID={id}` — incremental diff since the request cookie
//! - `GET  /health` — liveness probe
//!
//! A successful push pokes every live connection on the document so
//! connected clients re-pull immediately; polling clients converge on
//! their own schedule. Errors map by class: requests the client got wrong
//! are `400`, server-side failures are `500` and always safe to retry.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::debug;
use ripple_sync::engine::SyncEngine;
use ripple_sync::error::SyncError;
use ripple_sync::protocol::{PullRequest, PullResponse, PushRequest};
use serde::Deserialize;
use std::sync::Arc;

use crate::broadcast::ConnectionRegistry;

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub registry: Arc<ConnectionRegistry>,
}

/// The `?docID=` query every request must carry.
#[derive(Debug, Deserialize)]
pub struct DocQuery {
    #[serde(rename = "docID")]
    pub doc_id: String,
}

/// Build the router serving the sync API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/push", post(push))
        .route("/pull", post(pull))
        .route("/health", get(health))
        .with_state(state)
}

/// `POST /push?docID={id}` — apply a mutation batch.
async fn push(
    State(state): State<AppState>,
    Query(query): Query<DocQuery>,
    Json(req): Json<PushRequest>,
) -> Result<StatusCode, ApiError> {
    let outcome = state.engine.push(&query.doc_id, &req).await?;
    debug!(
        "http push: client {} applied {} mutation(s) to {}",
        req.client_id, outcome.applied, query.doc_id
    );

    state.registry.poke(&query.doc_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /pull?docID={id}` — compute the diff since the request cookie.
async fn pull(
    State(state): State<AppState>,
    Query(query): Query<DocQuery>,
    Json(req): Json<PullRequest>,
) -> Result<Json<PullResponse>, ApiError> {
    let resp = state.engine.pull(&query.doc_id, &req)?;
    Ok(Json(resp))
}

/// `GET /health` — liveness probe.
async fn health() -> &'static str {
    "ok"
}

/// Maps engine errors onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
