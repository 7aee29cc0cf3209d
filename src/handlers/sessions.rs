use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{created, respond, AppState};
use crate::auth::Actor;
use crate::entities::{SessionLine, SessionNotes, SessionStatus};

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub lines: Vec<SessionLine>,
    #[serde(default)]
    pub notes: SessionNotes,
}

/// Body of every versioned session mutation
#[derive(Debug, Deserialize)]
pub struct VersionedRequest {
    pub expected_version: i32,
}

#[derive(Debug, Deserialize)]
pub struct TouchRequest {
    pub expected_version: i32,
    #[serde(default)]
    pub notes: Option<SessionNotes>,
}

#[derive(Debug, Deserialize)]
pub struct RecoverRequest {
    pub expected_version: i32,
    #[serde(default)]
    pub force_cancel: bool,
}

#[derive(Debug, Deserialize)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sessions).post(create_session))
        .route("/:session_id", get(get_session))
        .route("/:session_id/verify", post(verify_session))
        .route("/:session_id/touch", post(touch_session))
        .route("/:session_id/finalize", post(finalize_session))
        .route("/:session_id/cancel", post(cancel_session))
}

pub fn zombie_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_zombies))
        .route("/:session_id/recover", post(recover_zombie))
}

pub async fn create_session(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    created(
        state
            .engine
            .create_session(body.lines, body.notes, &actor)
            .await,
    )
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(filter): Query<SessionFilter>,
) -> Response {
    respond(state.engine.list_sessions(filter.status).await)
}

pub async fn get_session(State(state): State<AppState>, Path(session_id): Path<Uuid>) -> Response {
    respond(state.engine.get_session(session_id).await)
}

pub async fn verify_session(
    State(state): State<AppState>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
    Json(body): Json<VersionedRequest>,
) -> Response {
    respond(
        state
            .engine
            .verify_session(session_id, body.expected_version, &actor)
            .await,
    )
}

pub async fn touch_session(
    State(state): State<AppState>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
    Json(body): Json<TouchRequest>,
) -> Response {
    respond(
        state
            .engine
            .record_activity(session_id, body.expected_version, body.notes, &actor)
            .await,
    )
}

pub async fn finalize_session(
    State(state): State<AppState>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
    Json(body): Json<VersionedRequest>,
) -> Response {
    respond(
        state
            .engine
            .finalize_session(session_id, body.expected_version, &actor)
            .await,
    )
}

pub async fn cancel_session(
    State(state): State<AppState>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
    Json(body): Json<VersionedRequest>,
) -> Response {
    respond(
        state
            .engine
            .cancel_session(session_id, body.expected_version, &actor)
            .await,
    )
}

pub async fn list_zombies(State(state): State<AppState>) -> Response {
    respond(state.engine.detect_zombies().await)
}

pub async fn recover_zombie(
    State(state): State<AppState>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
    Json(body): Json<RecoverRequest>,
) -> Response {
    respond(
        state
            .engine
            .recover_zombie(session_id, body.expected_version, body.force_cancel, &actor)
            .await,
    )
}
