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
use crate::services::reservation::AllocationRequest;

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub lines: Vec<AllocationRequest>,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    #[serde(default = "default_alert_limit")]
    pub limit: u64,
}

fn default_alert_limit() -> u64 {
    50
}

pub fn reservation_routes() -> Router<AppState> {
    Router::new()
        .route("/:context_id", get(list_assignments).post(reserve))
        .route("/:context_id/consume", post(consume))
        .route("/:context_id/release", post(release))
        .route("/:context_id/history", get(history))
        .route(
            "/:context_id/assignments/:assignment_id/reassign",
            post(reassign),
        )
}

pub async fn reserve(
    State(state): State<AppState>,
    actor: Actor,
    Path(context_id): Path<String>,
    Json(body): Json<ReserveRequest>,
) -> Response {
    created(state.engine.reserve(&context_id, &body.lines, &actor).await)
}

pub async fn consume(
    State(state): State<AppState>,
    actor: Actor,
    Path(context_id): Path<String>,
) -> Response {
    respond(state.engine.consume(&context_id, &actor).await)
}

pub async fn release(
    State(state): State<AppState>,
    actor: Actor,
    Path(context_id): Path<String>,
) -> Response {
    respond(state.engine.release(&context_id, &actor).await)
}

pub async fn list_assignments(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> Response {
    respond(state.engine.assignments(&context_id).await)
}

pub async fn history(State(state): State<AppState>, Path(context_id): Path<String>) -> Response {
    respond(state.engine.get_assignment_history(&context_id).await)
}

pub async fn reassign(
    State(state): State<AppState>,
    actor: Actor,
    Path((context_id, assignment_id)): Path<(String, Uuid)>,
) -> Response {
    respond(
        state
            .engine
            .reassign_assignment(&context_id, assignment_id, &actor)
            .await,
    )
}

pub async fn list_alerts(State(state): State<AppState>, Query(query): Query<AlertsQuery>) -> Response {
    respond(state.engine.alerts(query.limit).await)
}
