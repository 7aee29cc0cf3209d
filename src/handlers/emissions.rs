use axum::{
    extract::{Path, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::{respond, AppState};
use crate::auth::Actor;

#[derive(Debug, Deserialize)]
pub struct GetOrCreateEmissionRequest {
    pub context_id: String,
    pub emission_type: String,
    #[serde(default)]
    pub request_payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct EmissionSuccessRequest {
    pub external_document_id: String,
    #[serde(default)]
    pub response_payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct EmissionFailureRequest {
    pub error_message: String,
    #[serde(default)]
    pub error_details: Option<Value>,
}

pub fn emission_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(get_or_create_emission))
        .route("/:emission_id/success", post(complete_success))
        .route("/:emission_id/failure", post(complete_failure))
        .route("/contexts/:context_id/:emission_type", get(list_attempts))
}

pub async fn get_or_create_emission(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<GetOrCreateEmissionRequest>,
) -> Response {
    respond(
        state
            .engine
            .get_or_create_emission(
                &body.context_id,
                &body.emission_type,
                body.request_payload,
                &actor,
            )
            .await,
    )
}

pub async fn complete_success(
    State(state): State<AppState>,
    actor: Actor,
    Path(emission_id): Path<Uuid>,
    Json(body): Json<EmissionSuccessRequest>,
) -> Response {
    respond(
        state
            .engine
            .complete_emission_success(
                emission_id,
                body.response_payload,
                &body.external_document_id,
                &actor,
            )
            .await,
    )
}

pub async fn complete_failure(
    State(state): State<AppState>,
    actor: Actor,
    Path(emission_id): Path<Uuid>,
    Json(body): Json<EmissionFailureRequest>,
) -> Response {
    respond(
        state
            .engine
            .complete_emission_failure(emission_id, &body.error_message, body.error_details, &actor)
            .await,
    )
}

pub async fn list_attempts(
    State(state): State<AppState>,
    Path((context_id, emission_type)): Path<(String, String)>,
) -> Response {
    respond(state.engine.emission_attempts(&context_id, &emission_type).await)
}
