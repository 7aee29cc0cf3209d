use axum::{
    extract::{Path, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use validator::Validate;

use super::{created, respond, AppState};
use crate::auth::Actor;
use crate::errors::ServiceError;
use crate::OperationResult;

#[derive(Debug, Deserialize, Validate)]
pub struct ReceiveStockRequest {
    #[validate(length(min = 1, max = 128))]
    pub sku: String,
    #[validate(length(min = 1, max = 64))]
    pub bin_code: String,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBinRequest {
    #[validate(length(min = 1, max = 64))]
    pub bin_code: String,
}

#[derive(Debug, Deserialize)]
pub struct FreezeBinRequest {
    pub reason: String,
}

pub fn stock_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_entries).post(receive_stock))
        .route("/:sku", get(get_stock))
        .route("/:sku/:bin_code", get(get_entry))
}

pub fn bin_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_bins).post(create_bin))
        .route("/:bin_code", get(get_bin))
        .route("/:bin_code/freeze", post(freeze_bin))
        .route("/:bin_code/unfreeze", post(unfreeze_bin))
}

fn invalid<T>(err: validator::ValidationErrors) -> OperationResult<T> {
    OperationResult::failure(&ServiceError::from(err))
}

pub async fn receive_stock(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<ReceiveStockRequest>,
) -> Response {
    if let Err(e) = body.validate() {
        return respond(invalid::<()>(e));
    }
    respond(
        state
            .engine
            .receive_stock(&body.sku, &body.bin_code, body.quantity, &actor)
            .await,
    )
}

pub async fn list_entries(State(state): State<AppState>) -> Response {
    respond(state.engine.list_stock_entries().await)
}

pub async fn get_stock(State(state): State<AppState>, Path(sku): Path<String>) -> Response {
    respond(state.engine.get_stock(&sku).await)
}

pub async fn get_entry(
    State(state): State<AppState>,
    Path((sku, bin_code)): Path<(String, String)>,
) -> Response {
    respond(state.engine.get_stock_entry(&sku, &bin_code).await)
}

pub async fn list_bins(State(state): State<AppState>) -> Response {
    respond(state.engine.list_bins().await)
}

pub async fn get_bin(State(state): State<AppState>, Path(bin_code): Path<String>) -> Response {
    respond(state.engine.get_bin(&bin_code).await)
}

pub async fn create_bin(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<CreateBinRequest>,
) -> Response {
    if let Err(e) = body.validate() {
        return respond(invalid::<()>(e));
    }
    created(state.engine.create_bin(&body.bin_code, &actor).await)
}

pub async fn freeze_bin(
    State(state): State<AppState>,
    actor: Actor,
    Path(bin_code): Path<String>,
    Json(body): Json<FreezeBinRequest>,
) -> Response {
    respond(state.engine.freeze_bin(&bin_code, &body.reason, &actor).await)
}

pub async fn unfreeze_bin(
    State(state): State<AppState>,
    actor: Actor,
    Path(bin_code): Path<String>,
) -> Response {
    respond(state.engine.unfreeze_bin(&bin_code, &actor).await)
}
