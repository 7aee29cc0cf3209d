//! HTTP surface. Handlers are thin: extract, call the engine, render the
//! [`OperationResult`] envelope with a status derived from its error code.

pub mod emissions;
pub mod reservations;
pub mod sessions;
pub mod stock;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::errors::status_for_code;
use crate::{OperationResult, StockEngine};

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: StockEngine,
}

impl AppState {
    pub fn new(engine: StockEngine) -> Self {
        Self { engine }
    }
}

/// Renders an envelope, using `success_status` when it succeeded.
pub fn respond_with<T: Serialize>(success_status: StatusCode, result: OperationResult<T>) -> Response {
    let status = match result.error_code() {
        None => success_status,
        Some(code) => status_for_code(code),
    };
    (status, Json(result)).into_response()
}

pub fn respond<T: Serialize>(result: OperationResult<T>) -> Response {
    respond_with(StatusCode::OK, result)
}

pub fn created<T: Serialize>(result: OperationResult<T>) -> Response {
    respond_with(StatusCode::CREATED, result)
}

/// `/api/v1` routes
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .nest("/stock", stock::stock_routes())
        .nest("/bins", stock::bin_routes())
        .nest("/reservations", reservations::reservation_routes())
        .nest("/sessions", sessions::session_routes())
        .nest("/zombies", sessions::zombie_routes())
        .nest("/emissions", emissions::emission_routes())
        .route("/alerts", get(reservations::list_alerts))
}

/// Complete application router
pub fn router(engine: StockEngine) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest("/api/v1", api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(engine))
}
