use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use sea_orm::{SqlErr, TransactionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::entities::SessionStatus;
use crate::OperationResult;

/// A SKU that could not be reserved in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortfall {
    pub sku: String,
    /// Catalog display name, when the catalog knows the SKU.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub requested: i32,
    pub available: i32,
}

impl StockShortfall {
    pub fn missing(&self) -> i32 {
        (self.requested - self.available).max(0)
    }
}

impl fmt::Display for StockShortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(
                f,
                "{} ({}): requested {}, available {}",
                self.sku, label, self.requested, self.available
            ),
            None => write!(
                f,
                "{}: requested {}, available {}",
                self.sku, self.requested, self.available
            ),
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Insufficient stock: {}", join_display(.0))]
    InsufficientStock(Vec<StockShortfall>),

    /// SKUs whose only stocked bins are frozen.
    #[error("Frozen product: {}", .0.join(", "))]
    FrozenProduct(Vec<String>),

    #[error("Unknown stock entry: sku {sku} in bin {bin_code}")]
    UnknownStockEntry { sku: String, bin_code: String },

    #[error("Version conflict on session {session_id}: expected {expected}, current {current}")]
    VersionConflict {
        session_id: Uuid,
        expected: i32,
        current: i32,
    },

    #[error("No assignments found for context {0}")]
    AssignmentMissing(String),

    #[error("Invalid transition for session {session_id}: {from} -> {to}")]
    InvalidTransition {
        session_id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("External emission failure: {0}")]
    ExternalEmissionFailure(String),

    #[error("Emission already in flight for key {0}")]
    EmissionInFlight(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<TransactionError<ServiceError>> for ServiceError {
    fn from(err: TransactionError<ServiceError>) -> Self {
        match err {
            TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
            TransactionError::Transaction(service_err) => service_err,
        }
    }
}

impl ServiceError {
    /// True when the database rejected a write because of a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            ServiceError::DatabaseError(db_err)
                if matches!(db_err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
        )
    }

    /// Stable machine-readable code carried in every failed operation result.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::FrozenProduct(_) => "frozen_product",
            Self::UnknownStockEntry { .. } => "unknown_stock_entry",
            Self::VersionConflict { .. } => "version_conflict",
            Self::AssignmentMissing(_) => "assignment_missing",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ExternalEmissionFailure(_) => "external_emission_failure",
            Self::EmissionInFlight(_) => "emission_in_flight",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        status_for_code(self.error_code())
    }

    /// Returns the error message suitable for callers.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Single source of truth for error-code to HTTP status mapping.
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "not_found" => StatusCode::NOT_FOUND,
        "validation_error" | "invalid_operation" | "invalid_transition" => {
            StatusCode::BAD_REQUEST
        }
        "forbidden" => StatusCode::FORBIDDEN,
        "insufficient_stock" | "frozen_product" | "unknown_stock_entry" => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        "version_conflict" | "emission_in_flight" => StatusCode::CONFLICT,
        "external_emission_failure" => StatusCode::BAD_GATEWAY,
        "assignment_missing" | "database_error" | "internal_error" => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(OperationResult::<()>::failure(&self))).into_response()
    }
}
