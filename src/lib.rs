//! Stockkeeper
//!
//! Stock reservation and fulfillment engine: a per-bin stock ledger, a
//! deterministic bin selector, two-phase reservations, versioned picking
//! sessions with zombie recovery, and idempotent external document emission.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod migrator;
pub mod services;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::ServiceError;

pub use crate::engine::StockEngine;

/// Structured result returned by every public engine operation.
///
/// Failures carry a stable `error_code` so callers can branch on the kind of
/// failure without parsing messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Machine-readable failure details (shortfalls, frozen SKUs, current version).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub timestamp: String,
}

impl<T> OperationResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error_code: None,
            message: None,
            data: Some(data),
            details: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn failure(err: &ServiceError) -> Self {
        Self {
            success: false,
            error_code: Some(err.error_code().to_string()),
            message: Some(err.response_message()),
            data: None,
            details: failure_details(err),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    /// Converts back into a `Result`, for callers that prefer `?`.
    pub fn into_result(self) -> Result<T, OperationFailure> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (_, _) => Err(OperationFailure {
                error_code: self.error_code.unwrap_or_else(|| "internal_error".to_string()),
                message: self.message.unwrap_or_default(),
                details: self.details,
            }),
        }
    }
}

impl<T> From<Result<T, ServiceError>> for OperationResult<T> {
    fn from(result: Result<T, ServiceError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failure(&err),
        }
    }
}

/// Failure half of an [`OperationResult`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error_code}: {message}")]
pub struct OperationFailure {
    pub error_code: String,
    pub message: String,
    pub details: Option<Value>,
}

fn failure_details(err: &ServiceError) -> Option<Value> {
    match err {
        ServiceError::InsufficientStock(shortfalls) => Some(json!({ "shortfalls": shortfalls })),
        ServiceError::FrozenProduct(skus) => Some(json!({ "skus": skus })),
        ServiceError::UnknownStockEntry { sku, bin_code } => {
            Some(json!({ "sku": sku, "bin_code": bin_code }))
        }
        ServiceError::VersionConflict {
            session_id,
            expected,
            current,
        } => Some(json!({
            "session_id": session_id,
            "expected_version": expected,
            "current_version": current,
        })),
        ServiceError::InvalidTransition {
            session_id,
            from,
            to,
        } => Some(json!({
            "session_id": session_id,
            "from": from,
            "to": to,
        })),
        ServiceError::AssignmentMissing(context_id) => Some(json!({ "context_id": context_id })),
        _ => None,
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use crate::errors::StockShortfall;
    use uuid::Uuid;

    #[test]
    fn success_carries_data_and_no_error_code() {
        let result = OperationResult::ok(3);
        assert!(result.is_success());
        assert_eq!(result.error_code(), None);
        assert_eq!(result.into_result().unwrap(), 3);
    }

    #[test]
    fn insufficient_stock_lists_shortfalls() {
        let err = ServiceError::InsufficientStock(vec![StockShortfall {
            sku: "X-1".into(),
            label: None,
            requested: 12,
            available: 3,
        }]);
        let result: OperationResult<()> = Err(err).into();
        assert!(!result.success);
        assert_eq!(result.error_code(), Some("insufficient_stock"));
        let details = result.details.clone().unwrap();
        assert_eq!(details["shortfalls"][0]["sku"], "X-1");
        assert_eq!(details["shortfalls"][0]["available"], 3);
    }

    #[test]
    fn version_conflict_reports_current_version() {
        let result = OperationResult::<()>::failure(&ServiceError::VersionConflict {
            session_id: Uuid::nil(),
            expected: 2,
            current: 4,
        });
        assert_eq!(result.details.as_ref().unwrap()["current_version"], 4);
        let failure = result.into_result().unwrap_err();
        assert_eq!(failure.error_code, "version_conflict");
    }

    #[test]
    fn serialized_failure_omits_data() {
        let result = OperationResult::<u32>::failure(&ServiceError::NotFound("session".into()));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error_code"], "not_found");
        assert!(value.get("data").is_none());
    }
}
