//! External document emission (invoice / shipping guide).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use tracing::{info, instrument, warn};

use crate::errors::ServiceError;

/// Whether finalize calls the emission service at all.
///
/// `Migration` is used while documents are still issued by the legacy flow:
/// stock is consumed but nothing is emitted and no emission row is written.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EmissionStrategy {
    Live,
    Migration,
}

/// What the emission service hands back for a created document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedDocument {
    pub external_document_id: String,
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EmitterError {
    #[error("emission service unreachable: {0}")]
    Transport(String),

    #[error("emission service rejected the document ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("emission service returned an unreadable response: {0}")]
    InvalidResponse(String),
}

impl EmitterError {
    /// Structured form stored on the emission row
    pub fn details(&self) -> Value {
        match self {
            EmitterError::Transport(msg) => serde_json::json!({ "kind": "transport", "message": msg }),
            EmitterError::Rejected { status, body } => {
                serde_json::json!({ "kind": "rejected", "status": status, "body": body })
            }
            EmitterError::InvalidResponse(msg) => {
                serde_json::json!({ "kind": "invalid_response", "message": msg })
            }
        }
    }
}

/// Creates documents in the external system.
///
/// Implementations must not retry internally; retries go through the
/// emission tracker so they reuse the idempotency key.
#[async_trait]
pub trait DocumentEmitter: Send + Sync {
    async fn emit(
        &self,
        idempotency_key: &str,
        payload: &Value,
    ) -> Result<EmittedDocument, EmitterError>;
}

/// Posts the payload as JSON to `{base_url}/documents`
#[derive(Clone)]
pub struct HttpDocumentEmitter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDocumentEmitter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/documents", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl DocumentEmitter for HttpDocumentEmitter {
    #[instrument(skip(self, payload), fields(endpoint = %self.endpoint))]
    async fn emit(
        &self,
        idempotency_key: &str,
        payload: &Value,
    ) -> Result<EmittedDocument, EmitterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", idempotency_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| EmitterError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "document emission rejected");
            return Err(EmitterError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let document: EmittedDocument = response
            .json()
            .await
            .map_err(|e| EmitterError::InvalidResponse(e.to_string()))?;
        info!(
            external_document_id = %document.external_document_id,
            "document emitted"
        );
        Ok(document)
    }
}
