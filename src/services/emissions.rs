//! Idempotent Emission Tracker
//!
//! Guards calls to the document emission service. Each attempt for a
//! (context, emission type) gets a row keyed by a deterministic idempotency
//! key; the unique index on that key is what stops two callers from both
//! believing they own the same attempt.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::Actor;
use crate::entities::emission::{self, EmissionStatus, Entity as Emission};
use crate::errors::ServiceError;
use crate::services::audit::{self, action, entity, AuditRecord};

/// Deterministic key for one attempt at one emission.
pub fn idempotency_key(context_id: &str, emission_type: &str, attempt_number: i32) -> String {
    format!("{}:{}:{}", context_id, emission_type, attempt_number)
}

/// Result of [`EmissionTracker::get_or_create_emission`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "emission", rename_all = "snake_case")]
pub enum EmissionTicket {
    /// A previous attempt already succeeded; do not call the service again.
    Completed(emission::Model),
    /// Another caller owns the current attempt.
    InFlight(emission::Model),
    /// The caller owns this new attempt and must call the service.
    Claimed(emission::Model),
}

impl EmissionTicket {
    pub fn emission(&self) -> &emission::Model {
        match self {
            EmissionTicket::Completed(e) | EmissionTicket::InFlight(e) | EmissionTicket::Claimed(e) => e,
        }
    }

    pub fn into_emission(self) -> emission::Model {
        match self {
            EmissionTicket::Completed(e) | EmissionTicket::InFlight(e) | EmissionTicket::Claimed(e) => e,
        }
    }
}

#[derive(Clone)]
pub struct EmissionTracker {
    db_pool: Arc<DatabaseConnection>,
}

impl EmissionTracker {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    /// Finds the live emission for a context or claims the next attempt.
    ///
    /// A completed attempt wins over everything. A pending latest attempt is
    /// in flight. Otherwise the attempt after the last failure is claimed.
    #[instrument(skip(self, request_payload, actor))]
    pub async fn get_or_create_emission(
        &self,
        context_id: &str,
        emission_type: &str,
        request_payload: Value,
        actor: &Actor,
    ) -> Result<EmissionTicket, ServiceError> {
        if context_id.trim().is_empty() || emission_type.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "context_id and emission_type are required".to_string(),
            ));
        }
        let db = &*self.db_pool;

        let attempts = self.attempts(context_id, emission_type).await?;
        if let Some(done) = attempts.iter().find(|e| e.is_completed()) {
            counter!("stockkeeper.emissions.deduplicated", 1);
            return Ok(EmissionTicket::Completed(done.clone()));
        }
        if let Some(latest) = attempts.first() {
            if latest.is_pending() {
                return Ok(EmissionTicket::InFlight(latest.clone()));
            }
        }

        let attempt_number = attempts.first().map_or(1, |e| e.attempt_number + 1);
        let key = idempotency_key(context_id, emission_type, attempt_number);

        let row = emission::ActiveModel {
            id: Set(Uuid::new_v4()),
            context_id: Set(context_id.to_string()),
            emission_type: Set(emission_type.to_string()),
            idempotency_key: Set(key.clone()),
            attempt_number: Set(attempt_number),
            status: Set(EmissionStatus::Pending.to_string()),
            request_payload: Set(request_payload),
            response_payload: Set(None),
            external_document_id: Set(None),
            error_message: Set(None),
            error_details: Set(None),
            created_at: Set(Utc::now()),
            completed_at: Set(None),
        };

        match row.insert(db).await {
            Ok(claimed) => {
                counter!("stockkeeper.emissions.claimed", 1);
                audit::record(
                    db,
                    actor,
                    AuditRecord::new(entity::EMISSION, context_id, action::EMISSION_STARTED)
                        .details(json!({
                            "emission_id": claimed.id,
                            "idempotency_key": key,
                            "attempt_number": attempt_number,
                        })),
                )
                .await?;
                info!(%key, attempt_number, "emission attempt claimed");
                Ok(EmissionTicket::Claimed(claimed))
            }
            Err(err) => {
                let err = ServiceError::from(err);
                if !err.is_unique_violation() {
                    return Err(err);
                }
                // lost the race for this key: report whatever the winner holds
                let winner = self.find_by_key(&key).await?.ok_or(err)?;
                warn!(%key, "emission attempt already claimed by another caller");
                if winner.is_completed() {
                    Ok(EmissionTicket::Completed(winner))
                } else {
                    Ok(EmissionTicket::InFlight(winner))
                }
            }
        }
    }

    /// Marks a pending attempt as succeeded. Repeating the call with the same
    /// document id is a no-op.
    #[instrument(skip(self, response_payload, actor))]
    pub async fn complete_emission_success(
        &self,
        emission_id: Uuid,
        response_payload: Value,
        external_document_id: &str,
        actor: &Actor,
    ) -> Result<emission::Model, ServiceError> {
        let db = &*self.db_pool;
        let result = Emission::update_many()
            .col_expr(
                emission::Column::Status,
                sea_orm::sea_query::Expr::value(EmissionStatus::Completed.to_string()),
            )
            .col_expr(
                emission::Column::ResponsePayload,
                sea_orm::sea_query::Expr::value(response_payload),
            )
            .col_expr(
                emission::Column::ExternalDocumentId,
                sea_orm::sea_query::Expr::value(external_document_id.to_string()),
            )
            .col_expr(
                emission::Column::CompletedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(emission::Column::Id.eq(emission_id))
            .filter(emission::Column::Status.eq(EmissionStatus::Pending.as_ref()))
            .exec(db)
            .await?;

        let current = self.get_emission(emission_id).await?;
        if result.rows_affected == 0 {
            if current.is_completed()
                && current.external_document_id.as_deref() == Some(external_document_id)
            {
                return Ok(current);
            }
            return Err(ServiceError::InvalidOperation(format!(
                "emission {} is {} and cannot be completed",
                emission_id, current.status
            )));
        }

        counter!("stockkeeper.emissions.succeeded", 1);
        audit::record(
            db,
            actor,
            AuditRecord::new(entity::EMISSION, &current.context_id, action::EMISSION_SUCCEEDED)
                .details(json!({
                    "emission_id": emission_id,
                    "external_document_id": external_document_id,
                })),
        )
        .await?;
        info!(%emission_id, external_document_id, "emission completed");
        Ok(current)
    }

    /// Marks a pending attempt as failed, freeing the next attempt number.
    #[instrument(skip(self, error_details, actor))]
    pub async fn complete_emission_failure(
        &self,
        emission_id: Uuid,
        error_message: &str,
        error_details: Option<Value>,
        actor: &Actor,
    ) -> Result<emission::Model, ServiceError> {
        let db = &*self.db_pool;
        let result = Emission::update_many()
            .col_expr(
                emission::Column::Status,
                sea_orm::sea_query::Expr::value(EmissionStatus::Failed.to_string()),
            )
            .col_expr(
                emission::Column::ErrorMessage,
                sea_orm::sea_query::Expr::value(error_message.to_string()),
            )
            .col_expr(
                emission::Column::ErrorDetails,
                sea_orm::sea_query::Expr::value(error_details.clone()),
            )
            .col_expr(
                emission::Column::CompletedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(emission::Column::Id.eq(emission_id))
            .filter(emission::Column::Status.eq(EmissionStatus::Pending.as_ref()))
            .exec(db)
            .await?;

        let current = self.get_emission(emission_id).await?;
        if result.rows_affected == 0 {
            if current.status()? == EmissionStatus::Failed {
                return Ok(current);
            }
            return Err(ServiceError::InvalidOperation(format!(
                "emission {} is {} and cannot be failed",
                emission_id, current.status
            )));
        }

        counter!("stockkeeper.emissions.failed", 1);
        audit::record(
            db,
            actor,
            AuditRecord::new(entity::EMISSION, &current.context_id, action::EMISSION_FAILED)
                .details(json!({
                    "emission_id": emission_id,
                    "attempt_number": current.attempt_number,
                    "error_message": error_message,
                    "error_details": error_details,
                })),
        )
        .await?;
        warn!(%emission_id, error_message, "emission failed");
        Ok(current)
    }

    pub async fn get_emission(&self, emission_id: Uuid) -> Result<emission::Model, ServiceError> {
        Emission::find_by_id(emission_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("emission {} not found", emission_id)))
    }

    pub async fn find_by_key(&self, key: &str) -> Result<Option<emission::Model>, ServiceError> {
        Ok(Emission::find()
            .filter(emission::Column::IdempotencyKey.eq(key))
            .one(&*self.db_pool)
            .await?)
    }

    /// Attempts for a context and type, newest first.
    pub async fn attempts(
        &self,
        context_id: &str,
        emission_type: &str,
    ) -> Result<Vec<emission::Model>, ServiceError> {
        Ok(Emission::find()
            .filter(emission::Column::ContextId.eq(context_id))
            .filter(emission::Column::EmissionType.eq(emission_type))
            .order_by_desc(emission::Column::AttemptNumber)
            .all(&*self.db_pool)
            .await?)
    }

    /// Latest attempt for a context and type, if any.
    pub async fn latest(
        &self,
        context_id: &str,
        emission_type: &str,
    ) -> Result<Option<emission::Model>, ServiceError> {
        Ok(self.attempts(context_id, emission_type).await?.into_iter().next())
    }
}
