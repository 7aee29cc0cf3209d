//! Append-only audit trail of ledger movements and session transitions.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

use crate::auth::Actor;
use crate::entities::audit_log::{self, Entity as AuditLog};
use crate::errors::ServiceError;

pub mod entity {
    pub const ASSIGNMENT: &str = "assignment";
    pub const STOCK_ENTRY: &str = "stock_entry";
    pub const BIN: &str = "bin";
    pub const SESSION: &str = "session";
    pub const EMISSION: &str = "emission";
}

pub mod action {
    pub const RESERVED: &str = "reserved";
    pub const CONSUMED: &str = "consumed";
    pub const RELEASED: &str = "released";
    pub const REASSIGNED: &str = "reassigned";
    pub const ADJUSTED: &str = "adjusted";
    pub const RECEIVED: &str = "received";
    pub const CREATED: &str = "created";
    pub const FROZEN: &str = "frozen";
    pub const UNFROZEN: &str = "unfrozen";
    pub const STATUS_CHANGED: &str = "status_changed";
    pub const ACTIVITY: &str = "activity";
    pub const EMISSION_STARTED: &str = "emission_started";
    pub const EMISSION_SUCCEEDED: &str = "emission_succeeded";
    pub const EMISSION_FAILED: &str = "emission_failed";
    pub const INTEGRITY_ALERT: &str = "integrity_alert";
    pub const OPERATOR_ALERT: &str = "operator_alert";
}

/// One row to append.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub entity_type: &'static str,
    pub entity_id: String,
    pub action: &'static str,
    pub previous_state: Option<Value>,
    pub new_state: Option<Value>,
    pub details: Option<Value>,
}

impl AuditRecord {
    pub fn new(entity_type: &'static str, entity_id: impl Into<String>, action: &'static str) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            action,
            previous_state: None,
            new_state: None,
            details: None,
        }
    }

    pub fn transition(mut self, previous: Option<Value>, new: Option<Value>) -> Self {
        self.previous_state = previous;
        self.new_state = new;
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Appends `record` using the caller's connection, usually its open transaction.
pub async fn record<C: ConnectionTrait>(
    conn: &C,
    actor: &Actor,
    record: AuditRecord,
) -> Result<audit_log::Model, ServiceError> {
    let row = audit_log::ActiveModel {
        entity_type: Set(record.entity_type.to_string()),
        entity_id: Set(record.entity_id),
        action: Set(record.action.to_string()),
        actor_id: Set(Some(actor.actor_id.clone())),
        actor_name: Set(actor.actor_name.clone()),
        previous_state: Set(record.previous_state),
        new_state: Set(record.new_state),
        details: Set(record.details),
        ..Default::default()
    };
    Ok(row.insert(conn).await?)
}

/// Whether a context's assignments were already resolved with `resolved_action`
/// (`consumed` or `released`).
pub async fn context_was_resolved<C: ConnectionTrait>(
    conn: &C,
    context_id: &str,
    resolved_action: &str,
) -> Result<bool, ServiceError> {
    let found = AuditLog::find()
        .filter(audit_log::Column::EntityType.eq(entity::ASSIGNMENT))
        .filter(audit_log::Column::EntityId.eq(context_id))
        .filter(audit_log::Column::Action.eq(resolved_action))
        .one(conn)
        .await?;
    Ok(found.is_some())
}

/// Read side of the audit log
#[derive(Clone)]
pub struct AuditService {
    db_pool: Arc<DatabaseConnection>,
}

impl AuditService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    /// Assignment movements for a context, oldest first.
    #[instrument(skip(self))]
    pub async fn get_assignment_history(
        &self,
        context_id: &str,
    ) -> Result<Vec<audit_log::Model>, ServiceError> {
        self.history(entity::ASSIGNMENT, context_id).await
    }

    /// All rows for one entity, oldest first.
    pub async fn history(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<audit_log::Model>, ServiceError> {
        let db = &*self.db_pool;
        Ok(AuditLog::find()
            .filter(audit_log::Column::EntityType.eq(entity_type))
            .filter(audit_log::Column::EntityId.eq(entity_id))
            .order_by_asc(audit_log::Column::CreatedAt)
            .all(db)
            .await?)
    }

    /// Integrity and operator alerts, newest first.
    pub async fn alerts(&self, limit: u64) -> Result<Vec<audit_log::Model>, ServiceError> {
        use sea_orm::QuerySelect;

        let db = &*self.db_pool;
        Ok(AuditLog::find()
            .filter(
                audit_log::Column::Action
                    .is_in([action::INTEGRITY_ALERT, action::OPERATOR_ALERT]),
            )
            .order_by_desc(audit_log::Column::CreatedAt)
            .limit(limit)
            .all(db)
            .await?)
    }
}
