//! Bin management: creation and freeze flags. Bins are never deleted.

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryOrder, Set,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::auth::Actor;
use crate::db::in_transaction;
use crate::entities::bin::{self, Entity as Bin};
use crate::errors::ServiceError;
use crate::services::audit::{self, action, entity, AuditRecord};

fn validate_bin_code(bin_code: &str) -> Result<(), ServiceError> {
    let trimmed = bin_code.trim();
    if trimmed.is_empty() || trimmed.len() > 64 {
        return Err(ServiceError::ValidationError(
            "bin_code must be 1 to 64 characters".to_string(),
        ));
    }
    Ok(())
}

/// Inserts the bin if it does not exist yet.
pub async fn ensure_bin<C: ConnectionTrait>(conn: &C, bin_code: &str) -> Result<(), ServiceError> {
    let row = bin::ActiveModel {
        bin_code: Set(bin_code.to_string()),
        is_frozen: Set(false),
        freeze_reason: Set(None),
        frozen_by: Set(None),
        frozen_at: Set(None),
        created_at: Set(Utc::now()),
    };
    Bin::insert(row)
        .on_conflict(
            OnConflict::column(bin::Column::BinCode)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    Ok(())
}

#[derive(Clone)]
pub struct BinService {
    db_pool: Arc<DatabaseConnection>,
}

impl BinService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn create_bin(&self, bin_code: &str, actor: &Actor) -> Result<bin::Model, ServiceError> {
        validate_bin_code(bin_code)?;
        let bin_code = bin_code.trim().to_string();
        let actor = actor.clone();

        let created = in_transaction(&self.db_pool, |txn| {
            Box::pin(async move {
                if Bin::find_by_id(bin_code.clone()).one(txn).await?.is_some() {
                    return Err(ServiceError::InvalidOperation(format!(
                        "bin {} already exists",
                        bin_code
                    )));
                }

                let model = bin::ActiveModel {
                    bin_code: Set(bin_code.clone()),
                    is_frozen: Set(false),
                    freeze_reason: Set(None),
                    frozen_by: Set(None),
                    frozen_at: Set(None),
                    created_at: Set(Utc::now()),
                }
                .insert(txn)
                .await?;

                audit::record(
                    txn,
                    &actor,
                    AuditRecord::new(entity::BIN, &bin_code, action::CREATED)
                        .transition(None, Some(json!(model))),
                )
                .await?;
                Ok(model)
            })
        })
        .await?;

        info!(bin_code = %created.bin_code, "bin created");
        Ok(created)
    }

    /// Freezes a bin. Existing assignments against it stay valid; new
    /// reservations skip it.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn freeze_bin(
        &self,
        bin_code: &str,
        reason: &str,
        actor: &Actor,
    ) -> Result<bin::Model, ServiceError> {
        if reason.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "a freeze reason is required".to_string(),
            ));
        }
        let reason = reason.trim().to_string();
        self.set_frozen(bin_code, Some(reason), actor).await
    }

    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn unfreeze_bin(&self, bin_code: &str, actor: &Actor) -> Result<bin::Model, ServiceError> {
        self.set_frozen(bin_code, None, actor).await
    }

    async fn set_frozen(
        &self,
        bin_code: &str,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<bin::Model, ServiceError> {
        let bin_code = bin_code.to_string();
        let actor = actor.clone();

        let updated = in_transaction(&self.db_pool, |txn| {
            Box::pin(async move {
                let current = Bin::find_by_id(bin_code.clone())
                    .one(txn)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(format!("bin {} not found", bin_code)))?;

                let freezing = reason.is_some();
                let mut active: bin::ActiveModel = current.clone().into();
                active.is_frozen = Set(freezing);
                if freezing {
                    active.freeze_reason = Set(reason);
                    active.frozen_by = Set(Some(actor.actor_id.clone()));
                    active.frozen_at = Set(Some(Utc::now()));
                } else {
                    active.freeze_reason = Set(None);
                    active.frozen_by = Set(None);
                    active.frozen_at = Set(None);
                }
                let model = active.update(txn).await?;

                let audit_action = if freezing { action::FROZEN } else { action::UNFROZEN };
                audit::record(
                    txn,
                    &actor,
                    AuditRecord::new(entity::BIN, &bin_code, audit_action)
                        .transition(Some(json!(current)), Some(json!(model))),
                )
                .await?;
                Ok(model)
            })
        })
        .await?;

        counter!("stockkeeper.bins.freeze_changes", 1);
        info!(
            bin_code = %updated.bin_code,
            is_frozen = updated.is_frozen,
            "bin freeze flag changed"
        );
        Ok(updated)
    }

    pub async fn get_bin(&self, bin_code: &str) -> Result<bin::Model, ServiceError> {
        Bin::find_by_id(bin_code.to_string())
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("bin {} not found", bin_code)))
    }

    pub async fn list_bins(&self) -> Result<Vec<bin::Model>, ServiceError> {
        Ok(Bin::find()
            .order_by_asc(bin::Column::BinCode)
            .all(&*self.db_pool)
            .await?)
    }
}
