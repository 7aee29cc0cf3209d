use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EmissionStatus {
    Pending,
    Completed,
    Failed,
}

/// One attempt at emitting an external document for a context.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "emissions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub context_id: String,
    pub emission_type: String,
    #[sea_orm(unique)]
    pub idempotency_key: String,
    pub attempt_number: i32,
    pub status: String,
    pub request_payload: Json,
    pub response_payload: Option<Json>,
    pub external_document_id: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn status(&self) -> Result<EmissionStatus, ServiceError> {
        EmissionStatus::from_str(&self.status).map_err(|_| {
            ServiceError::InternalError(format!(
                "emission {} has unknown status '{}'",
                self.id, self.status
            ))
        })
    }

    pub fn is_completed(&self) -> bool {
        self.status == EmissionStatus::Completed.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.status == EmissionStatus::Pending.as_ref()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
