use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter as StrumEnumIter, EnumString};
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;

/// Lifecycle of a picking session.
///
/// `InProgress` is the only initial state; `Completed` and `Cancelled` are
/// terminal. Any non-terminal state may move to `Cancelled` or `Error`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    StrumEnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Verified,
    Emitting,
    Completed,
    Cancelled,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// Statuses a zombie sweep looks at.
    pub fn is_mid_flight(&self) -> bool {
        matches!(self, SessionStatus::InProgress | SessionStatus::Emitting)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Cancelled) | (_, Error) => true,
            (InProgress, Verified) => true,
            (Verified, Emitting) => true,
            // finalize retries re-enter emission from a failed attempt
            (Error, Emitting) => true,
            (Emitting, Completed) => true,
            _ => false,
        }
    }
}

/// One requested line of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SessionLine {
    #[validate(length(min = 1, max = 128))]
    pub sku: String,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

/// Picker metadata carried by a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNotes {
    pub picker_id: Option<String>,
    pub picker_name: Option<String>,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "picking_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub status: String,
    pub version: i32,
    pub lines: Json,
    pub notes: Json,
    pub external_document_id: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn status(&self) -> Result<SessionStatus, ServiceError> {
        SessionStatus::from_str(&self.status).map_err(|_| {
            ServiceError::InternalError(format!(
                "session {} has unknown status '{}'",
                self.id, self.status
            ))
        })
    }

    pub fn lines(&self) -> Result<Vec<SessionLine>, ServiceError> {
        serde_json::from_value(self.lines.clone()).map_err(|e| {
            ServiceError::InternalError(format!("session {} has malformed lines: {}", self.id, e))
        })
    }

    /// Notes are advisory; malformed notes degrade to empty rather than failing reads.
    pub fn notes(&self) -> SessionNotes {
        serde_json::from_value(self.notes.clone()).unwrap_or_default()
    }

    /// Assignments made for a session are keyed by its id.
    pub fn context_id(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
