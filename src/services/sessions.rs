//! Session State Machine
//!
//! Long-lived picking sessions. Every mutation names the version it was
//! computed against; the write is a conditional `UPDATE ... WHERE version = ?`
//! that bumps the version by one, so two racing callers produce exactly one
//! winner and one [`ServiceError::VersionConflict`].
//!
//! The session id doubles as the reservation context id.

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::Actor;
use crate::db::in_transaction;
use crate::entities::picking_session::{self, Column, Entity as PickingSession};
use crate::entities::{SessionLine, SessionNotes, SessionStatus};
use crate::errors::ServiceError;
use crate::services::audit::{self, action, entity, AuditRecord};
use crate::services::document_emitter::{DocumentEmitter, EmissionStrategy};
use crate::services::emissions::{EmissionTicket, EmissionTracker};
use crate::services::reservation::{
    release_all_in, reserve_in, AllocationRequest, ReservationService, ResolutionSummary,
};

/// Emission type used for the document a finalized session produces.
pub const SESSION_EMISSION_TYPE: &str = "invoice";

/// Outcome of cancelling a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub session: picking_session::Model,
    pub released: ResolutionSummary,
}

/// Fields a versioned write may touch besides version and activity time.
#[derive(Debug, Clone, Default)]
struct SessionChanges {
    status: Option<SessionStatus>,
    notes: Option<SessionNotes>,
    external_document_id: Option<String>,
    last_error: Option<Option<String>>,
    bump_retry: bool,
}

impl SessionChanges {
    fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    fn failed(message: String) -> Self {
        Self {
            status: Some(SessionStatus::Error),
            last_error: Some(Some(message)),
            bump_retry: true,
            ..Default::default()
        }
    }
}

async fn load<C: ConnectionTrait>(
    conn: &C,
    session_id: Uuid,
) -> Result<picking_session::Model, ServiceError> {
    PickingSession::find_by_id(session_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session {} not found", session_id)))
}

fn check_version(current: &picking_session::Model, expected_version: i32) -> Result<(), ServiceError> {
    if current.version != expected_version {
        counter!("stockkeeper.sessions.version_conflicts", 1);
        return Err(ServiceError::VersionConflict {
            session_id: current.id,
            expected: expected_version,
            current: current.version,
        });
    }
    Ok(())
}

fn check_transition(
    current: &picking_session::Model,
    to: SessionStatus,
) -> Result<SessionStatus, ServiceError> {
    let from = current.status()?;
    if !from.can_transition_to(to) {
        return Err(ServiceError::InvalidTransition {
            session_id: current.id,
            from,
            to,
        });
    }
    Ok(from)
}

/// Applies `changes` if the row is still at `current.version`.
async fn write_versioned<C: ConnectionTrait>(
    conn: &C,
    current: &picking_session::Model,
    changes: SessionChanges,
) -> Result<picking_session::Model, ServiceError> {
    let now = Utc::now();
    let mut active = picking_session::ActiveModel {
        version: Set(current.version + 1),
        last_activity_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    if let Some(status) = changes.status {
        active.status = Set(status.to_string());
    }
    if let Some(notes) = changes.notes {
        active.notes = Set(to_json(&notes)?);
    }
    if let Some(document_id) = changes.external_document_id {
        active.external_document_id = Set(Some(document_id));
    }
    if let Some(last_error) = changes.last_error {
        active.last_error = Set(last_error);
    }

    let mut update = PickingSession::update_many().set(active);
    if changes.bump_retry {
        update = update.col_expr(Column::RetryCount, Expr::col(Column::RetryCount).add(1));
    }
    let result = update
        .filter(Column::Id.eq(current.id))
        .filter(Column::Version.eq(current.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let latest = load(conn, current.id).await?;
        counter!("stockkeeper.sessions.version_conflicts", 1);
        return Err(ServiceError::VersionConflict {
            session_id: current.id,
            expected: current.version,
            current: latest.version,
        });
    }

    load(conn, current.id).await
}

/// Version check, transition check, write and audit in one go.
async fn transition_in<C: ConnectionTrait>(
    conn: &C,
    current: &picking_session::Model,
    changes: SessionChanges,
    actor: &Actor,
) -> Result<picking_session::Model, ServiceError> {
    let from = current.status()?;
    if let Some(to) = changes.status {
        if to != from {
            check_transition(current, to)?;
        }
    }
    let details = changes.last_error.clone().flatten();
    let updated = write_versioned(conn, current, changes).await?;

    if updated.status != current.status {
        let mut record = AuditRecord::new(entity::SESSION, updated.id.to_string(), action::STATUS_CHANGED)
            .transition(
                Some(json!({ "status": current.status, "version": current.version })),
                Some(json!({ "status": updated.status, "version": updated.version })),
            );
        if let Some(message) = details {
            record = record.details(json!({ "last_error": message }));
        }
        audit::record(conn, actor, record).await?;
    }
    Ok(updated)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(|e| ServiceError::InternalError(e.to_string()))
}

/// Runs `op` with `expected_version`; on a version conflict runs it once more
/// with the version the conflict reported.
pub async fn with_conflict_retry<T, F, Fut>(expected_version: i32, mut op: F) -> Result<T, ServiceError>
where
    F: FnMut(i32) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    match op(expected_version).await {
        Err(ServiceError::VersionConflict {
            session_id,
            current,
            ..
        }) => {
            counter!("stockkeeper.sessions.conflict_retries", 1);
            info!(%session_id, expected_version, current, "retrying after version conflict");
            op(current).await
        }
        other => other,
    }
}

#[derive(Clone)]
pub struct SessionService {
    db_pool: Arc<DatabaseConnection>,
    reservations: ReservationService,
    emissions: EmissionTracker,
    emitter: Option<Arc<dyn DocumentEmitter>>,
    strategy: EmissionStrategy,
}

impl SessionService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        reservations: ReservationService,
        emissions: EmissionTracker,
        emitter: Option<Arc<dyn DocumentEmitter>>,
        strategy: EmissionStrategy,
    ) -> Self {
        Self {
            db_pool,
            reservations,
            emissions,
            emitter,
            strategy,
        }
    }

    pub fn strategy(&self) -> EmissionStrategy {
        self.strategy
    }

    /// Starts a session and reserves its lines under the session id.
    #[instrument(skip(self, lines, notes, actor), fields(lines = lines.len(), actor = %actor.actor_id))]
    pub async fn create_session(
        &self,
        lines: Vec<SessionLine>,
        notes: SessionNotes,
        actor: &Actor,
    ) -> Result<picking_session::Model, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "a session needs at least one line".to_string(),
            ));
        }
        for line in &lines {
            line.validate()?;
        }

        let session_id = Uuid::new_v4();
        let now = Utc::now();
        let row = picking_session::ActiveModel {
            id: Set(session_id),
            status: Set(SessionStatus::InProgress.to_string()),
            version: Set(1),
            lines: Set(to_json(&lines)?),
            notes: Set(to_json(&notes)?),
            external_document_id: Set(None),
            last_activity_at: Set(now),
            retry_count: Set(0),
            last_error: Set(None),
            created_by: Set(actor.actor_id.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let requests: Vec<AllocationRequest> = lines
            .iter()
            .map(|l| AllocationRequest::new(l.sku.clone(), l.quantity))
            .collect();
        let who = actor.clone();

        let result = in_transaction(&self.db_pool, |txn| {
            Box::pin(async move {
                let session = row.insert(txn).await?;
                reserve_in(txn, &session.context_id(), &requests, &who).await?;
                audit::record(
                    txn,
                    &who,
                    AuditRecord::new(entity::SESSION, session.id.to_string(), action::CREATED)
                        .transition(None, Some(json!({ "status": session.status, "version": 1 })))
                        .details(json!({ "lines": session.lines, "notes": session.notes })),
                )
                .await?;
                Ok(session)
            })
        })
        .await;

        match result {
            Ok(session) => {
                counter!("stockkeeper.sessions.created", 1);
                info!(session_id = %session.id, "session started");
                Ok(session)
            }
            Err(err) => Err(self.reservations.describe_error(err).await),
        }
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<picking_session::Model, ServiceError> {
        load(&*self.db_pool, session_id).await
    }

    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<picking_session::Model>, ServiceError> {
        let mut query = PickingSession::find().order_by_desc(Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(Column::Status.eq(status.as_ref()));
        }
        Ok(query.all(&*self.db_pool).await?)
    }

    /// `in_progress -> verified`
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn verify(
        &self,
        session_id: Uuid,
        expected_version: i32,
        actor: &Actor,
    ) -> Result<picking_session::Model, ServiceError> {
        self.transition(
            session_id,
            expected_version,
            SessionChanges::status(SessionStatus::Verified),
            actor,
        )
        .await
    }

    /// Heartbeat while a picker works; optionally replaces the notes.
    #[instrument(skip(self, notes, actor), fields(actor = %actor.actor_id))]
    pub async fn record_activity(
        &self,
        session_id: Uuid,
        expected_version: i32,
        notes: Option<SessionNotes>,
        actor: &Actor,
    ) -> Result<picking_session::Model, ServiceError> {
        let db = &*self.db_pool;
        let current = load(db, session_id).await?;
        check_version(&current, expected_version)?;
        if current.status()?.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "session {} is {}",
                session_id, current.status
            )));
        }
        write_versioned(
            db,
            &current,
            SessionChanges {
                notes,
                ..Default::default()
            },
        )
        .await
    }

    /// Cancels the session and releases everything it still holds, atomically.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn cancel(
        &self,
        session_id: Uuid,
        expected_version: i32,
        actor: &Actor,
    ) -> Result<CancelOutcome, ServiceError> {
        let who = actor.clone();
        let outcome = in_transaction(&self.db_pool, |txn| {
            Box::pin(async move {
                let current = load(txn, session_id).await?;
                check_version(&current, expected_version)?;
                check_transition(&current, SessionStatus::Cancelled)?;

                let released = release_all_in(txn, &current.context_id(), &who).await?;
                let session = transition_in(
                    txn,
                    &current,
                    SessionChanges::status(SessionStatus::Cancelled),
                    &who,
                )
                .await?;
                Ok(CancelOutcome { session, released })
            })
        })
        .await?;

        counter!("stockkeeper.sessions.cancelled", 1);
        info!(
            %session_id,
            released_units = outcome.released.units,
            "session cancelled"
        );
        Ok(outcome)
    }

    async fn transition(
        &self,
        session_id: Uuid,
        expected_version: i32,
        changes: SessionChanges,
        actor: &Actor,
    ) -> Result<picking_session::Model, ServiceError> {
        let who = actor.clone();
        in_transaction(&self.db_pool, |txn| {
            Box::pin(async move {
                let current = load(txn, session_id).await?;
                check_version(&current, expected_version)?;
                transition_in(txn, &current, changes, &who).await
            })
        })
        .await
    }

    /// Writes `changes` on top of `current` outside of a caller transaction.
    async fn advance(
        &self,
        current: &picking_session::Model,
        changes: SessionChanges,
        actor: &Actor,
    ) -> Result<picking_session::Model, ServiceError> {
        let snapshot = current.clone();
        let who = actor.clone();
        in_transaction(&self.db_pool, |txn| {
            Box::pin(async move { transition_in(txn, &snapshot, changes, &who).await })
        })
        .await
    }

    /// Emits the session's document (once) and consumes its stock.
    ///
    /// Accepts `verified`, and `error` or `emitting` as resumption points.
    /// A document id already on the session means the external call is
    /// skipped. On a consume failure the session moves to `error` with its
    /// assignments untouched so a later call can resume.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn finalize(
        &self,
        session_id: Uuid,
        expected_version: i32,
        actor: &Actor,
    ) -> Result<picking_session::Model, ServiceError> {
        let current = self.get_session(session_id).await?;
        check_version(&current, expected_version)?;

        let status = current.status()?;
        let mut session = match status {
            SessionStatus::Verified | SessionStatus::Error => {
                self.advance(&current, SessionChanges::status(SessionStatus::Emitting), actor)
                    .await?
            }
            // resuming: claim the session with a version bump
            SessionStatus::Emitting => {
                self.advance(&current, SessionChanges::default(), actor)
                    .await?
            }
            from => {
                return Err(ServiceError::InvalidTransition {
                    session_id,
                    from,
                    to: SessionStatus::Emitting,
                })
            }
        };

        if self.strategy == EmissionStrategy::Live && session.external_document_id.is_none() {
            session = self.emit_document(session, actor).await?;
        }

        let context_id = session.context_id();
        match self.reservations.consume(&context_id, actor).await {
            Ok(summary) => {
                let completed = self
                    .advance(&session, SessionChanges::status(SessionStatus::Completed), actor)
                    .await?;
                counter!("stockkeeper.sessions.completed", 1);
                info!(
                    %session_id,
                    units = summary.units,
                    version = completed.version,
                    "session completed"
                );
                Ok(completed)
            }
            Err(err) => {
                error!(%session_id, error = %err, "consume failed during finalize");
                let message = err.to_string();
                if let Err(write_err) = self
                    .advance(&session, SessionChanges::failed(message), actor)
                    .await
                {
                    warn!(%session_id, error = %write_err, "could not record finalize failure");
                }
                Err(err)
            }
        }
    }

    /// Obtains the external document for an emitting session.
    async fn emit_document(
        &self,
        session: picking_session::Model,
        actor: &Actor,
    ) -> Result<picking_session::Model, ServiceError> {
        let context_id = session.context_id();
        let payload = json!({
            "session_id": session.id,
            "lines": session.lines,
            "notes": session.notes,
            "created_by": session.created_by,
        });

        let ticket = self
            .emissions
            .get_or_create_emission(&context_id, SESSION_EMISSION_TYPE, payload.clone(), actor)
            .await?;

        let document_id = match ticket {
            EmissionTicket::Completed(done) => {
                info!(session_id = %session.id, "document already emitted; skipping external call");
                done.external_document_id.ok_or_else(|| {
                    ServiceError::InternalError(format!(
                        "completed emission {} has no document id",
                        done.id
                    ))
                })?
            }
            EmissionTicket::InFlight(pending) => {
                return Err(ServiceError::EmissionInFlight(pending.idempotency_key));
            }
            EmissionTicket::Claimed(claimed) => {
                let emitter = self.emitter.as_ref().ok_or_else(|| {
                    ServiceError::InternalError("no document emitter configured".to_string())
                })?;

                match emitter.emit(&claimed.idempotency_key, &payload).await {
                    Ok(document) => {
                        self.emissions
                            .complete_emission_success(
                                claimed.id,
                                to_json(&document)?,
                                &document.external_document_id,
                                actor,
                            )
                            .await?;
                        document.external_document_id
                    }
                    Err(emit_err) => {
                        let message = emit_err.to_string();
                        self.emissions
                            .complete_emission_failure(
                                claimed.id,
                                &message,
                                Some(emit_err.details()),
                                actor,
                            )
                            .await?;
                        self.advance(&session, SessionChanges::failed(message.clone()), actor)
                            .await?;
                        return Err(ServiceError::ExternalEmissionFailure(message));
                    }
                }
            }
        };

        self.advance(
            &session,
            SessionChanges {
                external_document_id: Some(document_id),
                ..Default::default()
            },
            actor,
        )
        .await
    }
}
