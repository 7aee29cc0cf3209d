//! Zombie Detector / Recoverer
//!
//! A session is a zombie when it sits in `in_progress` or `emitting` with no
//! activity for longer than the configured timeout. Detection is a pure
//! read; recovery re-checks the caller's version before doing anything.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::Actor;
use crate::entities::picking_session::{self, Column, Entity as PickingSession};
use crate::entities::SessionStatus;
use crate::errors::ServiceError;
use crate::services::audit::{self, action, entity, AuditRecord};
use crate::services::emissions::EmissionTracker;
use crate::services::sessions::{SessionService, SESSION_EMISSION_TYPE};

/// Read-only view of a stuck session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZombieSession {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub version: i32,
    pub last_activity_at: DateTime<Utc>,
    pub idle_secs: i64,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub external_document_id: Option<String>,
    pub created_by: String,
    pub picker_name: Option<String>,
}

impl ZombieSession {
    fn from_model(model: &picking_session::Model, now: DateTime<Utc>) -> Result<Self, ServiceError> {
        Ok(Self {
            session_id: model.id,
            status: model.status()?,
            version: model.version,
            last_activity_at: model.last_activity_at,
            idle_secs: (now - model.last_activity_at).num_seconds(),
            retry_count: model.retry_count,
            last_error: model.last_error.clone(),
            external_document_id: model.external_document_id.clone(),
            created_by: model.created_by.clone(),
            picker_name: model.notes().picker_name,
        })
    }
}

/// What a recovery attempt did
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Finalize was retried and the session completed.
    Resumed { session: picking_session::Model },
    /// The session was cancelled and its stock released.
    Cancelled {
        session: picking_session::Model,
        released_units: i32,
        /// False when the cancel was requested rather than a fallback
        alerted: bool,
    },
    /// Left for an operator; nothing was changed automatically.
    Escalated { session_id: Uuid, reason: String },
}

fn is_stale(model: &picking_session::Model, cutoff: DateTime<Utc>) -> Result<bool, ServiceError> {
    Ok(model.status()?.is_mid_flight() && model.last_activity_at < cutoff)
}

#[derive(Clone)]
pub struct ZombieRecoverer {
    db_pool: Arc<DatabaseConnection>,
    sessions: SessionService,
    emissions: EmissionTracker,
    timeout: Duration,
}

impl ZombieRecoverer {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        sessions: SessionService,
        emissions: EmissionTracker,
        timeout: Duration,
    ) -> Self {
        Self {
            db_pool,
            sessions,
            emissions,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = ChronoDuration::from_std(self.timeout)
            .unwrap_or_else(|_| ChronoDuration::days(365));
        now - timeout
    }

    /// Sessions idle past the timeout, oldest activity first.
    #[instrument(skip(self))]
    pub async fn detect_zombies(&self) -> Result<Vec<ZombieSession>, ServiceError> {
        let now = Utc::now();
        let rows = PickingSession::find()
            .filter(Column::Status.is_in([
                SessionStatus::InProgress.as_ref(),
                SessionStatus::Emitting.as_ref(),
            ]))
            .filter(Column::LastActivityAt.lt(self.cutoff(now)))
            .order_by_asc(Column::LastActivityAt)
            .all(&*self.db_pool)
            .await?;

        let zombies = rows
            .iter()
            .map(|row| ZombieSession::from_model(row, now))
            .collect::<Result<Vec<_>, _>>()?;
        gauge!("stockkeeper.zombies.detected", zombies.len() as f64);
        Ok(zombies)
    }

    /// Cancels or resumes a zombie.
    ///
    /// With `force_cancel` the session is cancelled outright. Otherwise an
    /// `emitting` session is finalized again; an abandoned `in_progress`
    /// session cannot be resumed and is cancelled. Any fallback is raised as
    /// an operator alert.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn recover_zombie(
        &self,
        session_id: Uuid,
        expected_version: i32,
        force_cancel: bool,
        actor: &Actor,
    ) -> Result<RecoveryOutcome, ServiceError> {
        let session = self.sessions.get_session(session_id).await?;
        if session.version != expected_version {
            counter!("stockkeeper.sessions.version_conflicts", 1);
            return Err(ServiceError::VersionConflict {
                session_id,
                expected: expected_version,
                current: session.version,
            });
        }
        if !is_stale(&session, self.cutoff(Utc::now()))? {
            return Err(ServiceError::InvalidOperation(format!(
                "session {} is {} and active; not a zombie",
                session_id, session.status
            )));
        }
        counter!("stockkeeper.zombies.recoveries", 1);

        if force_cancel {
            let outcome = self.sessions.cancel(session_id, expected_version, actor).await?;
            info!(%session_id, "zombie cancelled on request");
            return Ok(RecoveryOutcome::Cancelled {
                session: outcome.session,
                released_units: outcome.released.units,
                alerted: false,
            });
        }

        match session.status()? {
            SessionStatus::Emitting => self.resume_emitting(session, actor).await,
            _ => {
                let outcome = self.sessions.cancel(session_id, expected_version, actor).await?;
                self.operator_alert(
                    session_id,
                    "abandoned while in progress; cancelled and stock released",
                    actor,
                )
                .await;
                Ok(RecoveryOutcome::Cancelled {
                    session: outcome.session,
                    released_units: outcome.released.units,
                    alerted: true,
                })
            }
        }
    }

    async fn resume_emitting(
        &self,
        session: picking_session::Model,
        actor: &Actor,
    ) -> Result<RecoveryOutcome, ServiceError> {
        let session_id = session.id;

        if session.external_document_id.is_none() {
            let latest = self
                .emissions
                .latest(&session.context_id(), SESSION_EMISSION_TYPE)
                .await?;
            // the external call may still land; only an operator can tell
            if latest.as_ref().is_some_and(|e| e.is_pending()) {
                let reason = "emission attempt still pending; external system must be checked";
                self.operator_alert(session_id, reason, actor).await;
                return Ok(RecoveryOutcome::Escalated {
                    session_id,
                    reason: reason.to_string(),
                });
            }
        }

        let failure = match self.sessions.finalize(session_id, session.version, actor).await {
            Ok(completed) => {
                info!(%session_id, "zombie resumed and completed");
                return Ok(RecoveryOutcome::Resumed { session: completed });
            }
            Err(err @ ServiceError::VersionConflict { .. }) => return Err(err),
            Err(err) => err,
        };

        warn!(%session_id, error = %failure, "resuming zombie failed");
        let current = self.sessions.get_session(session_id).await?;

        if current.external_document_id.is_some() {
            let reason = format!(
                "document {} already emitted but finalize failed: {}",
                current.external_document_id.as_deref().unwrap_or_default(),
                failure
            );
            self.operator_alert(session_id, &reason, actor).await;
            return Ok(RecoveryOutcome::Escalated { session_id, reason });
        }

        if current.status()?.is_terminal() {
            return Err(failure);
        }

        let outcome = self.sessions.cancel(session_id, current.version, actor).await?;
        self.operator_alert(
            session_id,
            &format!("finalize could not be resumed ({}); cancelled", failure),
            actor,
        )
        .await;
        Ok(RecoveryOutcome::Cancelled {
            session: outcome.session,
            released_units: outcome.released.units,
            alerted: true,
        })
    }

    async fn operator_alert(&self, session_id: Uuid, reason: &str, actor: &Actor) {
        counter!("stockkeeper.zombies.alerts", 1);
        error!(alert = true, %session_id, reason, "zombie recovery needs an operator");

        let record = AuditRecord::new(entity::SESSION, session_id.to_string(), action::OPERATOR_ALERT)
            .details(json!({ "reason": reason }));
        if let Err(e) = audit::record(&*self.db_pool, actor, record).await {
            error!(%session_id, error = %e, "failed to record operator alert");
        }
    }

    /// One sweep: log every zombie and optionally try to recover it.
    pub async fn sweep(&self, auto_recover: bool) -> Result<usize, ServiceError> {
        let zombies = self.detect_zombies().await?;
        let actor = Actor::system();

        for zombie in &zombies {
            warn!(
                session_id = %zombie.session_id,
                status = %zombie.status,
                idle_secs = zombie.idle_secs,
                "zombie session detected"
            );
            if !auto_recover {
                continue;
            }
            match self
                .recover_zombie(zombie.session_id, zombie.version, false, &actor)
                .await
            {
                Ok(outcome) => debug!(session_id = %zombie.session_id, ?outcome, "zombie handled"),
                Err(e) => error!(
                    alert = true,
                    session_id = %zombie.session_id,
                    error = %e,
                    "zombie recovery failed"
                ),
            }
        }
        Ok(zombies.len())
    }
}

/// Spawns the periodic sweep.
pub fn start_sweeper(
    recoverer: ZombieRecoverer,
    interval: Duration,
    auto_recover: bool,
) -> JoinHandle<()> {
    info!(
        interval_secs = interval.as_secs(),
        timeout_secs = recoverer.timeout().as_secs(),
        auto_recover,
        "starting zombie sweeper"
    );

    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);
        loop {
            interval_timer.tick().await;
            if let Err(e) = recoverer.sweep(auto_recover).await {
                warn!(error = %e, "zombie sweep failed");
            }
        }
    })
}
