//! Public face of the engine.
//!
//! [`StockEngine`] wires the services together, gates every mutation through
//! the [`PermissionChecker`], and converts results into [`OperationResult`]
//! so callers never see a raw error cross the boundary.

use metrics::counter;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::auth::{Action, Actor, AllowAll, PermissionChecker};
use crate::catalog::{InMemoryCatalog, ProductCatalog};
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::entities::{
    assignment, audit_log, bin, emission, picking_session, stock_entry, SessionLine,
    SessionNotes, SessionStatus,
};
use crate::errors::ServiceError;
use crate::services::audit::AuditService;
use crate::services::bins::BinService;
use crate::services::document_emitter::{DocumentEmitter, EmissionStrategy, HttpDocumentEmitter};
use crate::services::emissions::{EmissionTicket, EmissionTracker};
use crate::services::inventory::{InventoryService, StockLevel};
use crate::services::reservation::{AllocationRequest, ReservationService, ResolutionSummary};
use crate::services::sessions::{with_conflict_retry, CancelOutcome, SessionService};
use crate::services::zombies::{RecoveryOutcome, ZombieRecoverer, ZombieSession};
use crate::OperationResult;

const DEFAULT_ZOMBIE_TIMEOUT: Duration = Duration::from_secs(300);

/// Assembles a [`StockEngine`]; every collaborator has a default.
pub struct StockEngineBuilder {
    db_pool: Arc<DbPool>,
    catalog: Arc<dyn ProductCatalog>,
    permissions: Arc<dyn PermissionChecker>,
    emitter: Option<Arc<dyn DocumentEmitter>>,
    strategy: EmissionStrategy,
    zombie_timeout: Duration,
}

impl StockEngineBuilder {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self {
            db_pool,
            catalog: Arc::new(InMemoryCatalog::new()),
            permissions: Arc::new(AllowAll),
            emitter: None,
            strategy: EmissionStrategy::Migration,
            zombie_timeout: DEFAULT_ZOMBIE_TIMEOUT,
        }
    }

    /// Emission mode, emitter and zombie timeout taken from configuration.
    pub fn from_config(db_pool: Arc<DbPool>, cfg: &AppConfig) -> Result<Self, ServiceError> {
        let strategy = cfg.emission_strategy();
        let mut builder = Self::new(db_pool)
            .emission_strategy(strategy)
            .zombie_timeout(cfg.zombie_timeout());

        if strategy == EmissionStrategy::Live {
            let url = cfg.emission_service_url.as_deref().ok_or_else(|| {
                ServiceError::ValidationError(
                    "emission_service_url is required in live mode".to_string(),
                )
            })?;
            builder = builder.emitter(Arc::new(HttpDocumentEmitter::new(
                url,
                cfg.emission_timeout(),
            )?));
        }
        Ok(builder)
    }

    pub fn catalog(mut self, catalog: Arc<dyn ProductCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn DocumentEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn emission_strategy(mut self, strategy: EmissionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn zombie_timeout(mut self, timeout: Duration) -> Self {
        self.zombie_timeout = timeout;
        self
    }

    pub fn build(self) -> StockEngine {
        let db = self.db_pool;
        let reservations = ReservationService::new(db.clone(), self.catalog);
        let emissions = EmissionTracker::new(db.clone());
        let sessions = SessionService::new(
            db.clone(),
            reservations.clone(),
            emissions.clone(),
            self.emitter,
            self.strategy,
        );
        let zombies = ZombieRecoverer::new(
            db.clone(),
            sessions.clone(),
            emissions.clone(),
            self.zombie_timeout,
        );

        StockEngine {
            permissions: self.permissions,
            reservations,
            sessions,
            zombies,
            emissions,
            inventory: InventoryService::new(db.clone()),
            bins: BinService::new(db.clone()),
            audit: AuditService::new(db),
        }
    }
}

#[derive(Clone)]
pub struct StockEngine {
    permissions: Arc<dyn PermissionChecker>,
    reservations: ReservationService,
    sessions: SessionService,
    zombies: ZombieRecoverer,
    emissions: EmissionTracker,
    inventory: InventoryService,
    bins: BinService,
    audit: AuditService,
}

impl StockEngine {
    pub fn builder(db_pool: Arc<DbPool>) -> StockEngineBuilder {
        StockEngineBuilder::new(db_pool)
    }

    /// Recoverer handed to the background sweeper
    pub fn zombie_recoverer(&self) -> ZombieRecoverer {
        self.zombies.clone()
    }

    pub fn emission_strategy(&self) -> EmissionStrategy {
        self.sessions.strategy()
    }

    async fn authorize(&self, actor: &Actor, action: Action) -> Result<(), ServiceError> {
        if self.permissions.can_perform(&actor.actor_id, action).await {
            return Ok(());
        }
        counter!("stockkeeper.permission_denied", 1);
        warn!(actor = %actor.actor_id, %action, "permission denied");
        Err(ServiceError::Forbidden(format!(
            "{} may not {}",
            actor.display_name(),
            action
        )))
    }

    async fn gated<T, Fut>(&self, actor: &Actor, action: Action, op: Fut) -> OperationResult<T>
    where
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match self.authorize(actor, action).await {
            Ok(()) => op.await.into(),
            Err(err) => OperationResult::failure(&err),
        }
    }

    // ---- reservations ----

    pub async fn reserve(
        &self,
        context_id: &str,
        lines: &[AllocationRequest],
        actor: &Actor,
    ) -> OperationResult<Vec<assignment::Model>> {
        self.gated(
            actor,
            Action::Reserve,
            self.reservations.reserve(context_id, lines, actor),
        )
        .await
    }

    pub async fn consume(&self, context_id: &str, actor: &Actor) -> OperationResult<ResolutionSummary> {
        self.gated(actor, Action::Consume, self.reservations.consume(context_id, actor))
            .await
    }

    pub async fn release(&self, context_id: &str, actor: &Actor) -> OperationResult<ResolutionSummary> {
        self.gated(actor, Action::Release, self.reservations.release(context_id, actor))
            .await
    }

    pub async fn reassign_assignment(
        &self,
        context_id: &str,
        assignment_id: Uuid,
        actor: &Actor,
    ) -> OperationResult<Vec<assignment::Model>> {
        self.gated(
            actor,
            Action::Reserve,
            self.reservations
                .reassign_assignment(context_id, assignment_id, actor),
        )
        .await
    }

    pub async fn assignments(&self, context_id: &str) -> OperationResult<Vec<assignment::Model>> {
        self.reservations.assignments_for(context_id).await.into()
    }

    pub async fn get_assignment_history(
        &self,
        context_id: &str,
    ) -> OperationResult<Vec<audit_log::Model>> {
        self.audit.get_assignment_history(context_id).await.into()
    }

    pub async fn alerts(&self, limit: u64) -> OperationResult<Vec<audit_log::Model>> {
        self.audit.alerts(limit).await.into()
    }

    // ---- sessions ----

    pub async fn create_session(
        &self,
        lines: Vec<SessionLine>,
        notes: SessionNotes,
        actor: &Actor,
    ) -> OperationResult<picking_session::Model> {
        self.gated(
            actor,
            Action::Reserve,
            self.sessions.create_session(lines, notes, actor),
        )
        .await
    }

    pub async fn get_session(&self, session_id: Uuid) -> OperationResult<picking_session::Model> {
        self.sessions.get_session(session_id).await.into()
    }

    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> OperationResult<Vec<picking_session::Model>> {
        self.sessions.list_sessions(status).await.into()
    }

    pub async fn verify_session(
        &self,
        session_id: Uuid,
        expected_version: i32,
        actor: &Actor,
    ) -> OperationResult<picking_session::Model> {
        let sessions = &self.sessions;
        self.gated(
            actor,
            Action::Reserve,
            with_conflict_retry(expected_version, |version| {
                sessions.verify(session_id, version, actor)
            }),
        )
        .await
    }

    pub async fn record_activity(
        &self,
        session_id: Uuid,
        expected_version: i32,
        notes: Option<SessionNotes>,
        actor: &Actor,
    ) -> OperationResult<picking_session::Model> {
        let sessions = &self.sessions;
        self.gated(
            actor,
            Action::Reserve,
            with_conflict_retry(expected_version, |version| {
                sessions.record_activity(session_id, version, notes.clone(), actor)
            }),
        )
        .await
    }

    pub async fn finalize_session(
        &self,
        session_id: Uuid,
        expected_version: i32,
        actor: &Actor,
    ) -> OperationResult<picking_session::Model> {
        let sessions = &self.sessions;
        self.gated(
            actor,
            Action::Finalize,
            with_conflict_retry(expected_version, |version| {
                sessions.finalize(session_id, version, actor)
            }),
        )
        .await
    }

    pub async fn cancel_session(
        &self,
        session_id: Uuid,
        expected_version: i32,
        actor: &Actor,
    ) -> OperationResult<CancelOutcome> {
        let sessions = &self.sessions;
        self.gated(
            actor,
            Action::Cancel,
            with_conflict_retry(expected_version, |version| {
                sessions.cancel(session_id, version, actor)
            }),
        )
        .await
    }

    // ---- zombies ----

    pub async fn detect_zombies(&self) -> OperationResult<Vec<ZombieSession>> {
        self.zombies.detect_zombies().await.into()
    }

    /// Not auto-retried: a version change means someone touched the session
    /// after it was detected.
    pub async fn recover_zombie(
        &self,
        session_id: Uuid,
        expected_version: i32,
        force_cancel: bool,
        actor: &Actor,
    ) -> OperationResult<RecoveryOutcome> {
        self.gated(
            actor,
            Action::Recover,
            self.zombies
                .recover_zombie(session_id, expected_version, force_cancel, actor),
        )
        .await
    }

    // ---- emissions ----

    pub async fn get_or_create_emission(
        &self,
        context_id: &str,
        emission_type: &str,
        request_payload: Value,
        actor: &Actor,
    ) -> OperationResult<EmissionTicket> {
        self.gated(
            actor,
            Action::Finalize,
            self.emissions
                .get_or_create_emission(context_id, emission_type, request_payload, actor),
        )
        .await
    }

    pub async fn complete_emission_success(
        &self,
        emission_id: Uuid,
        response_payload: Value,
        external_document_id: &str,
        actor: &Actor,
    ) -> OperationResult<emission::Model> {
        self.gated(
            actor,
            Action::Finalize,
            self.emissions.complete_emission_success(
                emission_id,
                response_payload,
                external_document_id,
                actor,
            ),
        )
        .await
    }

    pub async fn complete_emission_failure(
        &self,
        emission_id: Uuid,
        error_message: &str,
        error_details: Option<Value>,
        actor: &Actor,
    ) -> OperationResult<emission::Model> {
        self.gated(
            actor,
            Action::Finalize,
            self.emissions
                .complete_emission_failure(emission_id, error_message, error_details, actor),
        )
        .await
    }

    pub async fn emission_attempts(
        &self,
        context_id: &str,
        emission_type: &str,
    ) -> OperationResult<Vec<emission::Model>> {
        self.emissions.attempts(context_id, emission_type).await.into()
    }

    // ---- stock and bins ----

    pub async fn receive_stock(
        &self,
        sku: &str,
        bin_code: &str,
        quantity: i32,
        actor: &Actor,
    ) -> OperationResult<stock_entry::Model> {
        self.gated(
            actor,
            Action::ReceiveStock,
            self.inventory.receive_stock(sku, bin_code, quantity, actor),
        )
        .await
    }

    pub async fn get_stock(&self, sku: &str) -> OperationResult<StockLevel> {
        self.inventory.get_stock(sku).await.into()
    }

    pub async fn get_stock_entry(&self, sku: &str, bin_code: &str) -> OperationResult<stock_entry::Model> {
        self.inventory.get_entry(sku, bin_code).await.into()
    }

    pub async fn list_stock_entries(&self) -> OperationResult<Vec<stock_entry::Model>> {
        self.inventory.list_entries().await.into()
    }

    pub async fn create_bin(&self, bin_code: &str, actor: &Actor) -> OperationResult<bin::Model> {
        self.gated(actor, Action::ManageBins, self.bins.create_bin(bin_code, actor))
            .await
    }

    pub async fn freeze_bin(
        &self,
        bin_code: &str,
        reason: &str,
        actor: &Actor,
    ) -> OperationResult<bin::Model> {
        self.gated(
            actor,
            Action::ManageBins,
            self.bins.freeze_bin(bin_code, reason, actor),
        )
        .await
    }

    pub async fn unfreeze_bin(&self, bin_code: &str, actor: &Actor) -> OperationResult<bin::Model> {
        self.gated(actor, Action::ManageBins, self.bins.unfreeze_bin(bin_code, actor))
            .await
    }

    pub async fn get_bin(&self, bin_code: &str) -> OperationResult<bin::Model> {
        self.bins.get_bin(bin_code).await.into()
    }

    pub async fn list_bins(&self) -> OperationResult<Vec<bin::Model>> {
        self.bins.list_bins().await.into()
    }
}
