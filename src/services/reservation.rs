//! Reservation Manager
//!
//! Two-phase lifecycle of stock against the ledger: `reserve` moves units
//! from available to committed and records one [`assignment`] per bin drawn
//! from; `consume` and `release` resolve those assignments again.
//!
//! Assignments are deleted in the same transaction that resolves them, so
//! whatever is left for a context is exactly what still needs resolving. A
//! failed `consume` can be re-run and will pick up where it stopped.

use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::auth::Actor;
use crate::catalog::ProductCatalog;
use crate::db::in_transaction;
use crate::entities::assignment::{self, Entity as Assignment};
use crate::errors::{ServiceError, StockShortfall};
use crate::services::audit::{self, action, entity, AuditRecord};
use crate::services::bin_selector::{self, BinPick};
use crate::services::stock_ledger;

/// One (sku, quantity) demand within a reservation batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AllocationRequest {
    #[validate(length(min = 1, max = 128))]
    pub sku: String,
    #[validate(range(min = 1))]
    pub quantity: i32,
    /// Bins the selector must skip for this line
    #[serde(default)]
    pub exclude_bins: Vec<String>,
}

impl AllocationRequest {
    pub fn new(sku: impl Into<String>, quantity: i32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
            exclude_bins: Vec::new(),
        }
    }

    pub fn excluding(mut self, bin_code: impl Into<String>) -> Self {
        self.exclude_bins.push(bin_code.into());
        self
    }
}

/// Outcome of consuming or releasing a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionSummary {
    pub context_id: String,
    /// Assignments resolved by this call; zero on an idempotent repeat
    pub assignments_resolved: usize,
    pub units: i32,
}

impl ResolutionSummary {
    fn empty(context_id: &str) -> Self {
        Self {
            context_id: context_id.to_string(),
            assignments_resolved: 0,
            units: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Consume,
    Release,
}

impl Resolution {
    fn audit_action(self) -> &'static str {
        match self {
            Resolution::Consume => action::CONSUMED,
            Resolution::Release => action::RELEASED,
        }
    }
}

fn validate_context_id(context_id: &str) -> Result<(), ServiceError> {
    if context_id.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "context_id is required".to_string(),
        ));
    }
    Ok(())
}

fn validate_lines(lines: &[AllocationRequest]) -> Result<(), ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::ValidationError(
            "at least one line is required".to_string(),
        ));
    }
    for line in lines {
        line.validate()?;
    }
    Ok(())
}

/// Reserves every line for `context_id` on `conn`.
///
/// Lines are processed in order and later lines see earlier debits. When any
/// line cannot be satisfied the combined failure is returned and the caller's
/// transaction must be rolled back.
pub async fn reserve_in<C: ConnectionTrait>(
    conn: &C,
    context_id: &str,
    lines: &[AllocationRequest],
    actor: &Actor,
) -> Result<Vec<assignment::Model>, ServiceError> {
    let mut shortfalls: Vec<StockShortfall> = Vec::new();
    let mut frozen: Vec<(String, i32)> = Vec::new();
    let mut created = Vec::new();

    for line in lines {
        let candidates = bin_selector::load_candidates(conn, &line.sku).await?;
        let picks = match bin_selector::select_bins(
            &line.sku,
            line.quantity,
            &candidates,
            &line.exclude_bins,
        ) {
            Ok(picks) => picks,
            Err(ServiceError::InsufficientStock(missing)) => {
                shortfalls.extend(missing);
                continue;
            }
            Err(ServiceError::FrozenProduct(skus)) => {
                frozen.extend(skus.into_iter().map(|sku| (sku, line.quantity)));
                continue;
            }
            Err(other) => return Err(other),
        };

        created.extend(commit_picks(conn, context_id, &line.sku, &picks, actor).await?);
    }

    if !shortfalls.is_empty() {
        // frozen-only SKUs still need naming alongside the plain shortfalls
        for (sku, requested) in frozen {
            shortfalls.push(StockShortfall {
                sku,
                label: None,
                requested,
                available: 0,
            });
        }
        return Err(ServiceError::InsufficientStock(shortfalls));
    }
    if !frozen.is_empty() {
        return Err(ServiceError::FrozenProduct(
            frozen.into_iter().map(|(sku, _)| sku).collect(),
        ));
    }

    Ok(created)
}

/// Debits each pick and records its assignment.
async fn commit_picks<C: ConnectionTrait>(
    conn: &C,
    context_id: &str,
    sku: &str,
    picks: &[BinPick],
    actor: &Actor,
) -> Result<Vec<assignment::Model>, ServiceError> {
    let mut created = Vec::with_capacity(picks.len());
    for pick in picks {
        stock_ledger::debit_available_to_committed(conn, sku, &pick.bin_code, pick.quantity)
            .await?;

        let row = assignment::ActiveModel {
            context_id: Set(context_id.to_string()),
            sku: Set(sku.to_string()),
            bin_code: Set(pick.bin_code.clone()),
            quantity_assigned: Set(pick.quantity),
            ..Default::default()
        }
        .insert(conn)
        .await?;

        audit::record(
            conn,
            actor,
            AuditRecord::new(entity::ASSIGNMENT, context_id, action::RESERVED)
                .transition(None, Some(json!(row))),
        )
        .await?;
        created.push(row);
    }
    Ok(created)
}

/// Outstanding assignments for a context, oldest first.
pub async fn assignments_in<C: ConnectionTrait>(
    conn: &C,
    context_id: &str,
) -> Result<Vec<assignment::Model>, ServiceError> {
    Ok(Assignment::find()
        .filter(assignment::Column::ContextId.eq(context_id))
        .order_by_asc(assignment::Column::CreatedAt)
        .order_by_asc(assignment::Column::Id)
        .all(conn)
        .await?)
}

/// Resolves one assignment. Returns false when another caller resolved it first.
async fn resolve_one<C: ConnectionTrait>(
    conn: &C,
    row: &assignment::Model,
    resolution: Resolution,
    actor: &Actor,
) -> Result<bool, ServiceError> {
    // claim the row first so a concurrent resolver cannot apply it twice
    let deleted = Assignment::delete_many()
        .filter(assignment::Column::Id.eq(row.id))
        .exec(conn)
        .await?;
    if deleted.rows_affected == 0 {
        return Ok(false);
    }

    match resolution {
        Resolution::Consume => {
            stock_ledger::consume_committed(conn, &row.sku, &row.bin_code, row.quantity_assigned)
                .await?
        }
        Resolution::Release => {
            stock_ledger::credit_committed_to_available(
                conn,
                &row.sku,
                &row.bin_code,
                row.quantity_assigned,
            )
            .await?
        }
    }

    audit::record(
        conn,
        actor,
        AuditRecord::new(entity::ASSIGNMENT, &row.context_id, resolution.audit_action())
            .transition(Some(json!(row)), None),
    )
    .await?;
    Ok(true)
}

/// Releases everything a context still holds, inside the caller's transaction.
/// A context without assignments is not an error here.
pub async fn release_all_in<C: ConnectionTrait>(
    conn: &C,
    context_id: &str,
    actor: &Actor,
) -> Result<ResolutionSummary, ServiceError> {
    let mut summary = ResolutionSummary::empty(context_id);
    for row in assignments_in(conn, context_id).await? {
        if resolve_one(conn, &row, Resolution::Release, actor).await? {
            summary.assignments_resolved += 1;
            summary.units += row.quantity_assigned;
        }
    }
    Ok(summary)
}

#[derive(Clone)]
pub struct ReservationService {
    db_pool: Arc<DatabaseConnection>,
    catalog: Arc<dyn ProductCatalog>,
}

impl ReservationService {
    pub fn new(db_pool: Arc<DatabaseConnection>, catalog: Arc<dyn ProductCatalog>) -> Self {
        Self { db_pool, catalog }
    }

    /// Reserves a batch of lines for a context. All or nothing.
    #[instrument(skip(self, lines, actor), fields(lines = lines.len(), actor = %actor.actor_id))]
    pub async fn reserve(
        &self,
        context_id: &str,
        lines: &[AllocationRequest],
        actor: &Actor,
    ) -> Result<Vec<assignment::Model>, ServiceError> {
        validate_context_id(context_id)?;
        validate_lines(lines)?;

        let context = context_id.to_string();
        let batch = lines.to_vec();
        let who = actor.clone();

        let result = in_transaction(&self.db_pool, |txn| {
            Box::pin(async move { reserve_in(txn, &context, &batch, &who).await })
        })
        .await;

        match result {
            Ok(assignments) => {
                counter!("stockkeeper.reservations.created", 1);
                info!(
                    context_id,
                    assignments = assignments.len(),
                    "reservation committed"
                );
                Ok(assignments)
            }
            Err(err) => {
                counter!("stockkeeper.reservations.rejected", 1);
                warn!(context_id, error = %err, "reservation rejected");
                Err(self.describe_error(err).await)
            }
        }
    }

    /// Consumes every outstanding assignment of a context.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn consume(
        &self,
        context_id: &str,
        actor: &Actor,
    ) -> Result<ResolutionSummary, ServiceError> {
        self.resolve(context_id, Resolution::Consume, actor).await
    }

    /// Returns every outstanding assignment of a context to available.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn release(
        &self,
        context_id: &str,
        actor: &Actor,
    ) -> Result<ResolutionSummary, ServiceError> {
        self.resolve(context_id, Resolution::Release, actor).await
    }

    async fn resolve(
        &self,
        context_id: &str,
        resolution: Resolution,
        actor: &Actor,
    ) -> Result<ResolutionSummary, ServiceError> {
        validate_context_id(context_id)?;
        let db = &*self.db_pool;

        let outstanding = assignments_in(db, context_id).await?;
        if outstanding.is_empty() {
            // only a repeat of the same resolution is a no-op
            if audit::context_was_resolved(db, context_id, resolution.audit_action()).await? {
                info!(context_id, "nothing left to resolve");
                return Ok(ResolutionSummary::empty(context_id));
            }
            return Err(self
                .integrity_alert(context_id, resolution, actor)
                .await);
        }

        let mut summary = ResolutionSummary::empty(context_id);
        // one transaction per assignment so a retry resumes from what is left
        for row in outstanding {
            let claimed = row.clone();
            let who = actor.clone();
            let resolved = in_transaction(db, |txn| {
                Box::pin(async move { resolve_one(txn, &claimed, resolution, &who).await })
            })
            .await?;

            if resolved {
                summary.assignments_resolved += 1;
                summary.units += row.quantity_assigned;
            }
        }

        match resolution {
            Resolution::Consume => counter!(
                "stockkeeper.assignments.consumed",
                summary.assignments_resolved as u64
            ),
            Resolution::Release => counter!(
                "stockkeeper.assignments.released",
                summary.assignments_resolved as u64
            ),
        }
        info!(
            context_id,
            resolution = resolution.audit_action(),
            assignments = summary.assignments_resolved,
            units = summary.units,
            "context resolved"
        );
        Ok(summary)
    }

    /// Logs and records a resolve call for a context with no assignments that
    /// was never resolved this way before.
    async fn integrity_alert(
        &self,
        context_id: &str,
        resolution: Resolution,
        actor: &Actor,
    ) -> ServiceError {
        counter!("stockkeeper.integrity_alerts", 1);
        error!(
            alert = true,
            context_id,
            operation = resolution.audit_action(),
            "no assignments found for context"
        );

        let record = AuditRecord::new(entity::ASSIGNMENT, context_id, action::INTEGRITY_ALERT)
            .details(json!({
                "error_code": "assignment_missing",
                "operation": resolution.audit_action(),
            }));
        if let Err(e) = audit::record(&*self.db_pool, actor, record).await {
            error!(context_id, error = %e, "failed to record integrity alert");
        }

        ServiceError::AssignmentMissing(context_id.to_string())
    }

    /// Moves one assignment off a bin that turned out to be physically empty.
    ///
    /// The same quantity is reserved from other bins, skipping the problem
    /// bin, and the problem bin's stock for the SKU is written off so it is
    /// not promised again. When no alternative exists nothing changes.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn reassign_assignment(
        &self,
        context_id: &str,
        assignment_id: Uuid,
        actor: &Actor,
    ) -> Result<Vec<assignment::Model>, ServiceError> {
        validate_context_id(context_id)?;
        let context = context_id.to_string();
        let who = actor.clone();

        let result = in_transaction(&self.db_pool, |txn| {
            Box::pin(async move {
                let original = Assignment::find_by_id(assignment_id)
                    .filter(assignment::Column::ContextId.eq(context.as_str()))
                    .one(txn)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!(
                            "assignment {} not found for context {}",
                            assignment_id, context
                        ))
                    })?;

                let candidates = bin_selector::load_candidates(txn, &original.sku).await?;
                let picks = bin_selector::find_alternative_bins(
                    &original.sku,
                    original.quantity_assigned,
                    &candidates,
                    &original.bin_code,
                )?;

                let claimed = Assignment::delete_many()
                    .filter(assignment::Column::Id.eq(original.id))
                    .exec(txn)
                    .await?;
                if claimed.rows_affected == 0 {
                    return Err(ServiceError::NotFound(format!(
                        "assignment {} was resolved concurrently",
                        assignment_id
                    )));
                }

                // the bin is empty: its units must not go back to available
                let before =
                    stock_ledger::find_entry(txn, &original.sku, &original.bin_code).await?;
                let after = stock_ledger::write_off_missing(
                    txn,
                    &original.sku,
                    &original.bin_code,
                    original.quantity_assigned,
                )
                .await?;
                let written_off = before.as_ref().map_or(0, |b| b.on_hand - after.on_hand);
                audit::record(
                    txn,
                    &who,
                    AuditRecord::new(
                        entity::STOCK_ENTRY,
                        format!("{}@{}", original.sku, original.bin_code),
                        action::ADJUSTED,
                    )
                    .transition(before.map(|b| json!(b)), Some(json!(after)))
                    .details(json!({
                        "reason": "bin found empty during picking",
                        "context_id": context,
                        "assignment_id": original.id,
                        "written_off": written_off,
                    })),
                )
                .await?;
                counter!("stockkeeper.stock.written_off", written_off.max(0) as u64);

                let replacements = commit_picks(txn, &context, &original.sku, &picks, &who).await?;

                audit::record(
                    txn,
                    &who,
                    AuditRecord::new(entity::ASSIGNMENT, &context, action::REASSIGNED).details(
                        json!({
                            "assignment_id": original.id,
                            "sku": original.sku,
                            "from_bin": original.bin_code,
                            "picks": picks,
                        }),
                    ),
                )
                .await?;
                Ok(replacements)
            })
        })
        .await;

        match result {
            Ok(replacements) => {
                info!(
                    context_id,
                    %assignment_id,
                    replacements = replacements.len(),
                    "assignment moved to alternative bins"
                );
                Ok(replacements)
            }
            Err(err) => Err(self.describe_error(err).await),
        }
    }

    /// Outstanding assignments for a context
    pub async fn assignments_for(
        &self,
        context_id: &str,
    ) -> Result<Vec<assignment::Model>, ServiceError> {
        assignments_in(&*self.db_pool, context_id).await
    }

    /// Fills catalog names into stock errors so callers can show them.
    pub async fn describe_error(&self, err: ServiceError) -> ServiceError {
        match err {
            ServiceError::InsufficientStock(mut shortfalls) => {
                for shortfall in shortfalls.iter_mut() {
                    if shortfall.label.is_none() {
                        shortfall.label = self
                            .catalog
                            .describe(&shortfall.sku)
                            .await
                            .map(|label| label.display());
                    }
                }
                ServiceError::InsufficientStock(shortfalls)
            }
            other => other,
        }
    }
}
