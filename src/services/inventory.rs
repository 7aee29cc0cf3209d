use metrics::counter;
use sea_orm::{DatabaseConnection, EntityTrait, QueryOrder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::{
    auth::Actor,
    db::in_transaction,
    entities::stock_entry::{self, Entity as StockEntry},
    errors::ServiceError,
    services::{
        audit::{self, action, entity, AuditRecord},
        bins::ensure_bin,
        stock_ledger,
    },
};

/// Stock for one SKU across every bin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockLevel {
    pub sku: String,
    pub available: i32,
    pub committed: i32,
    pub on_hand: i32,
    pub entries: Vec<stock_entry::Model>,
    /// False when any entry breaks `on_hand == available + committed`
    pub consistent: bool,
}

impl StockLevel {
    fn from_entries(sku: &str, entries: Vec<stock_entry::Model>) -> Self {
        Self {
            sku: sku.to_string(),
            available: entries.iter().map(|e| e.available).sum(),
            committed: entries.iter().map(|e| e.committed).sum(),
            on_hand: entries.iter().map(|e| e.on_hand).sum(),
            consistent: entries.iter().all(stock_entry::Model::is_consistent),
            entries,
        }
    }
}

/// Service for receiving and querying stock
#[derive(Clone)]
pub struct InventoryService {
    db_pool: Arc<DatabaseConnection>,
}

impl InventoryService {
    /// Creates a new inventory service instance
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    /// Receives `quantity` units into a bin, creating the bin and the stock
    /// row when they do not exist yet.
    #[instrument(skip(self, actor), fields(actor = %actor.actor_id))]
    pub async fn receive_stock(
        &self,
        sku: &str,
        bin_code: &str,
        quantity: i32,
        actor: &Actor,
    ) -> Result<stock_entry::Model, ServiceError> {
        if sku.trim().is_empty() || bin_code.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "sku and bin_code are required".to_string(),
            ));
        }
        let sku = sku.trim().to_string();
        let bin_code = bin_code.trim().to_string();
        let actor = actor.clone();

        let entry = in_transaction(&self.db_pool, |txn| {
            Box::pin(async move {
                ensure_bin(txn, &bin_code).await?;
                let before = stock_ledger::find_entry(txn, &sku, &bin_code).await?;
                let after = stock_ledger::credit_available(txn, &sku, &bin_code, quantity).await?;

                audit::record(
                    txn,
                    &actor,
                    AuditRecord::new(
                        entity::STOCK_ENTRY,
                        format!("{}@{}", sku, bin_code),
                        action::RECEIVED,
                    )
                    .transition(before.map(|b| json!(b)), Some(json!(after)))
                    .details(json!({ "quantity": quantity })),
                )
                .await?;
                Ok(after)
            })
        })
        .await?;

        counter!("stockkeeper.stock.received_units", quantity as u64);
        info!(
            sku = %entry.sku,
            bin_code = %entry.bin_code,
            quantity,
            available = entry.available,
            "stock received"
        );
        Ok(entry)
    }

    /// Gets stock for a SKU across all bins
    #[instrument(skip(self))]
    pub async fn get_stock(&self, sku: &str) -> Result<StockLevel, ServiceError> {
        let entries = stock_ledger::entries_for_sku(&*self.db_pool, sku).await?;
        Ok(StockLevel::from_entries(sku, entries))
    }

    /// Gets a single (sku, bin) entry
    pub async fn get_entry(
        &self,
        sku: &str,
        bin_code: &str,
    ) -> Result<stock_entry::Model, ServiceError> {
        stock_ledger::find_entry(&*self.db_pool, sku, bin_code)
            .await?
            .ok_or_else(|| ServiceError::UnknownStockEntry {
                sku: sku.to_string(),
                bin_code: bin_code.to_string(),
            })
    }

    /// Every stock row, for reconciliation
    pub async fn list_entries(&self) -> Result<Vec<stock_entry::Model>, ServiceError> {
        Ok(StockEntry::find()
            .order_by_asc(stock_entry::Column::Sku)
            .order_by_asc(stock_entry::Column::BinCode)
            .all(&*self.db_pool)
            .await?)
    }
}
