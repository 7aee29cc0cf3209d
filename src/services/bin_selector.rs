//! Bin Selector
//!
//! Decides which bins a requested quantity is drawn from. The algorithm is
//! pure: eligible bins (not frozen, not excluded, with stock) are ranked by
//! descending available quantity, ties broken by ascending bin code, and
//! drawn from greedily until the request is met.

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::entities::{bin, stock_entry};
use crate::errors::{ServiceError, StockShortfall};

/// Stock for a SKU in one bin, as seen by the selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinCandidate {
    pub bin_code: String,
    pub available: i32,
    pub is_frozen: bool,
}

/// Quantity to draw from one bin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinPick {
    pub bin_code: String,
    pub quantity: i32,
}

fn rank(a: &BinCandidate, b: &BinCandidate) -> Ordering {
    b.available
        .cmp(&a.available)
        .then_with(|| a.bin_code.cmp(&b.bin_code))
}

/// Picks bins for `quantity_needed` units of `sku`.
///
/// Fails with `FrozenProduct` when nothing eligible has stock but a frozen
/// bin does, and with `InsufficientStock` otherwise.
pub fn select_bins(
    sku: &str,
    quantity_needed: i32,
    candidates: &[BinCandidate],
    exclude_bins: &[String],
) -> Result<Vec<BinPick>, ServiceError> {
    if quantity_needed <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "quantity for {} must be positive, got {}",
            sku, quantity_needed
        )));
    }

    let not_excluded = |c: &&BinCandidate| !exclude_bins.iter().any(|b| b == &c.bin_code);

    let mut eligible: Vec<&BinCandidate> = candidates
        .iter()
        .filter(not_excluded)
        .filter(|c| !c.is_frozen && c.available > 0)
        .collect();
    eligible.sort_by(|a, b| rank(a, b));

    let mut picks = Vec::new();
    let mut remaining = quantity_needed;
    for candidate in &eligible {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(candidate.available);
        picks.push(BinPick {
            bin_code: candidate.bin_code.clone(),
            quantity: take,
        });
        remaining -= take;
    }

    if remaining == 0 {
        return Ok(picks);
    }

    // summed wide: frozen stock is not bounded by the request
    let eligible_total: i64 = eligible.iter().map(|c| i64::from(c.available)).sum();
    let frozen_total: i64 = candidates
        .iter()
        .filter(not_excluded)
        .filter(|c| c.is_frozen)
        .map(|c| i64::from(c.available.max(0)))
        .sum();

    if eligible_total == 0 && frozen_total > 0 {
        return Err(ServiceError::FrozenProduct(vec![sku.to_string()]));
    }

    Err(ServiceError::InsufficientStock(vec![StockShortfall {
        sku: sku.to_string(),
        label: None,
        requested: quantity_needed,
        available: i32::try_from(eligible_total).unwrap_or(i32::MAX),
    }]))
}

/// Same ranking as [`select_bins`], skipping one problem bin.
pub fn find_alternative_bins(
    sku: &str,
    quantity_needed: i32,
    candidates: &[BinCandidate],
    exclude_bin: &str,
) -> Result<Vec<BinPick>, ServiceError> {
    select_bins(sku, quantity_needed, candidates, &[exclude_bin.to_string()])
}

/// Loads every stocked bin for a SKU together with its freeze flag.
///
/// A stock row whose bin record is missing counts as unfrozen.
pub async fn load_candidates<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
) -> Result<Vec<BinCandidate>, ServiceError> {
    let rows = stock_entry::Entity::find()
        .filter(stock_entry::Column::Sku.eq(sku))
        .order_by_asc(stock_entry::Column::BinCode)
        .find_also_related(bin::Entity)
        .all(conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(entry, bin)| BinCandidate {
            bin_code: entry.bin_code,
            available: entry.available,
            is_frozen: bin.map_or(false, |b| b.is_frozen),
        })
        .collect())
}
