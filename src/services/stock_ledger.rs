//! Stock Ledger
//!
//! Per-(SKU, bin) quantities. Every write is a single conditional `UPDATE`
//! whose `WHERE` clause carries the pre-condition (`available >= qty` or
//! `committed >= qty`), so concurrent callers can never drive a column
//! negative. `on_hand` moves in the same statement as the column it mirrors.
//!
//! The functions take any [`ConnectionTrait`] so callers can run them inside
//! their own transaction.

use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict, SimpleExpr};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use tracing::{debug, instrument};

use crate::entities::stock_entry::{self, Column, Entity as StockEntry};
use crate::errors::{ServiceError, StockShortfall};

/// Which column a failed conditional write was guarding.
#[derive(Debug, Clone, Copy)]
enum Guard {
    Available,
    Committed,
}

fn ensure_positive(qty: i32) -> Result<(), ServiceError> {
    if qty <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "quantity must be positive, got {}",
            qty
        )));
    }
    Ok(())
}

/// Applies `changes` to the row only when `guard_column >= qty`.
async fn guarded_update<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
    bin_code: &str,
    qty: i32,
    guard: Guard,
    changes: Vec<(Column, SimpleExpr)>,
) -> Result<(), ServiceError> {
    let guard_column = match guard {
        Guard::Available => Column::Available,
        Guard::Committed => Column::Committed,
    };

    let mut update = StockEntry::update_many()
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::Sku.eq(sku))
        .filter(Column::BinCode.eq(bin_code))
        .filter(guard_column.gte(qty));
    for (column, expr) in changes {
        update = update.col_expr(column, expr);
    }

    let result = update.exec(conn).await?;
    if result.rows_affected == 0 {
        return Err(explain_rejected_write(conn, sku, bin_code, qty, guard).await);
    }
    Ok(())
}

/// A guarded write touched no row: either the row is missing or the guard failed.
async fn explain_rejected_write<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
    bin_code: &str,
    qty: i32,
    guard: Guard,
) -> ServiceError {
    match find_entry(conn, sku, bin_code).await {
        Ok(Some(entry)) => {
            let have = match guard {
                Guard::Available => entry.available,
                Guard::Committed => entry.committed,
            };
            ServiceError::InsufficientStock(vec![StockShortfall {
                sku: sku.to_string(),
                label: None,
                requested: qty,
                available: have,
            }])
        }
        Ok(None) => ServiceError::UnknownStockEntry {
            sku: sku.to_string(),
            bin_code: bin_code.to_string(),
        },
        Err(err) => err,
    }
}

/// Moves `qty` units from available to committed.
#[instrument(skip(conn))]
pub async fn debit_available_to_committed<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
    bin_code: &str,
    qty: i32,
) -> Result<(), ServiceError> {
    ensure_positive(qty)?;
    guarded_update(
        conn,
        sku,
        bin_code,
        qty,
        Guard::Available,
        vec![
            (Column::Available, Expr::col(Column::Available).sub(qty)),
            (Column::Committed, Expr::col(Column::Committed).add(qty)),
        ],
    )
    .await?;
    debug!(sku, bin_code, qty, "committed stock");
    Ok(())
}

/// Returns `qty` committed units to available.
#[instrument(skip(conn))]
pub async fn credit_committed_to_available<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
    bin_code: &str,
    qty: i32,
) -> Result<(), ServiceError> {
    ensure_positive(qty)?;
    guarded_update(
        conn,
        sku,
        bin_code,
        qty,
        Guard::Committed,
        vec![
            (Column::Committed, Expr::col(Column::Committed).sub(qty)),
            (Column::Available, Expr::col(Column::Available).add(qty)),
        ],
    )
    .await?;
    debug!(sku, bin_code, qty, "released stock");
    Ok(())
}

/// Irreversibly removes `qty` committed units.
#[instrument(skip(conn))]
pub async fn consume_committed<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
    bin_code: &str,
    qty: i32,
) -> Result<(), ServiceError> {
    ensure_positive(qty)?;
    guarded_update(
        conn,
        sku,
        bin_code,
        qty,
        Guard::Committed,
        vec![
            (Column::Committed, Expr::col(Column::Committed).sub(qty)),
            (Column::OnHand, Expr::col(Column::OnHand).sub(qty)),
        ],
    )
    .await?;
    debug!(sku, bin_code, qty, "consumed stock");
    Ok(())
}

/// Writes off a bin found physically empty: the `committed_qty` units of the
/// assignment that discovered it, plus whatever available stock the bin still
/// claims. Units committed to other contexts are left for their own
/// reassignment.
#[instrument(skip(conn))]
pub async fn write_off_missing<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
    bin_code: &str,
    committed_qty: i32,
) -> Result<stock_entry::Model, ServiceError> {
    consume_committed(conn, sku, bin_code, committed_qty).await?;

    let entry = find_entry(conn, sku, bin_code)
        .await?
        .ok_or_else(|| ServiceError::UnknownStockEntry {
            sku: sku.to_string(),
            bin_code: bin_code.to_string(),
        })?;
    if entry.available == 0 {
        return Ok(entry);
    }

    let phantom = entry.available;
    guarded_update(
        conn,
        sku,
        bin_code,
        phantom,
        Guard::Available,
        vec![
            (Column::Available, Expr::col(Column::Available).sub(phantom)),
            (Column::OnHand, Expr::col(Column::OnHand).sub(phantom)),
        ],
    )
    .await?;
    debug!(sku, bin_code, committed_qty, phantom, "wrote off missing stock");

    find_entry(conn, sku, bin_code)
        .await?
        .ok_or_else(|| ServiceError::UnknownStockEntry {
            sku: sku.to_string(),
            bin_code: bin_code.to_string(),
        })
}

/// Adds `qty` received units to available, creating the row when missing.
#[instrument(skip(conn))]
pub async fn credit_available<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
    bin_code: &str,
    qty: i32,
) -> Result<stock_entry::Model, ServiceError> {
    ensure_positive(qty)?;

    // seed a zero row so the increment below always has something to hit
    let seed = stock_entry::ActiveModel {
        sku: Set(sku.to_string()),
        bin_code: Set(bin_code.to_string()),
        available: Set(0),
        committed: Set(0),
        on_hand: Set(0),
        updated_at: Set(Utc::now()),
    };
    StockEntry::insert(seed)
        .on_conflict(
            OnConflict::columns([Column::Sku, Column::BinCode])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    add_available(conn, sku, bin_code, qty).await?;

    find_entry(conn, sku, bin_code)
        .await?
        .ok_or_else(|| ServiceError::UnknownStockEntry {
            sku: sku.to_string(),
            bin_code: bin_code.to_string(),
        })
}

async fn add_available<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
    bin_code: &str,
    qty: i32,
) -> Result<u64, ServiceError> {
    let result = StockEntry::update_many()
        .col_expr(Column::Available, Expr::col(Column::Available).add(qty))
        .col_expr(Column::OnHand, Expr::col(Column::OnHand).add(qty))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::Sku.eq(sku))
        .filter(Column::BinCode.eq(bin_code))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

pub async fn find_entry<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
    bin_code: &str,
) -> Result<Option<stock_entry::Model>, ServiceError> {
    Ok(StockEntry::find_by_id((sku.to_string(), bin_code.to_string()))
        .one(conn)
        .await?)
}

/// All entries for a SKU ordered by bin code.
pub async fn entries_for_sku<C: ConnectionTrait>(
    conn: &C,
    sku: &str,
) -> Result<Vec<stock_entry::Model>, ServiceError> {
    Ok(StockEntry::find()
        .filter(Column::Sku.eq(sku))
        .order_by_asc(Column::BinCode)
        .all(conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use sea_orm::DatabaseConnection;

    async fn ledger() -> DatabaseConnection {
        let db = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("connect");
        run_migrations(&db).await.expect("migrate");
        db
    }

    async fn levels(db: &DatabaseConnection) -> (i32, i32, i32) {
        let entry = find_entry(db, "X-1", "A").await.unwrap().unwrap();
        (entry.available, entry.committed, entry.on_hand)
    }

    #[tokio::test]
    async fn receiving_creates_then_increments() {
        let db = ledger().await;
        credit_available(&db, "X-1", "A", 4).await.unwrap();
        let entry = credit_available(&db, "X-1", "A", 6).await.unwrap();
        assert_eq!((entry.available, entry.committed, entry.on_hand), (10, 0, 10));
    }

    #[tokio::test]
    async fn on_hand_tracks_every_move() {
        let db = ledger().await;
        credit_available(&db, "X-1", "A", 10).await.unwrap();

        debit_available_to_committed(&db, "X-1", "A", 7).await.unwrap();
        assert_eq!(levels(&db).await, (3, 7, 10));

        credit_committed_to_available(&db, "X-1", "A", 2).await.unwrap();
        assert_eq!(levels(&db).await, (5, 5, 10));

        consume_committed(&db, "X-1", "A", 5).await.unwrap();
        assert_eq!(levels(&db).await, (5, 0, 5));
    }

    #[tokio::test]
    async fn failed_guard_reports_what_is_there() {
        let db = ledger().await;
        credit_available(&db, "X-1", "A", 3).await.unwrap();

        let err = debit_available_to_committed(&db, "X-1", "A", 4)
            .await
            .unwrap_err();
        match err {
            ServiceError::InsufficientStock(shortfalls) => {
                assert_eq!(shortfalls[0].requested, 4);
                assert_eq!(shortfalls[0].available, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            consume_committed(&db, "X-1", "A", 1).await,
            Err(ServiceError::InsufficientStock(_))
        ));
        assert_eq!(levels(&db).await, (3, 0, 3));
    }

    #[tokio::test]
    async fn write_off_clears_available_but_keeps_other_commitments() {
        let db = ledger().await;
        credit_available(&db, "X-1", "A", 10).await.unwrap();
        debit_available_to_committed(&db, "X-1", "A", 6).await.unwrap();
        debit_available_to_committed(&db, "X-1", "A", 3).await.unwrap();

        let entry = write_off_missing(&db, "X-1", "A", 6).await.unwrap();
        assert_eq!((entry.available, entry.committed, entry.on_hand), (0, 3, 3));

        // nothing left to clear on a second pass
        let entry = write_off_missing(&db, "X-1", "A", 3).await.unwrap();
        assert_eq!((entry.available, entry.committed, entry.on_hand), (0, 0, 0));
        assert!(matches!(
            write_off_missing(&db, "X-1", "A", 1).await,
            Err(ServiceError::InsufficientStock(_))
        ));
    }

    #[tokio::test]
    async fn missing_rows_and_bad_quantities_are_rejected() {
        let db = ledger().await;
        assert!(matches!(
            debit_available_to_committed(&db, "X-1", "Z", 1).await,
            Err(ServiceError::UnknownStockEntry { .. })
        ));
        assert!(matches!(
            credit_available(&db, "X-1", "A", 0).await,
            Err(ServiceError::ValidationError(_))
        ));
    }
}
