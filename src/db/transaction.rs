/*!
 * Transaction helper
 *
 * Runs a closure inside a database transaction, committing on `Ok` and
 * rolling back on `Err`, and hands the closure's own `ServiceError` back to
 * the caller unchanged.
 */

use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use std::future::Future;
use std::pin::Pin;

use crate::errors::ServiceError;

/// Type alias for boxed future used in transactions
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Execute a function within a database transaction
///
/// ```rust,ignore
/// let assignments = in_transaction(&db, |txn| {
///     Box::pin(async move {
///         ledger::debit_available_to_committed(txn, "X-1", "A", 8).await?;
///         Ok(())
///     })
/// })
/// .await?;
/// ```
pub async fn in_transaction<F, T>(db: &DatabaseConnection, f: F) -> Result<T, ServiceError>
where
    F: for<'a> FnOnce(&'a DatabaseTransaction) -> BoxFuture<'a, Result<T, ServiceError>> + Send,
    T: Send,
{
    db.transaction::<_, T, ServiceError>(f)
        .await
        .map_err(ServiceError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::entities::bin;
    use sea_orm::{ActiveModelTrait, EntityTrait, Set};

    async fn pool() -> DatabaseConnection {
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

    fn new_bin(code: &str) -> bin::ActiveModel {
        bin::ActiveModel {
            bin_code: Set(code.to_string()),
            is_frozen: Set(false),
            created_at: Set(chrono::Utc::now()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn commits_on_success() {
        let db = pool().await;
        in_transaction(&db, |txn| {
            Box::pin(async move {
                new_bin("A-01").insert(txn).await?;
                Ok(())
            })
        })
        .await
        .expect("transaction");

        assert!(bin::Entity::find_by_id("A-01".to_string())
            .one(&db)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn rolls_back_and_keeps_the_service_error() {
        let db = pool().await;
        let result: Result<(), ServiceError> = in_transaction(&db, |txn| {
            Box::pin(async move {
                new_bin("A-02").insert(txn).await?;
                Err(ServiceError::AssignmentMissing("ctx-1".into()))
            })
        })
        .await;

        assert!(matches!(result, Err(ServiceError::AssignmentMissing(_))));
        assert!(bin::Entity::find_by_id("A-02".to_string())
            .one(&db)
            .await
            .unwrap()
            .is_none());
    }
}
