#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use sea_orm::sea_query::Expr;
use stockkeeper::{
    auth::Actor,
    db::{self, DbConfig, DbPool},
    engine::StockEngineBuilder,
    entities::{assignment, picking_session, stock_entry},
    StockEngine,
};
use uuid::Uuid;

/// Engine backed by a fresh in-memory SQLite database.
pub struct TestEngine {
    pub db: Arc<DbPool>,
    pub engine: StockEngine,
    pub actor: Actor,
}

pub async fn setup_db() -> Arc<DbPool> {
    let config = DbConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        min_connections: 1,
        acquire_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let pool = db::establish_connection_with_config(&config)
        .await
        .expect("failed to open in-memory database");
    db::run_migrations(&pool)
        .await
        .expect("failed to run migrations");
    Arc::new(pool)
}

pub fn picker() -> Actor {
    Actor::new("picker-1", Some("Ana Picker".to_string()))
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with(|builder| builder).await
    }

    /// Lets a test swap collaborators before the engine is built.
    pub async fn with(configure: impl FnOnce(StockEngineBuilder) -> StockEngineBuilder) -> Self {
        let db = setup_db().await;
        let engine = configure(StockEngine::builder(db.clone())).build();
        Self {
            db,
            engine,
            actor: picker(),
        }
    }

    /// Receives stock for `sku` into each listed bin.
    pub async fn seed(&self, sku: &str, bins: &[(&str, i32)]) {
        for (bin_code, quantity) in bins {
            let result = self
                .engine
                .receive_stock(sku, bin_code, *quantity, &self.actor)
                .await;
            assert!(result.is_success(), "seeding {}@{} failed: {:?}", sku, bin_code, result);
        }
    }

    pub async fn entry(&self, sku: &str, bin_code: &str) -> stock_entry::Model {
        stock_entry::Entity::find_by_id((sku.to_string(), bin_code.to_string()))
            .one(&*self.db)
            .await
            .expect("query stock entry")
            .expect("stock entry exists")
    }

    /// `(available, committed)` of one entry
    pub async fn levels(&self, sku: &str, bin_code: &str) -> (i32, i32) {
        let entry = self.entry(sku, bin_code).await;
        assert!(entry.is_consistent(), "inconsistent entry {:?}", entry);
        (entry.available, entry.committed)
    }

    pub async fn assignments(&self, context_id: &str) -> Vec<assignment::Model> {
        assignment::Entity::find()
            .filter(assignment::Column::ContextId.eq(context_id))
            .all(&*self.db)
            .await
            .expect("query assignments")
    }

    pub async fn all_entries(&self) -> Vec<stock_entry::Model> {
        stock_entry::Entity::find()
            .all(&*self.db)
            .await
            .expect("query stock entries")
    }

    /// Pushes a session's last activity `secs` into the past.
    pub async fn age_session(&self, session_id: Uuid, secs: i64) {
        let stale = Utc::now() - chrono::Duration::seconds(secs);
        picking_session::Entity::update_many()
            .col_expr(picking_session::Column::LastActivityAt, Expr::value(stale))
            .filter(picking_session::Column::Id.eq(session_id))
            .exec(&*self.db)
            .await
            .expect("age session");
    }

    /// Overwrites an entry's quantities, keeping `on_hand` consistent.
    pub async fn set_levels(&self, sku: &str, bin_code: &str, available: i32, committed: i32) {
        stock_entry::Entity::update_many()
            .col_expr(stock_entry::Column::Available, Expr::value(available))
            .col_expr(stock_entry::Column::Committed, Expr::value(committed))
            .col_expr(stock_entry::Column::OnHand, Expr::value(available + committed))
            .filter(stock_entry::Column::Sku.eq(sku))
            .filter(stock_entry::Column::BinCode.eq(bin_code))
            .exec(&*self.db)
            .await
            .expect("set levels");
    }

    /// Forces a status without going through the state machine.
    pub async fn force_status(&self, session_id: Uuid, status: &str) {
        picking_session::Entity::update_many()
            .col_expr(picking_session::Column::Status, Expr::value(status))
            .filter(picking_session::Column::Id.eq(session_id))
            .exec(&*self.db)
            .await
            .expect("force status");
    }
}
