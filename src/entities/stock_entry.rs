use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Physical stock for one SKU in one bin.
///
/// `on_hand` is persisted for reporting but every ledger write keeps it equal
/// to `available + committed`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub sku: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub bin_code: String,
    pub available: i32,
    pub committed: i32,
    pub on_hand: i32,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn is_consistent(&self) -> bool {
        self.available >= 0 && self.committed >= 0 && self.on_hand == self.available + self.committed
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::bin::Entity",
        from = "Column::BinCode",
        to = "super::bin::Column::BinCode"
    )]
    Bin,
}

impl Related<super::bin::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Bin.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
