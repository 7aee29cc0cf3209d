pub use sea_orm_migration::prelude::*;

mod m20241001_000001_create_stock_tables;
mod m20241001_000002_create_assignments_table;
mod m20241001_000003_create_picking_sessions_table;
mod m20241001_000004_create_emissions_table;
mod m20241001_000005_create_audit_log_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20241001_000001_create_stock_tables::Migration),
            Box::new(m20241001_000002_create_assignments_table::Migration),
            Box::new(m20241001_000003_create_picking_sessions_table::Migration),
            Box::new(m20241001_000004_create_emissions_table::Migration),
            Box::new(m20241001_000005_create_audit_log_table::Migration),
        ]
    }
}
