// Stock ledger and allocation
pub mod bin_selector;
pub mod reservation;
pub mod stock_ledger;

// Warehouse data
pub mod bins;
pub mod inventory;

// Picking sessions
pub mod sessions;
pub mod zombies;

// External documents
pub mod document_emitter;
pub mod emissions;

// Reconciliation
pub mod audit;
