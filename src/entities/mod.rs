pub mod assignment;
pub mod audit_log;
pub mod bin;
pub mod emission;
pub mod picking_session;
pub mod stock_entry;

pub use picking_session::{SessionLine, SessionNotes, SessionStatus};
