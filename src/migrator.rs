//! Schema migrations live in the `migrations` workspace crate so the
//! standalone `migration` binary and the library share one list.

pub use migrations::Migrator;
