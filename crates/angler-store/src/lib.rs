//! angler-store — SQLite-backed [`IdentityStore`](angler_core::IdentityStore).

mod migrations;
pub mod sqlite;

pub use sqlite::SqliteStore;
