//! SQLite persistence for the sync engine.
//!
//! Every ledger row is scoped by organization so several engines can share one
//! database file. Reads use the pool directly; writes go through the single
//! writer actor and run inside one transaction per job.

pub mod db;
pub mod errors;
pub mod ledger;
pub mod schema;

pub use db::{create_pool, get_connection, init, run_migrations, DbPool, WriteHandle};
pub use errors::StorageError;
pub use ledger::SqliteSyncLedger;
