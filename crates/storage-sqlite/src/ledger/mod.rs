//! SQLite implementation of the operation ledger.

mod model;
mod repository;

pub use model::{
    ProcessedWebhookDB, RecordLinkDB, SyncConfigurationDB, SyncConflictDB, SyncOperationDB,
    SyncRunDB,
};
pub use repository::SqliteSyncLedger;
