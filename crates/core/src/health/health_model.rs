use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SyncDirection;
use crate::ledger::BatchStatus;

/// Result of probing one collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStatus {
    pub connected: bool,
    pub latency_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Derived snapshot; recomputed from the ledger on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub organization_id: String,
    pub direction: SyncDirection,
    pub auto_sync_enabled: bool,
    pub system_a: ConnectivityStatus,
    pub system_b: ConnectivityStatus,
    pub batch_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_status: Option<BatchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sync_at: Option<DateTime<Utc>>,
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub conflicted_operations: usize,
    pub unresolved_conflicts: usize,
    pub checked_at: DateTime<Utc>,
}

impl SyncStatus {
    /// Both sides reachable and nothing needs an operator.
    pub fn is_healthy(&self) -> bool {
        self.system_a.connected
            && self.system_b.connected
            && self.failed_operations == 0
            && self.unresolved_conflicts == 0
    }
}
