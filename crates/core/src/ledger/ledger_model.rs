use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{SyncDirection, SystemId};
use crate::conflicts::DataConflict;
use crate::records::FieldMap;

/// What a sync operation does to the target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle: `pending -> completed | failed | conflicted`, and `conflicted -> completed`
/// once every conflict of the operation has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
    Conflicted,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Conflicted => "conflicted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Conflicted)
                | (Self::Conflicted, Self::Completed)
        )
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "conflicted" => Ok(Self::Conflicted),
            other => Err(crate::Error::validation(format!(
                "Unknown operation status '{}'",
                other
            ))),
        }
    }
}

/// What started a unit of sync work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
    Webhook,
}

/// One field written to one system, in application order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Field name as known by `target`.
    pub field: String,
    pub target: SystemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    pub new_value: Value,
}

/// One attempt to reconcile one record pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub kind: OperationKind,
    pub direction: SyncDirection,
    pub source_system: SystemId,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
    pub trigger: SyncTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for recording a new pending operation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncOperation {
    pub kind: OperationKind,
    pub direction: SyncDirection,
    pub source_system: SystemId,
    pub source_id: String,
    pub target_id: Option<String>,
    pub max_retries: u32,
    pub trigger: SyncTrigger,
    pub idempotency_key: Option<String>,
    pub batch_id: Option<String>,
}

impl NewSyncOperation {
    pub fn new(
        kind: OperationKind,
        direction: SyncDirection,
        source_system: SystemId,
        source_id: impl Into<String>,
        trigger: SyncTrigger,
        max_retries: u32,
    ) -> Self {
        Self {
            kind,
            direction,
            source_system,
            source_id: source_id.into(),
            target_id: None,
            max_retries,
            trigger,
            idempotency_key: None,
            batch_id: None,
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// Materializes the pending operation with a fresh id.
    pub fn into_operation(self, now: DateTime<Utc>) -> SyncOperation {
        SyncOperation {
            id: Uuid::now_v7().to_string(),
            kind: self.kind,
            direction: self.direction,
            source_system: self.source_system,
            source_id: self.source_id,
            target_id: self.target_id,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            changes: Vec::new(),
            last_error: None,
            last_error_code: None,
            trigger: self.trigger,
            idempotency_key: self.idempotency_key,
            batch_id: self.batch_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Successful outcome written by `complete_operation`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOutcome {
    pub target_id: Option<String>,
    pub changes: Vec<FieldChange>,
    pub retry_count: u32,
}

/// Failure written by `fail_operation`.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationFailure {
    pub message: String,
    pub code: crate::errors::SyncErrorKind,
    pub retry_count: u32,
}

impl OperationFailure {
    pub fn from_error(error: &crate::Error, retry_count: u32) -> Self {
        Self {
            message: error.to_string(),
            code: error.kind(),
            retry_count,
        }
    }
}

/// Durable `external_id <-> internal_id` association. Bijective per organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordLink {
    pub external_id: String,
    pub internal_id: String,
    /// Last field values both systems agreed on, internal names, normalized.
    #[serde(default)]
    pub baseline: FieldMap,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Result of settling a conflict in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictSettlement {
    pub conflict: DataConflict,
    /// Set when this was the last open conflict of its operation.
    pub completed_operation: Option<SyncOperation>,
}

/// Persisted status of one batch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
    /// Returned to a trigger that arrived while another batch was running. Never persisted.
    Coalesced,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Coalesced => "coalesced",
        }
    }
}

/// Per-batch tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicted: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// History entry for one batch pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRun {
    pub id: String,
    pub trigger: SyncTrigger,
    pub status: BatchStatus,
    pub counts: BatchCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Summary returned by `trigger_sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: BatchStatus,
    pub counts: BatchCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl BatchSyncResult {
    pub fn coalesced() -> Self {
        Self {
            batch_id: None,
            status: BatchStatus::Coalesced,
            counts: BatchCounts::default(),
            error: None,
            duration_ms: 0,
        }
    }
}

/// Operation totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCounts {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflicted: usize,
}
