use async_trait::async_trait;

use super::ledger_model::{
    BatchCounts, BatchRun, BatchStatus, ConflictSettlement, NewSyncOperation, OperationCounts,
    OperationFailure, OperationOutcome, OperationStatus, RecordLink, SyncOperation, SyncTrigger,
};
use crate::config::{SyncConfiguration, SystemId};
use crate::conflicts::{ConflictClaim, ConflictStatus, DataConflict, ResolvedPatch};
use crate::errors::Result;
use crate::records::FieldMap;

/// Durable store behind the engine, scoped to one organization.
///
/// Reads are synchronous; writes are async and must be serialized per row so
/// concurrent writers never interleave on the same operation, conflict or link.
#[async_trait]
pub trait SyncLedgerTrait: Send + Sync {
    // Operations

    async fn create_operation(&self, new_operation: NewSyncOperation) -> Result<SyncOperation>;

    async fn complete_operation(
        &self,
        operation_id: &str,
        outcome: OperationOutcome,
    ) -> Result<SyncOperation>;

    async fn fail_operation(
        &self,
        operation_id: &str,
        failure: OperationFailure,
    ) -> Result<SyncOperation>;

    /// Marks the operation `conflicted` and stores its conflicts in one step.
    async fn park_operation(
        &self,
        operation_id: &str,
        conflicts: Vec<DataConflict>,
    ) -> Result<Vec<DataConflict>>;

    fn get_operation(&self, operation_id: &str) -> Result<Option<SyncOperation>>;

    /// Newest first.
    fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<SyncOperation>>;

    fn operation_counts(&self) -> Result<OperationCounts>;

    // Conflicts

    fn get_conflict(&self, conflict_id: &str) -> Result<Option<DataConflict>>;

    fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<DataConflict>>;

    /// Whether the external record has conflicts that are not yet resolved.
    fn has_open_conflicts(&self, external_id: &str) -> Result<bool>;

    /// Moves a conflict `pending -> resolving`. A conflict already `resolving`
    /// yields `Error::ConflictInFlight`.
    async fn claim_conflict(&self, conflict_id: &str) -> Result<ConflictClaim>;

    /// Returns a claimed conflict to `pending` after a failed apply.
    async fn release_conflict(&self, conflict_id: &str) -> Result<()>;

    /// Stores the resolution, folds `patch.baseline_value` into the link baseline
    /// and completes the owning operation when no open conflicts remain.
    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        patch: ResolvedPatch,
    ) -> Result<ConflictSettlement>;

    // Record links

    fn find_link_by_external(&self, external_id: &str) -> Result<Option<RecordLink>>;

    fn find_link_by_internal(&self, internal_id: &str) -> Result<Option<RecordLink>>;

    fn list_links(&self) -> Result<Vec<RecordLink>>;

    /// Creates the link, or returns it unchanged if exactly this pair exists.
    /// Either id already linked elsewhere is `Error::LinkIntegrity`.
    async fn create_link(
        &self,
        external_id: &str,
        internal_id: &str,
        baseline: FieldMap,
    ) -> Result<RecordLink>;

    async fn update_link_baseline(&self, external_id: &str, baseline: FieldMap) -> Result<()>;

    /// Returns whether a link was removed.
    async fn remove_link(&self, external_id: &str) -> Result<bool>;

    // Webhook idempotency

    fn is_webhook_processed(&self, source: SystemId, event_id: &str) -> Result<bool>;

    /// Returns `false` if the key was already stored.
    async fn mark_webhook_processed(
        &self,
        source: SystemId,
        event_id: &str,
        operation_id: Option<String>,
    ) -> Result<bool>;

    // Batch history

    async fn start_batch_run(&self, trigger: SyncTrigger) -> Result<BatchRun>;

    async fn finish_batch_run(
        &self,
        batch_id: &str,
        status: BatchStatus,
        counts: BatchCounts,
        error: Option<String>,
    ) -> Result<BatchRun>;

    /// Most recently started batch.
    fn last_batch_run(&self) -> Result<Option<BatchRun>>;

    // Configuration

    fn load_configuration(&self) -> Result<Option<SyncConfiguration>>;

    async fn save_configuration(&self, config: &SyncConfiguration) -> Result<()>;
}
