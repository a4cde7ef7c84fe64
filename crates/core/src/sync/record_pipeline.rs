//! Single-record reconciliation shared by batch passes and webhooks.
//!
//! Callers hold the record lock for the pair before entering.

use log::{debug, error, info, warn};

use super::sync_engine::SyncEngine;
use super::sync_events::SyncEvent;
use super::sync_retry::{retry_transient, RetryPolicy};
use crate::config::{SyncConfiguration, SyncDirection, SystemId};
use crate::errors::{Error, Result};
use crate::ledger::{
    FieldChange, NewSyncOperation, OperationFailure, OperationKind, OperationOutcome,
    RecordLink, SyncOperation, SyncTrigger,
};
use crate::mapping::values_equal;
use crate::records::{
    ExternalRecord, ExternalRecordPatch, FieldMap, InternalRecord, InternalRecordFilter,
    InternalRecordPatch,
};

/// Settings shared by every record of one pass.
#[derive(Debug, Clone)]
pub(crate) struct PassContext {
    pub config: SyncConfiguration,
    pub retry: RetryPolicy,
    pub trigger: SyncTrigger,
    /// System whose change started the work.
    pub origin: SystemId,
    pub batch_id: Option<String>,
    pub idempotency_key: Option<String>,
}

impl PassContext {
    pub fn new(config: SyncConfiguration, trigger: SyncTrigger, origin: SystemId) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            config,
            trigger,
            origin,
            batch_id: None,
            idempotency_key: None,
        }
    }

    pub fn direction(&self) -> SyncDirection {
        self.config.direction
    }

    /// Pending operation for the pair, oriented from `origin` to the other side.
    pub fn operation(
        &self,
        kind: OperationKind,
        direction: SyncDirection,
        external_id: &str,
        internal_id: Option<&str>,
    ) -> NewSyncOperation {
        let (source_id, target_id) = match (self.origin, internal_id) {
            (SystemId::SystemB, Some(internal_id)) => (internal_id, Some(external_id)),
            _ => (external_id, internal_id),
        };
        let mut op = NewSyncOperation::new(
            kind,
            direction,
            self.origin,
            source_id,
            self.trigger,
            self.retry.max_attempts,
        );
        op.target_id = target_id.map(str::to_string);
        op.batch_id = self.batch_id.clone();
        op.idempotency_key = self.idempotency_key.clone();
        op
    }
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordOutcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
    Conflicted,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordResult {
    pub outcome: RecordOutcome,
    pub operation_id: Option<String>,
}

impl RecordResult {
    pub fn new(outcome: RecordOutcome, operation_id: Option<String>) -> Self {
        Self {
            outcome,
            operation_id,
        }
    }

    pub fn skipped() -> Self {
        Self::new(RecordOutcome::Skipped, None)
    }
}

/// The System B side of a pair as already known to the caller.
#[derive(Debug, Clone)]
pub(crate) enum Counterpart {
    /// Looked up by the caller; `None` means no such record exists.
    Known(Option<InternalRecord>),
    /// Fetch it here.
    Lookup,
}

impl SyncEngine {
    /// Reconciles one external record with its System B counterpart.
    pub(crate) async fn reconcile_external(
        &self,
        ctx: &PassContext,
        ext: &ExternalRecord,
        counterpart: Counterpart,
    ) -> Result<RecordResult> {
        match self.ledger.find_link_by_external(&ext.id)? {
            Some(link) => {
                if self.ledger.has_open_conflicts(&ext.id)? {
                    debug!(
                        "[EventSync] Skipping {}: parked until its conflicts are resolved",
                        ext.id
                    );
                    return Ok(RecordResult::skipped());
                }
                let known = match counterpart {
                    Counterpart::Known(Some(record)) if record.id == link.internal_id => {
                        Some(record)
                    }
                    _ => None,
                };
                let internal = match known {
                    Some(record) => record,
                    None => self.fetch_linked_internal(ctx, ext, &link).await?,
                };
                self.reconcile_linked(ctx, ext, &internal, &link).await
            }
            None => {
                if !ctx.direction().allows_to_internal() {
                    debug!(
                        "[EventSync] Skipping unlinked {}: direction {} never creates in System B",
                        ext.id,
                        ctx.direction()
                    );
                    return Ok(RecordResult::skipped());
                }
                let candidate = match counterpart {
                    Counterpart::Known(candidate) => candidate,
                    Counterpart::Lookup => self.find_by_back_reference(ctx, ext).await?,
                };
                if let Some(orphan) =
                    candidate.filter(|r| r.external_id.as_deref() == Some(ext.id.as_str()))
                {
                    if self.ledger.find_link_by_internal(&orphan.id)?.is_none() {
                        return self.adopt(ctx, ext, orphan).await;
                    }
                }
                self.create_internal(ctx, ext).await
            }
        }
    }

    async fn fetch_linked_internal(
        &self,
        ctx: &PassContext,
        ext: &ExternalRecord,
        link: &RecordLink,
    ) -> Result<InternalRecord> {
        let client = &self.internal;
        let id = link.internal_id.as_str();
        let fetched = retry_transient(ctx.retry, "fetch System B record", move || {
            client.get_record(id)
        })
        .await;
        let missing = || {
            Error::link_integrity(format!(
                "Record {} linked to {} no longer exists in System B",
                link.internal_id, ext.id
            ))
        };
        match fetched.result.and_then(|found| found.ok_or_else(missing)) {
            Ok(record) => Ok(record),
            Err(err) => {
                let op = ctx.operation(
                    OperationKind::Update,
                    ctx.direction(),
                    &ext.id,
                    Some(&link.internal_id),
                );
                Err(self.record_failure(op, err, fetched.attempts).await)
            }
        }
    }

    async fn find_by_back_reference(
        &self,
        ctx: &PassContext,
        ext: &ExternalRecord,
    ) -> Result<Option<InternalRecord>> {
        let client = &self.internal;
        let filter = InternalRecordFilter::by_external_ids(vec![ext.id.clone()]);
        let filter = &filter;
        let fetched = retry_transient(ctx.retry, "search System B records", move || {
            client.list_records(filter)
        })
        .await;
        match fetched.result {
            Ok(records) => Ok(records
                .into_iter()
                .find(|r| r.external_id.as_deref() == Some(ext.id.as_str()))),
            Err(err) => {
                let op = ctx.operation(OperationKind::Create, SyncDirection::AToB, &ext.id, None);
                Err(self.record_failure(op, err, fetched.attempts).await)
            }
        }
    }

    /// Links an existing System B record that already points back at `ext`.
    async fn adopt(
        &self,
        ctx: &PassContext,
        ext: &ExternalRecord,
        orphan: InternalRecord,
    ) -> Result<RecordResult> {
        info!(
            "[EventSync] Adopting System B record {} for external {}",
            orphan.id, ext.id
        );
        let baseline = self.agreed_baseline(&FieldMap::new(), ext, &orphan, None, None);
        match self.ledger.create_link(&ext.id, &orphan.id, baseline).await {
            Ok(link) => self.reconcile_linked(ctx, ext, &orphan, &link).await,
            Err(err) => {
                let op = ctx.operation(
                    OperationKind::Create,
                    SyncDirection::AToB,
                    &ext.id,
                    Some(&orphan.id),
                );
                Err(self.record_failure(op, err, 0).await)
            }
        }
    }

    async fn create_internal(&self, ctx: &PassContext, ext: &ExternalRecord) -> Result<RecordResult> {
        let patch = self.mapper.to_internal(ext);
        let op = self
            .ledger
            .create_operation(ctx.operation(
                OperationKind::Create,
                SyncDirection::AToB,
                &ext.id,
                None,
            ))
            .await?;

        let client = &self.internal;
        let create = &patch;
        let created = retry_transient(ctx.retry, "create System B record", move || {
            client.create_record(create)
        })
        .await;
        let internal_id = match created.result {
            Ok(id) => id,
            Err(err) => return Err(self.fail_operation(&op, err, created.attempts).await),
        };
        if let Err(err) = self
            .ledger
            .create_link(&ext.id, &internal_id, patch.fields.clone())
            .await
        {
            return Err(self.fail_operation(&op, err, created.attempts).await);
        }

        let changes = patch
            .fields
            .iter()
            .map(|(field, value)| FieldChange {
                field: field.clone(),
                target: SystemId::SystemB,
                old_value: None,
                new_value: value.clone(),
            })
            .collect();
        let op = self
            .ledger
            .complete_operation(
                &op.id,
                OperationOutcome {
                    target_id: Some(internal_id.clone()),
                    changes,
                    retry_count: created.attempts,
                },
            )
            .await?;
        info!(
            "[EventSync] Created System B record {} for external {}",
            internal_id, ext.id
        );
        self.emit_completed(&op);
        Ok(RecordResult::new(RecordOutcome::Created, Some(op.id)))
    }

    /// Three-way reconciliation of a linked pair. Any conflict parks the whole
    /// operation and nothing is written, not even the fields that merged cleanly.
    async fn reconcile_linked(
        &self,
        ctx: &PassContext,
        ext: &ExternalRecord,
        internal: &InternalRecord,
        link: &RecordLink,
    ) -> Result<RecordResult> {
        let reconciliation = self.detector.reconcile(ext, internal, Some(&link.baseline));
        let direction = ctx.direction();
        let to_internal = if direction.allows_to_internal() {
            reconciliation.to_internal
        } else {
            FieldMap::new()
        };
        let to_external = if direction.allows_to_external() {
            reconciliation.to_external
        } else {
            FieldMap::new()
        };
        let conflicts = reconciliation.conflicts;

        if conflicts.is_empty() && to_internal.is_empty() && to_external.is_empty() {
            let baseline = self.agreed_baseline(&link.baseline, ext, internal, None, None);
            if baseline != link.baseline {
                self.ledger.update_link_baseline(&ext.id, baseline).await?;
            }
            return Ok(RecordResult::new(RecordOutcome::Unchanged, None));
        }

        let op_direction = if !conflicts.is_empty() {
            direction
        } else {
            match (to_internal.is_empty(), to_external.is_empty()) {
                (false, true) => SyncDirection::AToB,
                (true, false) => SyncDirection::BToA,
                _ => SyncDirection::Bidirectional,
            }
        };
        let op = self
            .ledger
            .create_operation(ctx.operation(
                OperationKind::Update,
                op_direction,
                &ext.id,
                Some(&internal.id),
            ))
            .await?;

        if !conflicts.is_empty() {
            let conflicts = conflicts
                .into_iter()
                .map(|mut conflict| {
                    conflict.operation_id = Some(op.id.clone());
                    conflict
                })
                .collect();
            let stored = self.ledger.park_operation(&op.id, conflicts).await?;
            for conflict in &stored {
                info!(
                    "[EventSync] Conflict on {}.{} ({:?}): external={} internal={}",
                    conflict.external_id,
                    conflict.field,
                    conflict.priority,
                    conflict.external_value,
                    conflict.internal_value
                );
                self.event_sink.emit(SyncEvent::ConflictDetected {
                    conflict_id: conflict.id.clone(),
                    external_id: conflict.external_id.clone(),
                    field: conflict.field.clone(),
                    priority: conflict.priority,
                });
            }
            return Ok(RecordResult::new(RecordOutcome::Conflicted, Some(op.id)));
        }

        let mut changes = Vec::new();
        let mut attempts = 0;
        if !to_internal.is_empty() {
            let patch = InternalRecordPatch {
                external_id: None,
                fields: to_internal.clone(),
            };
            let client = &self.internal;
            let id = internal.id.as_str();
            let update = &patch;
            let written = retry_transient(ctx.retry, "update System B record", move || {
                client.update_record(id, update)
            })
            .await;
            attempts = attempts.max(written.attempts);
            if let Err(err) = written.result {
                return Err(self.fail_operation(&op, err, attempts).await);
            }
            changes.extend(to_internal.iter().map(|(field, value)| FieldChange {
                field: field.clone(),
                target: SystemId::SystemB,
                old_value: internal.fields.get(field).cloned(),
                new_value: value.clone(),
            }));
        }
        if !to_external.is_empty() {
            let patch = ExternalRecordPatch {
                fields: to_external.clone(),
            };
            let client = &self.external;
            let id = ext.id.as_str();
            let update = &patch;
            let written = retry_transient(ctx.retry, "update System A event", move || {
                client.update_event(id, update)
            })
            .await;
            attempts = attempts.max(written.attempts);
            if let Err(err) = written.result {
                return Err(self.fail_operation(&op, err, attempts).await);
            }
            changes.extend(to_external.iter().map(|(field, value)| FieldChange {
                field: field.clone(),
                target: SystemId::SystemA,
                old_value: ext.fields.get(field).cloned(),
                new_value: value.clone(),
            }));
        }

        let baseline = self.agreed_baseline(
            &link.baseline,
            ext,
            internal,
            Some(&to_internal),
            Some(&to_external),
        );
        self.ledger.update_link_baseline(&ext.id, baseline).await?;
        let op = self
            .ledger
            .complete_operation(
                &op.id,
                OperationOutcome {
                    target_id: op.target_id.clone(),
                    changes,
                    retry_count: attempts,
                },
            )
            .await?;
        debug!(
            "[EventSync] Updated pair {} <-> {} ({} field changes)",
            ext.id,
            internal.id,
            op.changes.len()
        );
        self.emit_completed(&op);
        Ok(RecordResult::new(RecordOutcome::Updated, Some(op.id)))
    }

    /// Baseline after the given writes: every tracked field on which both
    /// sides now agree takes the agreed value, the rest keep `previous`.
    pub(crate) fn agreed_baseline(
        &self,
        previous: &FieldMap,
        ext: &ExternalRecord,
        internal: &InternalRecord,
        written_to_internal: Option<&FieldMap>,
        written_to_external: Option<&FieldMap>,
    ) -> FieldMap {
        let mut a_side = self.mapper.to_internal(ext).fields;
        let mut b_side = self.mapper.normalize_internal(&internal.fields);
        if let Some(written) = written_to_internal {
            b_side.extend(written.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(written) = written_to_external {
            for mapping in self.mapper.table() {
                if let Some(value) = written.get(&mapping.external) {
                    a_side.insert(mapping.internal.clone(), value.clone());
                }
            }
        }

        let mut baseline = previous.clone();
        for mapping in self.mapper.table() {
            if let (Some(a), Some(b)) = (a_side.get(&mapping.internal), b_side.get(&mapping.internal)) {
                if values_equal(mapping.kind, a, b) {
                    baseline.insert(mapping.internal.clone(), a.clone());
                }
            }
        }
        baseline
    }

    /// Marks `op` failed and reports it. Returns the error for propagation.
    pub(crate) async fn fail_operation(&self, op: &SyncOperation, err: Error, attempts: u32) -> Error {
        if let Err(ledger_err) = self
            .ledger
            .fail_operation(&op.id, OperationFailure::from_error(&err, attempts))
            .await
        {
            error!(
                "[EventSync] Could not record failure of operation {}: {}",
                op.id, ledger_err
            );
        }
        warn!(
            "[EventSync] Operation {} ({:?} {}) failed after {} attempt(s): {}",
            op.id, op.kind, op.source_id, attempts, err
        );
        self.event_sink.emit(SyncEvent::OperationFailed {
            operation_id: op.id.clone(),
            source_id: op.source_id.clone(),
            code: err.kind().to_string(),
            error: err.to_string(),
        });
        err
    }

    /// Records a failure that happened before an operation existed.
    pub(crate) async fn record_failure(&self, new_op: NewSyncOperation, err: Error, attempts: u32) -> Error {
        match self.ledger.create_operation(new_op).await {
            Ok(op) => self.fail_operation(&op, err, attempts).await,
            Err(ledger_err) => {
                error!(
                    "[EventSync] Could not record failed operation: {} (original error: {})",
                    ledger_err, err
                );
                err
            }
        }
    }

    pub(crate) fn emit_completed(&self, op: &SyncOperation) {
        self.event_sink.emit(SyncEvent::OperationCompleted {
            operation_id: op.id.clone(),
            kind: op.kind,
            source_id: op.source_id.clone(),
            target_id: op.target_id.clone(),
        });
    }
}
