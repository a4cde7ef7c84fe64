//! Engine scenarios against in-memory collaborators.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::*;
use crate::config::{EndpointConfig, SyncConfiguration, SyncDirection, SystemId};
use crate::conflicts::{
    ConflictClaim, ConflictPriority, ConflictStatus, DataConflict, ResolutionPolicy,
    ResolvedPatch,
};
use crate::errors::{Error, Result};
use crate::ledger::{
    BatchCounts, BatchRun, BatchStatus, ConflictSettlement, FieldChange, NewSyncOperation,
    OperationCounts, OperationFailure, OperationKind, OperationOutcome, OperationStatus,
    RecordLink, SyncLedgerTrait, SyncOperation, SyncTrigger,
};
use crate::records::{
    EventFilter, ExternalEventClientTrait, ExternalRecord, ExternalRecordPatch, FieldMap,
    InternalRecord, InternalRecordClientTrait, InternalRecordFilter, InternalRecordPatch,
};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeSystemA {
    events: Mutex<BTreeMap<String, ExternalRecord>>,
    update_calls: AtomicU32,
    list_delay: Mutex<Option<Duration>>,
    fail_list: Mutex<bool>,
    offline: Mutex<bool>,
}

impl FakeSystemA {
    fn put(&self, record: ExternalRecord) {
        self.events.lock().unwrap().insert(record.id.clone(), record);
    }

    fn set_field(&self, id: &str, field: &str, value: Value) {
        let mut events = self.events.lock().unwrap();
        let record = events.get_mut(id).expect("event exists");
        record.fields.insert(field.to_string(), value);
        record.last_modified = Utc::now();
    }

    fn field(&self, id: &str, field: &str) -> Option<Value> {
        self.events.lock().unwrap().get(id)?.fields.get(field).cloned()
    }
}

#[async_trait]
impl ExternalEventClientTrait for FakeSystemA {
    async fn list_events(&self, _filter: &EventFilter) -> Result<Vec<ExternalRecord>> {
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_list.lock().unwrap() {
            return Err(Error::connection("System A unreachable"));
        }
        Ok(self.events.lock().unwrap().values().cloned().collect())
    }

    async fn get_event(&self, id: &str) -> Result<ExternalRecord> {
        self.events
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("event {}", id)))
    }

    async fn update_event(&self, id: &str, patch: &ExternalRecordPatch) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut events = self.events.lock().unwrap();
        let record = events
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("event {}", id)))?;
        patch.apply_to(record);
        record.last_modified = Utc::now();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if *self.offline.lock().unwrap() {
            return Err(Error::connection("System A offline"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeSystemB {
    records: Mutex<BTreeMap<String, InternalRecord>>,
    next_id: AtomicU32,
    list_calls: AtomicU32,
    create_calls: AtomicU32,
    update_calls: AtomicU32,
    delete_calls: AtomicU32,
    /// External ids whose creation always fails with a connection error.
    failing_creates: Mutex<HashSet<String>>,
    create_delay: Mutex<Option<Duration>>,
}

impl FakeSystemB {
    fn put(&self, record: InternalRecord) {
        self.records.lock().unwrap().insert(record.id.clone(), record);
    }

    fn set_field(&self, id: &str, field: &str, value: Value) {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(id).expect("record exists");
        record.fields.insert(field.to_string(), value);
        record.updated_at = Utc::now();
    }

    fn record(&self, id: &str) -> Option<InternalRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    fn field(&self, id: &str, field: &str) -> Option<Value> {
        self.record(id)?.fields.get(field).cloned()
    }

    fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl InternalRecordClientTrait for FakeSystemB {
    async fn list_records(&self, filter: &InternalRecordFilter) -> Result<Vec<InternalRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|r| {
                filter.is_empty()
                    || filter.ids.contains(&r.id)
                    || r
                        .external_id
                        .as_ref()
                        .map_or(false, |e| filter.external_ids.contains(e))
            })
            .cloned()
            .collect())
    }

    async fn create_record(&self, patch: &InternalRecordPatch) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(external_id) = &patch.external_id {
            if self.failing_creates.lock().unwrap().contains(external_id) {
                return Err(Error::connection("connection reset by peer"));
            }
        }
        let id = format!("I{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut record = InternalRecord::new(id.clone(), Utc::now());
        patch.apply_to(&mut record);
        self.put(record);
        Ok(id)
    }

    async fn update_record(&self, id: &str, patch: &InternalRecordPatch) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("record {}", id)))?;
        patch.apply_to(record);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_record(&self, id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("record {}", id)))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct LedgerState {
    operations: Vec<SyncOperation>,
    conflicts: Vec<DataConflict>,
    links: Vec<RecordLink>,
    webhooks: HashSet<(SystemId, String)>,
    runs: Vec<BatchRun>,
    config: Option<SyncConfiguration>,
}

#[derive(Default)]
struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    fn operations(&self) -> Vec<SyncOperation> {
        self.state.lock().unwrap().operations.clone()
    }

    fn runs(&self) -> Vec<BatchRun> {
        self.state.lock().unwrap().runs.clone()
    }

    fn link_for(&self, external_id: &str) -> Option<RecordLink> {
        self.find_link_by_external(external_id).unwrap()
    }
}

fn operation_mut<'a>(state: &'a mut LedgerState, id: &str) -> Result<&'a mut SyncOperation> {
    state
        .operations
        .iter_mut()
        .find(|op| op.id == id)
        .ok_or_else(|| Error::not_found(format!("operation {}", id)))
}

#[async_trait]
impl SyncLedgerTrait for InMemoryLedger {
    async fn create_operation(&self, new_operation: NewSyncOperation) -> Result<SyncOperation> {
        let op = new_operation.into_operation(Utc::now());
        self.state.lock().unwrap().operations.push(op.clone());
        Ok(op)
    }

    async fn complete_operation(
        &self,
        operation_id: &str,
        outcome: OperationOutcome,
    ) -> Result<SyncOperation> {
        let mut state = self.state.lock().unwrap();
        let op = operation_mut(&mut state, operation_id)?;
        op.status = OperationStatus::Completed;
        if outcome.target_id.is_some() {
            op.target_id = outcome.target_id;
        }
        op.changes = outcome.changes;
        op.retry_count = outcome.retry_count;
        op.completed_at = Some(Utc::now());
        Ok(op.clone())
    }

    async fn fail_operation(
        &self,
        operation_id: &str,
        failure: OperationFailure,
    ) -> Result<SyncOperation> {
        let mut state = self.state.lock().unwrap();
        let op = operation_mut(&mut state, operation_id)?;
        op.status = OperationStatus::Failed;
        op.last_error = Some(failure.message);
        op.last_error_code = Some(failure.code.to_string());
        op.retry_count = failure.retry_count;
        Ok(op.clone())
    }

    async fn park_operation(
        &self,
        operation_id: &str,
        conflicts: Vec<DataConflict>,
    ) -> Result<Vec<DataConflict>> {
        let mut state = self.state.lock().unwrap();
        operation_mut(&mut state, operation_id)?.status = OperationStatus::Conflicted;
        state.conflicts.extend(conflicts.iter().cloned());
        Ok(conflicts)
    }

    fn get_operation(&self, operation_id: &str) -> Result<Option<SyncOperation>> {
        let state = self.state.lock().unwrap();
        Ok(state.operations.iter().find(|op| op.id == operation_id).cloned())
    }

    fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<SyncOperation>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .operations
            .iter()
            .rev()
            .filter(|op| status.map_or(true, |s| op.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    fn operation_counts(&self) -> Result<OperationCounts> {
        let state = self.state.lock().unwrap();
        let mut counts = OperationCounts::default();
        for op in &state.operations {
            match op.status {
                OperationStatus::Pending => counts.pending += 1,
                OperationStatus::Completed => counts.completed += 1,
                OperationStatus::Failed => counts.failed += 1,
                OperationStatus::Conflicted => counts.conflicted += 1,
            }
        }
        Ok(counts)
    }

    fn get_conflict(&self, conflict_id: &str) -> Result<Option<DataConflict>> {
        let state = self.state.lock().unwrap();
        Ok(state.conflicts.iter().find(|c| c.id == conflict_id).cloned())
    }

    fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<DataConflict>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .conflicts
            .iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    fn has_open_conflicts(&self, external_id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .conflicts
            .iter()
            .any(|c| c.external_id == external_id && c.status != ConflictStatus::Resolved))
    }

    async fn claim_conflict(&self, conflict_id: &str) -> Result<ConflictClaim> {
        let mut state = self.state.lock().unwrap();
        let conflict = state
            .conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| Error::not_found(format!("conflict {}", conflict_id)))?;
        match conflict.status {
            ConflictStatus::Pending => {
                conflict.status = ConflictStatus::Resolving;
                Ok(ConflictClaim::Claimed(conflict.clone()))
            }
            ConflictStatus::Resolving => Err(Error::ConflictInFlight {
                conflict_id: conflict_id.to_string(),
            }),
            ConflictStatus::Resolved => Ok(ConflictClaim::AlreadyResolved(conflict.clone())),
        }
    }

    async fn release_conflict(&self, conflict_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(conflict) = state.conflicts.iter_mut().find(|c| c.id == conflict_id) {
            if conflict.status == ConflictStatus::Resolving {
                conflict.status = ConflictStatus::Pending;
            }
        }
        Ok(())
    }

    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        patch: ResolvedPatch,
    ) -> Result<ConflictSettlement> {
        let mut state = self.state.lock().unwrap();
        let conflict = {
            let conflict = state
                .conflicts
                .iter_mut()
                .find(|c| c.id == conflict_id)
                .ok_or_else(|| Error::not_found(format!("conflict {}", conflict_id)))?;
            conflict.status = ConflictStatus::Resolved;
            conflict.resolution = Some(patch.clone());
            conflict.resolved_at = Some(Utc::now());
            conflict.clone()
        };
        if let Some(link) = state
            .links
            .iter_mut()
            .find(|l| l.external_id == conflict.external_id)
        {
            link.baseline
                .insert(conflict.field.clone(), patch.baseline_value.clone());
        }
        let mut completed_operation = None;
        if let Some(operation_id) = conflict.operation_id.clone() {
            let open = state.conflicts.iter().any(|c| {
                c.operation_id.as_deref() == Some(operation_id.as_str())
                    && c.status != ConflictStatus::Resolved
            });
            if !open {
                let op = operation_mut(&mut state, &operation_id)?;
                op.status = OperationStatus::Completed;
                op.completed_at = Some(Utc::now());
                completed_operation = Some(op.clone());
            }
        }
        Ok(ConflictSettlement {
            conflict,
            completed_operation,
        })
    }

    fn find_link_by_external(&self, external_id: &str) -> Result<Option<RecordLink>> {
        let state = self.state.lock().unwrap();
        Ok(state.links.iter().find(|l| l.external_id == external_id).cloned())
    }

    fn find_link_by_internal(&self, internal_id: &str) -> Result<Option<RecordLink>> {
        let state = self.state.lock().unwrap();
        Ok(state.links.iter().find(|l| l.internal_id == internal_id).cloned())
    }

    fn list_links(&self) -> Result<Vec<RecordLink>> {
        Ok(self.state.lock().unwrap().links.clone())
    }

    async fn create_link(
        &self,
        external_id: &str,
        internal_id: &str,
        baseline: FieldMap,
    ) -> Result<RecordLink> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .links
            .iter()
            .find(|l| l.external_id == external_id || l.internal_id == internal_id)
        {
            if existing.external_id == external_id && existing.internal_id == internal_id {
                return Ok(existing.clone());
            }
            return Err(Error::link_integrity(format!(
                "{} <-> {} collides with {} <-> {}",
                external_id, internal_id, existing.external_id, existing.internal_id
            )));
        }
        let link = RecordLink {
            external_id: external_id.to_string(),
            internal_id: internal_id.to_string(),
            baseline,
            last_synced_at: Utc::now(),
            created_at: Utc::now(),
        };
        state.links.push(link.clone());
        Ok(link)
    }

    async fn update_link_baseline(&self, external_id: &str, baseline: FieldMap) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .iter_mut()
            .find(|l| l.external_id == external_id)
            .ok_or_else(|| Error::not_found(format!("link {}", external_id)))?;
        link.baseline = baseline;
        link.last_synced_at = Utc::now();
        Ok(())
    }

    async fn remove_link(&self, external_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.links.len();
        state.links.retain(|l| l.external_id != external_id);
        Ok(state.links.len() != before)
    }

    fn is_webhook_processed(&self, source: SystemId, event_id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.webhooks.contains(&(source, event_id.to_string())))
    }

    async fn mark_webhook_processed(
        &self,
        source: SystemId,
        event_id: &str,
        _operation_id: Option<String>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state.webhooks.insert((source, event_id.to_string())))
    }

    async fn start_batch_run(&self, trigger: SyncTrigger) -> Result<BatchRun> {
        let mut state = self.state.lock().unwrap();
        let run = BatchRun {
            id: format!("batch-{}", state.runs.len() + 1),
            trigger,
            status: BatchStatus::Running,
            counts: BatchCounts::default(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn finish_batch_run(
        &self,
        batch_id: &str,
        status: BatchStatus,
        counts: BatchCounts,
        error: Option<String>,
    ) -> Result<BatchRun> {
        let mut state = self.state.lock().unwrap();
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == batch_id)
            .ok_or_else(|| Error::not_found(format!("batch {}", batch_id)))?;
        run.status = status;
        run.counts = counts;
        run.error = error;
        run.finished_at = Some(Utc::now());
        Ok(run.clone())
    }

    fn last_batch_run(&self) -> Result<Option<BatchRun>> {
        Ok(self.state.lock().unwrap().runs.last().cloned())
    }

    fn load_configuration(&self) -> Result<Option<SyncConfiguration>> {
        Ok(self.state.lock().unwrap().config.clone())
    }

    async fn save_configuration(&self, config: &SyncConfiguration) -> Result<()> {
        self.state.lock().unwrap().config = Some(config.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    system_a: Arc<FakeSystemA>,
    system_b: Arc<FakeSystemB>,
    ledger: Arc<InMemoryLedger>,
    events: BroadcastSyncEventSink,
    engine: Arc<SyncEngine>,
}

fn test_config() -> SyncConfiguration {
    SyncConfiguration::new(
        "org-1",
        EndpointConfig::new("https://crm.example.com"),
        EndpointConfig::new("https://ops.example.com"),
    )
    .with_max_retries(3)
    .with_retry_delays(1, 2)
}

fn harness_with(config: SyncConfiguration) -> Harness {
    let system_a = Arc::new(FakeSystemA::default());
    let system_b = Arc::new(FakeSystemB::default());
    let ledger = Arc::new(InMemoryLedger::default());
    let events = BroadcastSyncEventSink::new(64);
    let engine = SyncEngine::new(
        config,
        system_a.clone(),
        system_b.clone(),
        ledger.clone(),
    )
    .expect("valid configuration")
    .with_event_sink(Arc::new(events.clone()));
    Harness {
        system_a,
        system_b,
        ledger,
        events,
        engine: Arc::new(engine),
    }
}

fn harness() -> Harness {
    harness_with(test_config())
}

fn gala(id: &str, guests: i64) -> ExternalRecord {
    ExternalRecord::new(id, Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap())
        .with_field("event_name", json!("Gala"))
        .with_field("event_date", json!("2025-06-01"))
        .with_field("guest_count", json!(guests))
}

/// Creates `E1` and runs one batch so `E1 <-> I1` is linked.
async fn linked_pair(h: &Harness, guests: i64) -> String {
    h.system_a.put(gala("E1", guests));
    let result = h.engine.trigger_sync().await.expect("initial batch");
    assert_eq!(result.counts.created, 1);
    h.ledger.link_for("E1").expect("linked").internal_id
}

// ---------------------------------------------------------------------------
// Batch sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_creates_and_links_unlinked_record() {
    let h = harness();
    h.system_a.put(gala("E1", 100));

    let result = h.engine.trigger_sync().await.expect("batch");

    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.counts.created, 1);
    let link = h.ledger.link_for("E1").expect("link established");
    assert_eq!(link.internal_id, "I1");
    let record = h.system_b.record("I1").expect("created");
    assert_eq!(record.external_id.as_deref(), Some("E1"));
    assert_eq!(record.fields.get("name"), Some(&json!("Gala")));
    assert_eq!(record.fields.get("date"), Some(&json!("2025-06-01")));
    assert_eq!(record.fields.get("guests"), Some(&json!(100)));

    let ops = h.ledger.operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::Create);
    assert_eq!(ops[0].status, OperationStatus::Completed);
    assert_eq!(ops[0].target_id.as_deref(), Some("I1"));
    assert_eq!(ops[0].changes.len(), 3);
}

#[tokio::test]
async fn second_batch_over_synced_pair_is_a_noop() {
    let h = harness();
    linked_pair(&h, 100).await;

    let result = h.engine.trigger_sync().await.expect("batch");

    assert_eq!(result.counts.unchanged, 1);
    assert_eq!(h.system_b.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.system_a.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.ledger.operations().len(), 1);
}

#[tokio::test]
async fn divergent_edits_park_the_operation_without_writes() {
    let h = harness();
    let internal_id = linked_pair(&h, 100).await;
    h.system_a.set_field("E1", "guest_count", json!(120));
    h.system_b.set_field(&internal_id, "guests", json!(110));

    let result = h.engine.trigger_sync().await.expect("batch");

    assert_eq!(result.counts.conflicted, 1);
    let conflicts = h.ledger.list_conflicts(None).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].field, "guests");
    assert_eq!(conflicts[0].priority, ConflictPriority::High);
    assert_eq!(conflicts[0].status, ConflictStatus::Pending);
    assert_eq!(conflicts[0].external_value, json!(120));
    assert_eq!(conflicts[0].internal_value, json!(110));

    let op = h
        .ledger
        .get_operation(conflicts[0].operation_id.as_deref().expect("owned"))
        .unwrap()
        .expect("operation");
    assert_eq!(op.status, OperationStatus::Conflicted);
    assert_eq!(h.system_b.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.system_b.field(&internal_id, "guests"), Some(json!(110)));
    assert_eq!(h.system_a.field("E1", "guest_count"), Some(json!(120)));
}

#[tokio::test]
async fn conflict_blocks_the_clean_fields_of_the_same_record() {
    let h = harness();
    let internal_id = linked_pair(&h, 100).await;
    // One clean change on each side plus one field changed on both.
    h.system_a.set_field("E1", "event_name", json!("Summer Gala"));
    h.system_b.set_field(&internal_id, "date", json!("2025-06-02"));
    h.system_a.set_field("E1", "guest_count", json!(120));
    h.system_b.set_field(&internal_id, "guests", json!(110));

    let result = h.engine.trigger_sync().await.expect("batch");

    assert_eq!(result.counts.conflicted, 1);
    assert_eq!(h.ledger.list_conflicts(None).unwrap().len(), 1);
    assert_eq!(h.system_b.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.system_a.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.system_b.field(&internal_id, "name"), Some(json!("Gala")));
    assert_eq!(h.system_a.field("E1", "event_date"), Some(json!("2025-06-01")));
}

#[tokio::test]
async fn one_sided_edits_flow_both_ways() {
    let h = harness();
    let internal_id = linked_pair(&h, 100).await;
    h.system_a.set_field("E1", "event_name", json!("Summer Gala"));
    h.system_b.set_field(&internal_id, "notes", json!("vegan menu"));

    let result = h.engine.trigger_sync().await.expect("batch");

    assert_eq!(result.counts.updated, 1);
    assert_eq!(h.system_b.field(&internal_id, "name"), Some(json!("Summer Gala")));
    assert_eq!(h.system_a.field("E1", "notes"), Some(json!("vegan menu")));
    let op = h
        .ledger
        .list_operations(Some(OperationStatus::Completed), 1)
        .unwrap()
        .remove(0);
    assert_eq!(op.kind, OperationKind::Update);
    assert_eq!(op.direction, SyncDirection::Bidirectional);
    assert_eq!(
        op.changes,
        vec![
            FieldChange {
                field: "name".to_string(),
                target: SystemId::SystemB,
                old_value: Some(json!("Gala")),
                new_value: json!("Summer Gala"),
            },
            FieldChange {
                field: "notes".to_string(),
                target: SystemId::SystemA,
                old_value: None,
                new_value: json!("vegan menu"),
            },
        ]
    );

    let again = h.engine.trigger_sync().await.expect("batch");
    assert_eq!(again.counts.unchanged, 1);
}

#[tokio::test]
async fn one_way_direction_withholds_reverse_changes() {
    let h = harness_with(test_config().with_direction(SyncDirection::AToB));
    let internal_id = linked_pair(&h, 100).await;
    h.system_b.set_field(&internal_id, "notes", json!("local only"));

    let result = h.engine.trigger_sync().await.expect("batch");

    assert_eq!(result.counts.unchanged, 1);
    assert_eq!(h.system_a.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.system_a.field("E1", "notes"), None);
}

#[tokio::test]
async fn failing_record_exhausts_retry_budget_without_aborting_batch() {
    let h = harness();
    h.system_a.put(gala("E1", 100));
    h.system_a.put(gala("E2", 40));
    h.system_b
        .failing_creates
        .lock()
        .unwrap()
        .insert("E1".to_string());

    let result = h.engine.trigger_sync().await.expect("batch completes");

    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.counts.failed, 1);
    assert_eq!(result.counts.created, 1);
    // 3 attempts for E1, 1 for E2.
    assert_eq!(h.system_b.create_calls.load(Ordering::SeqCst), 4);

    let failed = h
        .ledger
        .list_operations(Some(OperationStatus::Failed), 10)
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].source_id, "E1");
    assert_eq!(failed[0].retry_count, 3);
    assert_eq!(failed[0].last_error_code.as_deref(), Some("connection"));
    assert!(h.ledger.link_for("E1").is_none());
    assert!(h.ledger.link_for("E2").is_some());
}

#[tokio::test]
async fn unreachable_source_aborts_the_batch() {
    let h = harness();
    *h.system_a.fail_list.lock().unwrap() = true;

    let err = h.engine.trigger_sync().await.unwrap_err();

    assert!(matches!(err, Error::Connection(_)));
    let run = h.ledger.last_batch_run().unwrap().expect("recorded");
    assert_eq!(run.status, BatchStatus::Failed);
    assert!(run.error.is_some());
}

#[tokio::test]
async fn concurrent_triggers_run_a_single_batch() {
    let h = harness();
    h.system_a.put(gala("E1", 100));
    *h.system_a.list_delay.lock().unwrap() = Some(Duration::from_millis(50));

    let (first, second) = tokio::join!(h.engine.trigger_sync(), h.engine.trigger_sync());
    let statuses = [first.expect("first").status, second.expect("second").status];

    assert!(statuses.contains(&BatchStatus::Completed));
    assert!(statuses.contains(&BatchStatus::Coalesced));
    assert_eq!(h.ledger.runs().len(), 1);
    assert_eq!(h.system_b.count(), 1);
}

#[tokio::test]
async fn parked_record_is_skipped_until_resolved() {
    let h = harness();
    let internal_id = linked_pair(&h, 100).await;
    h.system_a.set_field("E1", "guest_count", json!(120));
    h.system_b.set_field(&internal_id, "guests", json!(110));
    h.engine.trigger_sync().await.expect("conflicting batch");
    let operations_before = h.ledger.operations().len();

    let result = h.engine.trigger_sync().await.expect("batch");

    assert_eq!(result.counts.skipped, 1);
    assert_eq!(h.ledger.operations().len(), operations_before);
    assert_eq!(h.ledger.list_conflicts(None).unwrap().len(), 1);
}

#[tokio::test]
async fn orphaned_creation_is_adopted_instead_of_duplicated() {
    let h = harness();
    h.system_a.put(gala("E1", 100));
    h.system_b.put(
        InternalRecord::new("I-orphan", Utc::now())
            .with_external_id("E1")
            .with_field("name", json!("Gala"))
            .with_field("date", json!("2025-06-01"))
            .with_field("guests", json!(100)),
    );

    let result = h.engine.trigger_sync().await.expect("batch");

    assert_eq!(result.counts.created, 0);
    assert_eq!(result.counts.unchanged, 1);
    assert_eq!(h.system_b.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.ledger.link_for("E1").expect("adopted").internal_id,
        "I-orphan"
    );
}

#[tokio::test]
async fn links_stay_one_to_one_across_passes() {
    let h = harness();
    for (id, guests) in [("E1", 10), ("E2", 20), ("E3", 30)] {
        h.system_a.put(gala(id, guests));
    }
    h.engine.trigger_sync().await.expect("first");
    h.engine.trigger_sync().await.expect("second");

    let links = h.ledger.list_links().unwrap();
    assert_eq!(links.len(), 3);
    let internal: HashSet<_> = links.iter().map(|l| l.internal_id.clone()).collect();
    let external: HashSet<_> = links.iter().map(|l| l.external_id.clone()).collect();
    assert_eq!(internal.len(), 3);
    assert_eq!(external.len(), 3);

    let err = h
        .ledger
        .create_link("E4", &links[0].internal_id, FieldMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LinkIntegrity(_)));
}

#[tokio::test]
async fn cancelled_batch_skips_remaining_records() {
    let mut config = test_config();
    config.batch_concurrency = 1;
    let h = harness_with(config);
    for id in ["E1", "E2", "E3"] {
        h.system_a.put(gala(id, 10));
    }
    *h.system_b.create_delay.lock().unwrap() = Some(Duration::from_millis(50));

    let engine = Arc::clone(&h.engine);
    let batch = tokio::spawn(async move { engine.trigger_sync().await });
    while h.system_b.create_calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(h.engine.cancel_batch());
    let result = batch.await.expect("join").expect("batch");

    assert_eq!(result.status, BatchStatus::Cancelled);
    assert_eq!(result.counts.created, 1);
    assert_eq!(result.counts.skipped, 2);
    assert!(!h.engine.cancel_batch());
}

#[tokio::test]
async fn batch_rereads_records_synced_while_it_waited() {
    let mut config = test_config();
    config.batch_concurrency = 1;
    let h = harness_with(config);
    h.system_a.put(gala("E0", 50));
    h.system_a.put(gala("E1", 100));
    h.engine.trigger_sync().await.expect("initial batch");
    let internal_id = h.ledger.link_for("E1").expect("linked").internal_id;
    h.system_a.set_field("E1", "guest_count", json!(120));

    // Park the batch on E0 once it has read both systems.
    let held = h.engine.record_locks.lock(external_key("E0")).await;
    let lists_before = h.system_b.list_calls.load(Ordering::SeqCst);
    let engine = Arc::clone(&h.engine);
    let batch = tokio::spawn(async move { engine.trigger_sync().await });
    while h.system_b.list_calls.load(Ordering::SeqCst) == lists_before {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let hook = h
        .engine
        .handle_webhook(webhook("evt-10", SystemId::SystemA, WebhookEventType::Updated, "E1"))
        .await
        .expect("webhook");
    assert_eq!(hook.outcome, WebhookOutcome::Updated);
    assert_eq!(h.system_b.field(&internal_id, "guests"), Some(json!(120)));
    drop(held);

    let result = batch.await.expect("join").expect("batch");

    assert_eq!(result.counts.unchanged, 2);
    assert_eq!(result.counts.updated, 0);
    assert_eq!(h.system_a.field("E1", "guest_count"), Some(json!(120)));
    assert_eq!(h.system_b.field(&internal_id, "guests"), Some(json!(120)));
    assert_eq!(h.system_a.update_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn batch_emits_lifecycle_events() {
    let h = harness();
    let mut events = h.events.subscribe();
    h.system_a.put(gala("E1", 100));

    h.engine.trigger_sync().await.expect("batch");

    assert!(matches!(events.recv().await.unwrap(), SyncEvent::BatchStarted { .. }));
    assert!(matches!(
        events.recv().await.unwrap(),
        SyncEvent::OperationCompleted {
            kind: OperationKind::Create,
            ..
        }
    ));
    assert!(matches!(events.recv().await.unwrap(), SyncEvent::BatchCompleted { .. }));
}

// ---------------------------------------------------------------------------
// Conflict resolution
// ---------------------------------------------------------------------------

async fn conflicted_pair(h: &Harness) -> (String, DataConflict) {
    let internal_id = linked_pair(h, 100).await;
    h.system_a.set_field("E1", "guest_count", json!(120));
    h.system_b.set_field(&internal_id, "guests", json!(110));
    h.engine.trigger_sync().await.expect("batch");
    let conflict = h.ledger.list_conflicts(None).unwrap().remove(0);
    (internal_id, conflict)
}

#[tokio::test]
async fn source_wins_resolution_settles_the_pair() {
    let h = harness();
    let (internal_id, conflict) = conflicted_pair(&h).await;

    let patch = h
        .engine
        .resolve_conflict(&conflict.id, ResolutionPolicy::SourceWins)
        .await
        .expect("resolve");

    assert_eq!(patch.value, json!(120));
    assert_eq!(h.system_b.field(&internal_id, "guests"), Some(json!(120)));
    let stored = h.ledger.get_conflict(&conflict.id).unwrap().expect("stored");
    assert_eq!(stored.status, ConflictStatus::Resolved);
    let op = h
        .ledger
        .get_operation(stored.operation_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(op.status, OperationStatus::Completed);

    let result = h.engine.trigger_sync().await.expect("batch");
    assert_eq!(result.counts.unchanged, 1);
    assert_eq!(result.counts.conflicted, 0);
    assert_eq!(h.ledger.list_conflicts(None).unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_resolution_is_idempotent() {
    let h = harness();
    let (_, conflict) = conflicted_pair(&h).await;

    let first = h
        .engine
        .resolve_conflict(&conflict.id, ResolutionPolicy::SourceWins)
        .await
        .expect("first");
    let updates = h.system_b.update_calls.load(Ordering::SeqCst);
    let second = h
        .engine
        .resolve_conflict(&conflict.id, ResolutionPolicy::SourceWins)
        .await
        .expect("second");

    assert_eq!(first, second);
    assert_eq!(h.system_b.update_calls.load(Ordering::SeqCst), updates);

    let err = h
        .engine
        .resolve_conflict(&conflict.id, ResolutionPolicy::TargetWins)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn resolution_in_flight_is_rejected() {
    let h = harness();
    let (_, conflict) = conflicted_pair(&h).await;
    h.ledger.claim_conflict(&conflict.id).await.expect("claim");

    let err = h
        .engine
        .resolve_conflict(&conflict.id, ResolutionPolicy::SourceWins)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConflictInFlight { .. }));
}

#[tokio::test]
async fn invalid_custom_value_returns_conflict_to_pending() {
    let h = harness();
    let (internal_id, conflict) = conflicted_pair(&h).await;

    let err = h
        .engine
        .resolve_conflict(
            &conflict.id,
            ResolutionPolicy::Custom {
                value: json!("lots"),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    let stored = h.ledger.get_conflict(&conflict.id).unwrap().unwrap();
    assert_eq!(stored.status, ConflictStatus::Pending);
    assert_eq!(h.system_b.field(&internal_id, "guests"), Some(json!(110)));
}

#[tokio::test]
async fn custom_resolution_writes_both_sides() {
    let h = harness();
    let (internal_id, conflict) = conflicted_pair(&h).await;

    h.engine
        .resolve_conflict(&conflict.id, ResolutionPolicy::Custom { value: json!(115) })
        .await
        .expect("resolve");

    assert_eq!(h.system_b.field(&internal_id, "guests"), Some(json!(115)));
    assert_eq!(h.system_a.field("E1", "guest_count"), Some(json!(115)));
    let result = h.engine.trigger_sync().await.expect("batch");
    assert_eq!(result.counts.unchanged, 1);
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

fn webhook(event_id: &str, source: SystemId, event_type: WebhookEventType, record_id: &str) -> WebhookPayload {
    WebhookPayload::new(event_id, source, event_type, record_id)
}

#[tokio::test]
async fn replayed_webhook_is_applied_once() {
    let h = harness();
    h.system_a.put(gala("E1", 100));
    let payload = webhook("evt-1", SystemId::SystemA, WebhookEventType::Created, "E1");

    let first = h.engine.handle_webhook(payload.clone()).await.expect("first");
    let second = h.engine.handle_webhook(payload).await.expect("second");

    assert_eq!(first.outcome, WebhookOutcome::Created);
    assert_eq!(second.outcome, WebhookOutcome::Duplicate);
    assert_eq!(h.system_b.create_calls.load(Ordering::SeqCst), 1);
    let ops = h.ledger.operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].trigger, SyncTrigger::Webhook);
    assert_eq!(ops[0].idempotency_key.as_deref(), Some("system_a:evt-1"));
}

#[tokio::test]
async fn internal_update_webhook_pushes_to_system_a() {
    let h = harness();
    let internal_id = linked_pair(&h, 100).await;
    h.system_b.set_field(&internal_id, "location", json!("Harbor Hall"));

    let result = h
        .engine
        .handle_webhook(webhook("evt-7", SystemId::SystemB, WebhookEventType::Updated, &internal_id))
        .await
        .expect("handled");

    assert_eq!(result.outcome, WebhookOutcome::Updated);
    assert_eq!(h.system_a.field("E1", "venue"), Some(json!("Harbor Hall")));
    let op = h
        .ledger
        .get_operation(result.operation_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(op.source_system, SystemId::SystemB);
    assert_eq!(op.source_id, internal_id);
    assert_eq!(op.target_id.as_deref(), Some("E1"));
}

#[tokio::test]
async fn contract_signed_reconciles_like_an_update() {
    let h = harness();
    let internal_id = linked_pair(&h, 100).await;
    h.system_a.set_field("E1", "stage", json!("Contracted"));

    let result = h
        .engine
        .handle_webhook(webhook("evt-9", SystemId::SystemA, WebhookEventType::ContractSigned, "E1"))
        .await
        .expect("handled");

    assert_eq!(result.outcome, WebhookOutcome::Updated);
    assert_eq!(h.system_b.field(&internal_id, "status"), Some(json!("contracted")));
}

#[tokio::test]
async fn external_delete_removes_record_and_link() {
    let h = harness();
    let internal_id = linked_pair(&h, 100).await;

    let result = h
        .engine
        .handle_webhook(webhook("evt-2", SystemId::SystemA, WebhookEventType::Deleted, "E1"))
        .await
        .expect("handled");

    assert_eq!(result.outcome, WebhookOutcome::Deleted);
    assert!(h.system_b.record(&internal_id).is_none());
    assert!(h.ledger.link_for("E1").is_none());
    let op = h
        .ledger
        .get_operation(result.operation_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(op.kind, OperationKind::Delete);
    assert_eq!(op.status, OperationStatus::Completed);
}

#[tokio::test]
async fn internal_delete_only_unlinks() {
    let h = harness();
    let internal_id = linked_pair(&h, 100).await;

    let result = h
        .engine
        .handle_webhook(webhook("evt-3", SystemId::SystemB, WebhookEventType::Deleted, &internal_id))
        .await
        .expect("handled");

    assert_eq!(result.outcome, WebhookOutcome::Deleted);
    assert!(h.ledger.link_for("E1").is_none());
    assert_eq!(h.system_b.delete_calls.load(Ordering::SeqCst), 0);
    assert!(h.system_a.field("E1", "event_name").is_some());
}

#[tokio::test]
async fn failed_webhook_is_recorded_and_can_be_redelivered() {
    let h = harness();
    let payload = webhook("evt-4", SystemId::SystemA, WebhookEventType::Updated, "E404");

    let err = h.engine.handle_webhook(payload.clone()).await.unwrap_err();

    assert!(matches!(err, Error::NotFound(_)));
    let failed = h
        .ledger
        .list_operations(Some(OperationStatus::Failed), 10)
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].idempotency_key.as_deref(), Some("system_a:evt-4"));
    assert!(!h
        .ledger
        .is_webhook_processed(SystemId::SystemA, "evt-4")
        .unwrap());

    h.system_a.put(gala("E404", 5));
    let retried = h.engine.handle_webhook(payload).await.expect("redelivery");
    assert_eq!(retried.outcome, WebhookOutcome::Created);
}

#[tokio::test]
async fn unlinked_internal_record_without_origin_is_skipped() {
    let h = harness();
    h.system_b.put(InternalRecord::new("I-local", Utc::now()).with_field("name", json!("Staff party")));

    let result = h
        .engine
        .handle_webhook(webhook("evt-5", SystemId::SystemB, WebhookEventType::Created, "I-local"))
        .await
        .expect("handled");

    assert_eq!(result.outcome, WebhookOutcome::Skipped);
    assert!(h.ledger.operations().is_empty());
}

#[tokio::test]
async fn webhook_and_batch_on_same_record_do_not_duplicate() {
    let h = harness();
    h.system_a.put(gala("E1", 100));
    *h.system_b.create_delay.lock().unwrap() = Some(Duration::from_millis(20));

    let (batch, hook) = tokio::join!(
        h.engine.trigger_sync(),
        h.engine.handle_webhook(webhook("evt-6", SystemId::SystemA, WebhookEventType::Created, "E1"))
    );
    batch.expect("batch");
    hook.expect("webhook");

    assert_eq!(h.system_b.count(), 1);
    assert_eq!(h.ledger.list_links().unwrap().len(), 1);
}

#[tokio::test]
async fn queued_and_streamed_webhooks_are_processed_by_the_worker() {
    let h = harness();
    h.system_a.put(gala("E1", 100));
    h.system_a.put(gala("E2", 50));
    h.engine.start().await;

    h.engine
        .enqueue_webhook(webhook("evt-q", SystemId::SystemA, WebhookEventType::Created, "E1"))
        .expect("enqueue");
    let (tx, rx) = mpsc::channel(4);
    h.engine
        .spawn_stream_listener(ChannelEventStream::new(rx))
        .await;
    tx.send(webhook("evt-s", SystemId::SystemA, WebhookEventType::Created, "E2"))
        .await
        .expect("send");

    for _ in 0..200 {
        if h.ledger.list_links().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.ledger.list_links().unwrap().len(), 2);
    h.engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scheduling, configuration and status
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scheduler_runs_batches_on_the_interval_and_stops_on_shutdown() {
    let h = harness_with(test_config().with_auto_sync(60));
    h.system_a.put(gala("E1", 100));
    h.engine.start().await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    let runs = h.ledger.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger, SyncTrigger::Scheduled);
    assert!(h.engine.status().await.expect("status").next_sync_at.is_some());

    h.engine.shutdown().await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.ledger.runs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_the_record_being_applied() {
    let h = harness();
    h.system_a.put(gala("E1", 100));
    // Longer than any grace period, shorter than the request timeout.
    *h.system_b.create_delay.lock().unwrap() = Some(Duration::from_secs(20));
    h.engine.start().await;
    h.engine
        .enqueue_webhook(webhook("evt-slow", SystemId::SystemA, WebhookEventType::Created, "E1"))
        .expect("enqueue");
    while h.system_b.create_calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    h.engine.shutdown().await;

    let ops = h.ledger.operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OperationStatus::Completed);
    assert!(h.ledger.link_for("E1").is_some());
}

#[tokio::test]
async fn stopped_engine_rejects_new_work() {
    let h = harness();
    h.system_a.put(gala("E1", 100));
    h.engine.start().await;
    h.engine.shutdown().await;

    let err = h.engine.trigger_sync().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    let err = h
        .engine
        .enqueue_webhook(webhook("evt-late", SystemId::SystemA, WebhookEventType::Created, "E1"))
        .unwrap_err();
    assert_eq!(err.kind().as_str(), "cancelled");
    assert!(h.ledger.runs().is_empty());
    assert_eq!(h.system_b.count(), 0);
}

#[tokio::test]
async fn reconfigure_validates_and_persists() {
    let h = harness();

    let invalid = test_config().with_max_retries(0);
    assert!(matches!(
        h.engine.reconfigure(invalid).await.unwrap_err(),
        Error::Configuration(_)
    ));

    let mut other_org = test_config();
    other_org.organization_id = "org-2".to_string();
    assert!(h.engine.reconfigure(other_org).await.is_err());

    let updated = test_config().with_direction(SyncDirection::BToA);
    h.engine.reconfigure(updated.clone()).await.expect("reconfigure");
    assert_eq!(h.engine.config().await.direction, SyncDirection::BToA);
    assert_eq!(h.ledger.load_configuration().unwrap(), Some(updated));
}

#[tokio::test]
async fn status_aggregates_ledger_and_probes() {
    let h = harness();
    let internal_id = linked_pair(&h, 100).await;
    h.system_a.set_field("E1", "guest_count", json!(120));
    h.system_b.set_field(&internal_id, "guests", json!(110));
    h.engine.trigger_sync().await.expect("batch");
    *h.system_a.offline.lock().unwrap() = true;

    let status = h.engine.status().await.expect("status");

    assert!(!status.system_a.connected);
    assert!(status.system_a.error.is_some());
    assert!(status.system_b.connected);
    assert_eq!(status.conflicted_operations, 1);
    assert_eq!(status.unresolved_conflicts, 1);
    assert_eq!(status.failed_operations, 0);
    assert_eq!(status.last_sync_status, Some(BatchStatus::Completed));
    assert!(status.last_sync_at.is_some());
    assert!(status.next_sync_at.is_none());
    assert!(!status.batch_in_progress);
    assert!(!status.is_healthy());
}
