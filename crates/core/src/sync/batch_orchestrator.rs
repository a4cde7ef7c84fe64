//! Full reconciliation passes over a filtered set of records.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};

use super::record_locks::external_key;
use super::record_pipeline::{Counterpart, PassContext, RecordOutcome, RecordResult};
use super::sync_engine::SyncEngine;
use super::sync_events::SyncEvent;
use super::sync_retry::retry_transient;
use crate::config::SystemId;
use crate::errors::{Error, Result};
use crate::ledger::{BatchCounts, BatchStatus, BatchSyncResult, RecordLink, SyncTrigger};
use crate::records::{EventFilter, ExternalRecord, InternalRecord, InternalRecordFilter};

/// Everything a batch read before taking any record lock.
struct BatchInputs {
    externals: Vec<ExternalRecord>,
    /// System B counterparts keyed by the external id they belong to.
    counterparts: HashMap<String, InternalRecord>,
    /// Links as they stood before System A was listed, keyed by external id.
    links: HashMap<String, RecordLink>,
}

/// Outcome of one record within a batch.
enum BatchItem {
    Done(RecordOutcome),
    Failed,
    Cancelled,
}

impl SyncEngine {
    /// Runs a manual batch over the configured default filter.
    ///
    /// Returns immediately with status `coalesced` if a batch is already running.
    pub async fn trigger_sync(&self) -> Result<BatchSyncResult> {
        self.run_batch(SyncTrigger::Manual, None).await
    }

    /// Runs a manual batch restricted to `filter`.
    pub async fn trigger_sync_with_filter(&self, filter: EventFilter) -> Result<BatchSyncResult> {
        self.run_batch(SyncTrigger::Manual, Some(filter)).await
    }

    /// Requests cooperative cancellation of the running batch. Records already
    /// being applied finish; the rest are skipped. Returns whether a batch was running.
    pub fn cancel_batch(&self) -> bool {
        if !self.is_batch_running() {
            return false;
        }
        info!("[EventSync] Cancellation requested for the running batch");
        self.cancel_requested.store(true, Ordering::SeqCst);
        true
    }

    pub(crate) async fn run_batch(
        &self,
        trigger: SyncTrigger,
        filter: Option<EventFilter>,
    ) -> Result<BatchSyncResult> {
        if self.is_shutting_down() {
            return Err(Error::Cancelled);
        }
        let Ok(_batch_guard) = self.batch_mutex.try_lock() else {
            debug!("[EventSync] Batch already running, coalescing {:?} trigger", trigger);
            return Ok(BatchSyncResult::coalesced());
        };
        self.cancel_requested.store(false, Ordering::SeqCst);
        let started = Instant::now();

        let config = self.config().await;
        let filter = filter.unwrap_or_else(|| config.default_filter.clone());
        let run = self.ledger.start_batch_run(trigger).await?;
        let mut ctx = PassContext::new(config, trigger, SystemId::SystemA);
        ctx.batch_id = Some(run.id.clone());
        info!("[EventSync] Batch {} started ({:?})", run.id, trigger);
        self.event_sink.emit(SyncEvent::BatchStarted {
            batch_id: run.id.clone(),
            trigger,
        });

        let inputs = match self.fetch_batch_inputs(&ctx, &filter).await {
            Ok(inputs) => inputs,
            Err(err) => {
                error!("[EventSync] Batch {} aborted before reconciling: {}", run.id, err);
                let message = err.to_string();
                if let Err(ledger_err) = self
                    .ledger
                    .finish_batch_run(&run.id, BatchStatus::Failed, BatchCounts::default(), Some(message.clone()))
                    .await
                {
                    error!("[EventSync] Could not record batch failure: {}", ledger_err);
                }
                self.event_sink.emit(SyncEvent::BatchCompleted {
                    result: BatchSyncResult {
                        batch_id: Some(run.id.clone()),
                        status: BatchStatus::Failed,
                        counts: BatchCounts::default(),
                        error: Some(message),
                        duration_ms: started.elapsed().as_millis() as i64,
                    },
                });
                return Err(err);
            }
        };
        debug!(
            "[EventSync] Batch {} reconciling {} external records",
            run.id,
            inputs.externals.len()
        );

        let concurrency = ctx.config.batch_concurrency.max(1);
        let records: Vec<BoxFuture<'_, BatchItem>> = inputs
            .externals
            .iter()
            .map(|ext| self.process_batch_record(&ctx, ext, &inputs).boxed())
            .collect();
        let items: Vec<BatchItem> = stream::iter(records)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut counts = BatchCounts::default();
        for item in &items {
            match item {
                BatchItem::Done(RecordOutcome::Created) => counts.created += 1,
                BatchItem::Done(RecordOutcome::Updated | RecordOutcome::Deleted) => {
                    counts.updated += 1
                }
                BatchItem::Done(RecordOutcome::Unchanged) => counts.unchanged += 1,
                BatchItem::Done(RecordOutcome::Conflicted) => counts.conflicted += 1,
                BatchItem::Done(RecordOutcome::Skipped) | BatchItem::Cancelled => {
                    counts.skipped += 1
                }
                BatchItem::Failed => counts.failed += 1,
            }
        }
        let cancelled = items.iter().any(|item| matches!(item, BatchItem::Cancelled));
        let status = if cancelled {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };

        let run = self
            .ledger
            .finish_batch_run(&run.id, status, counts, None)
            .await?;
        let result = BatchSyncResult {
            batch_id: Some(run.id),
            status,
            counts,
            error: None,
            duration_ms: started.elapsed().as_millis() as i64,
        };
        info!(
            "[EventSync] Batch {} {}: created={} updated={} unchanged={} conflicted={} failed={} skipped={} in {}ms",
            result.batch_id.as_deref().unwrap_or_default(),
            status.as_str(),
            counts.created,
            counts.updated,
            counts.unchanged,
            counts.conflicted,
            counts.failed,
            counts.skipped,
            result.duration_ms
        );
        self.event_sink.emit(SyncEvent::BatchCompleted {
            result: result.clone(),
        });
        Ok(result)
    }

    /// Fetches the external records and their System B counterparts: linked
    /// records by id, unlinked ones by back reference.
    async fn fetch_batch_inputs(&self, ctx: &PassContext, filter: &EventFilter) -> Result<BatchInputs> {
        // Snapshot links first so any record touched after this point is detectable.
        let links: HashMap<String, RecordLink> = self
            .ledger
            .list_links()?
            .into_iter()
            .map(|link| (link.external_id.clone(), link))
            .collect();

        let external_client = &self.external;
        let externals = retry_transient(ctx.retry, "list System A events", move || {
            external_client.list_events(filter)
        })
        .await
        .result?;

        let mut linked_ids = Vec::new();
        let mut unlinked_ids = Vec::new();
        for ext in &externals {
            match links.get(&ext.id) {
                Some(link) => linked_ids.push(link.internal_id.clone()),
                None => unlinked_ids.push(ext.id.clone()),
            }
        }
        let owners: HashMap<&str, &str> = links
            .values()
            .map(|link| (link.internal_id.as_str(), link.external_id.as_str()))
            .collect();

        let mut counterparts = HashMap::new();
        let internal_client = &self.internal;
        if !linked_ids.is_empty() {
            let by_id = InternalRecordFilter::by_ids(linked_ids);
            let by_id = &by_id;
            let linked = retry_transient(ctx.retry, "list linked System B records", move || {
                internal_client.list_records(by_id)
            })
            .await
            .result?;
            for record in linked {
                if let Some(external_id) = owners.get(record.id.as_str()) {
                    counterparts.insert(external_id.to_string(), record);
                }
            }
        }
        if !unlinked_ids.is_empty() && ctx.direction().allows_to_internal() {
            let by_ref = InternalRecordFilter::by_external_ids(unlinked_ids);
            let by_ref = &by_ref;
            let orphans = retry_transient(ctx.retry, "search System B back references", move || {
                internal_client.list_records(by_ref)
            })
            .await
            .result?;
            for record in orphans {
                if let Some(external_id) = record.external_id.clone() {
                    counterparts.entry(external_id).or_insert(record);
                }
            }
        }
        Ok(BatchInputs {
            externals,
            counterparts,
            links,
        })
    }

    async fn process_batch_record(
        &self,
        ctx: &PassContext,
        ext: &ExternalRecord,
        inputs: &BatchInputs,
    ) -> BatchItem {
        if self.stop_requested() {
            return BatchItem::Cancelled;
        }
        let _guard = self.record_locks.lock(external_key(&ext.id)).await;
        // Re-check after waiting on the lock.
        if self.stop_requested() {
            return BatchItem::Cancelled;
        }
        let reconciled = match self.ledger.find_link_by_external(&ext.id) {
            Ok(current) if current.as_ref() == inputs.links.get(&ext.id) => {
                let counterpart = Counterpart::Known(inputs.counterparts.get(&ext.id).cloned());
                self.reconcile_external(ctx, ext, counterpart).await
            }
            Ok(_) => self.reconcile_reread(ctx, &ext.id).await,
            Err(err) => Err(err),
        };
        match reconciled {
            Ok(result) => BatchItem::Done(result.outcome),
            Err(err) => {
                if matches!(err, Error::Database(_)) {
                    warn!("[EventSync] Ledger error while reconciling {}: {}", ext.id, err);
                }
                BatchItem::Failed
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst) || self.is_shutting_down()
    }

    /// Reconciles a record whose link moved after the batch read it. Both
    /// sides are fetched again so a concurrent write is never reverted.
    async fn reconcile_reread(&self, ctx: &PassContext, external_id: &str) -> Result<RecordResult> {
        debug!(
            "[EventSync] {} was synced while the batch waited, re-reading both systems",
            external_id
        );
        let client = &self.external;
        let fetched = retry_transient(ctx.retry, "fetch System A event", move || {
            client.get_event(external_id)
        })
        .await
        .result;
        match fetched {
            Ok(ext) => self.reconcile_external(ctx, &ext, Counterpart::Lookup).await,
            Err(Error::NotFound(_)) => {
                debug!("[EventSync] {} disappeared from System A, skipping", external_id);
                Ok(RecordResult::skipped())
            }
            Err(err) => {
                warn!("[EventSync] Could not re-read {}: {}", external_id, err);
                Err(err)
            }
        }
    }
}
