//! The sync engine: one value per organization, owning its background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use super::record_locks::{external_key, RecordLocks};
use super::sync_events::{NoOpSyncEventSink, SyncEvent, SyncEventSink};
use super::sync_retry::{retry_transient, RetryPolicy};
use super::webhook_queue::{SyncEventStream, WebhookQueue, WebhookQueueReceiver};
use crate::config::SyncConfiguration;
use crate::conflicts::{
    ConflictClaim, ConflictDetector, ConflictResolver, DataConflict, ResolutionPolicy,
    ResolvedPatch,
};
use crate::errors::{Error, Result};
use crate::health::{HealthReporter, SyncStatus};
use crate::ledger::SyncLedgerTrait;
use crate::mapping::RecordMapper;
use crate::records::{
    ExternalEventClientTrait, ExternalRecordPatch, FieldMap, InternalRecordClientTrait,
    InternalRecordPatch,
};

const LISTENER_GRACE: Duration = Duration::from_secs(5);

/// Handles of the tasks started by [`SyncEngine::start`].
#[derive(Default)]
struct BackgroundTasks {
    scheduler: Option<JoinHandle<()>>,
    webhook_worker: Option<JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
}

/// Reconciles one organization's records between System A and System B.
///
/// Collaborators are injected; several engines may share one ledger database
/// as long as each is bound to its own organization.
pub struct SyncEngine {
    pub(super) external: Arc<dyn ExternalEventClientTrait>,
    pub(super) internal: Arc<dyn InternalRecordClientTrait>,
    pub(super) ledger: Arc<dyn SyncLedgerTrait>,
    pub(super) mapper: RecordMapper,
    pub(super) detector: ConflictDetector,
    resolver: ConflictResolver,
    config: RwLock<SyncConfiguration>,
    pub(super) event_sink: Arc<dyn SyncEventSink>,
    pub(super) record_locks: Arc<RecordLocks>,
    /// Held for the whole of a batch pass.
    pub(super) batch_mutex: Mutex<()>,
    pub(super) cancel_requested: AtomicBool,
    pub(super) reconfigured: Notify,
    pub(super) next_run_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    webhook_queue: WebhookQueue,
    webhook_receiver: Mutex<Option<WebhookQueueReceiver>>,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<BackgroundTasks>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfiguration,
        external: Arc<dyn ExternalEventClientTrait>,
        internal: Arc<dyn InternalRecordClientTrait>,
        ledger: Arc<dyn SyncLedgerTrait>,
    ) -> Result<Self> {
        config.validate()?;
        let mapper = RecordMapper::default();
        let (webhook_queue, webhook_receiver) =
            WebhookQueue::bounded(config.webhook_queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            external,
            internal,
            ledger,
            detector: ConflictDetector::new(mapper.clone()),
            resolver: ConflictResolver::new(mapper.clone()),
            mapper,
            config: RwLock::new(config),
            event_sink: Arc::new(NoOpSyncEventSink),
            record_locks: RecordLocks::new(),
            batch_mutex: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
            reconfigured: Notify::new(),
            next_run_at: std::sync::Mutex::new(None),
            webhook_queue,
            webhook_receiver: Mutex::new(Some(webhook_receiver)),
            shutdown_tx,
            background: Mutex::new(BackgroundTasks::default()),
        })
    }

    /// Replaces the comparison table used by mapping, detection and resolution.
    pub fn with_mapper(mut self, mapper: RecordMapper) -> Self {
        self.detector = ConflictDetector::new(mapper.clone());
        self.resolver = ConflictResolver::new(mapper.clone());
        self.mapper = mapper;
        self
    }

    pub fn with_event_sink(mut self, event_sink: Arc<dyn SyncEventSink>) -> Self {
        self.event_sink = event_sink;
        self
    }

    /// Snapshot of the live configuration.
    pub async fn config(&self) -> SyncConfiguration {
        self.config.read().await.clone()
    }

    /// Validates, persists and swaps in a new configuration. The organization
    /// cannot change; the scheduler adopts the new interval immediately.
    pub async fn reconfigure(&self, new_config: SyncConfiguration) -> Result<SyncConfiguration> {
        new_config.validate()?;
        let mut current = self.config.write().await;
        if current.organization_id != new_config.organization_id {
            return Err(Error::configuration(format!(
                "Engine is bound to organization '{}', got '{}'",
                current.organization_id, new_config.organization_id
            )));
        }
        self.ledger.save_configuration(&new_config).await?;
        info!(
            "[EventSync] Reconfigured organization {}: direction={} auto_sync={} interval={}s",
            new_config.organization_id,
            new_config.direction,
            new_config.auto_sync_enabled,
            new_config.sync_interval_secs
        );
        *current = new_config.clone();
        drop(current);
        self.reconfigured.notify_one();
        Ok(new_config)
    }

    /// Enqueues a payload for asynchronous handling. Rejected with
    /// `Error::Cancelled` once the engine is shutting down.
    pub fn enqueue_webhook(&self, payload: super::WebhookPayload) -> Result<()> {
        payload.validate()?;
        if self.is_shutting_down() {
            return Err(Error::Cancelled);
        }
        self.webhook_queue.enqueue(payload)
    }

    pub fn is_batch_running(&self) -> bool {
        self.batch_mutex.try_lock().is_err()
    }

    /// Read-only health snapshot, recomputed on every call.
    pub async fn status(&self) -> Result<SyncStatus> {
        let config = self.config().await;
        let next_run_at = self
            .next_run_at
            .lock()
            .map(|next| *next)
            .unwrap_or(None);
        HealthReporter::new(
            Arc::clone(&self.external),
            Arc::clone(&self.internal),
            Arc::clone(&self.ledger),
        )
        .status(&config, self.is_batch_running(), next_run_at)
        .await
    }

    /// Settles one conflict with `policy` and writes the outcome to the affected systems.
    ///
    /// Re-resolving a settled conflict with the same policy returns the stored
    /// patch; a different policy is rejected. A conflict being resolved
    /// concurrently yields `Error::ConflictInFlight`.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        policy: ResolutionPolicy,
    ) -> Result<ResolvedPatch> {
        let conflict = match self.ledger.claim_conflict(conflict_id).await? {
            ConflictClaim::Claimed(conflict) => conflict,
            ConflictClaim::AlreadyResolved(conflict) => {
                return Self::previous_resolution(conflict, &policy)
            }
        };

        let _guard = self.record_locks.lock(external_key(&conflict.external_id)).await;
        let config = self.config().await;
        match self.apply_resolution(&conflict, &policy, &config).await {
            Ok(patch) => {
                let settlement = self
                    .ledger
                    .resolve_conflict(&conflict.id, patch.clone())
                    .await?;
                info!(
                    "[EventSync] Resolved conflict {} on {}.{} with {}",
                    conflict.id,
                    conflict.external_id,
                    conflict.field,
                    policy.name()
                );
                self.event_sink.emit(SyncEvent::ConflictResolved {
                    conflict_id: conflict.id.clone(),
                    policy: policy.name().to_string(),
                });
                if let Some(operation) = settlement.completed_operation {
                    self.event_sink.emit(SyncEvent::OperationCompleted {
                        operation_id: operation.id,
                        kind: operation.kind,
                        source_id: operation.source_id,
                        target_id: operation.target_id,
                    });
                }
                Ok(patch)
            }
            Err(err) => {
                warn!(
                    "[EventSync] Resolution of conflict {} failed, returning it to pending: {}",
                    conflict.id, err
                );
                if let Err(release_err) = self.ledger.release_conflict(&conflict.id).await {
                    warn!(
                        "[EventSync] Failed to release conflict {}: {}",
                        conflict.id, release_err
                    );
                }
                Err(err)
            }
        }
    }

    fn previous_resolution(
        conflict: DataConflict,
        policy: &ResolutionPolicy,
    ) -> Result<ResolvedPatch> {
        match conflict.resolution {
            Some(patch) if &patch.policy == policy => {
                debug!(
                    "[EventSync] Conflict {} already resolved with {}",
                    conflict.id,
                    policy.name()
                );
                Ok(patch)
            }
            Some(patch) => Err(Error::validation(format!(
                "Conflict {} was already resolved with {}",
                conflict.id,
                patch.policy.name()
            ))),
            None => Err(Error::validation(format!(
                "Conflict {} is resolved but has no stored resolution",
                conflict.id
            ))),
        }
    }

    async fn apply_resolution(
        &self,
        conflict: &DataConflict,
        policy: &ResolutionPolicy,
        config: &SyncConfiguration,
    ) -> Result<ResolvedPatch> {
        let patch = self.resolver.resolve(conflict, policy, config)?;
        let retry = RetryPolicy::from_config(config);

        if patch.write_internal {
            let mut fields = FieldMap::new();
            fields.insert(patch.field.clone(), patch.value.clone());
            let update = InternalRecordPatch {
                external_id: None,
                fields,
            };
            let client = &self.internal;
            let id = conflict.internal_id.as_str();
            let update = &update;
            retry_transient(retry, "update System B record", move || {
                client.update_record(id, update)
            })
            .await
            .result?;
        }
        if patch.write_external {
            let mut fields = FieldMap::new();
            fields.insert(patch.external_field.clone(), patch.value.clone());
            let update = ExternalRecordPatch { fields };
            let client = &self.external;
            let id = conflict.external_id.as_str();
            let update = &update;
            retry_transient(retry, "update System A event", move || {
                client.update_event(id, update)
            })
            .await
            .result?;
        }
        Ok(patch)
    }

    /// Starts the webhook worker and the batch scheduler. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.background.lock().await;
        if tasks.webhook_worker.as_ref().map_or(true, |h| h.is_finished()) {
            if let Some(receiver) = self.webhook_receiver.lock().await.take() {
                tasks.webhook_worker = Some(self.spawn_webhook_worker(receiver));
            }
        }
        if tasks.scheduler.as_ref().map_or(true, |h| h.is_finished()) {
            tasks.scheduler = Some(self.spawn_scheduler());
        }
    }

    /// Feeds a push transport into the webhook queue until it ends or the engine stops.
    pub async fn spawn_stream_listener<S>(self: &Arc<Self>, mut stream: S)
    where
        S: SyncEventStream + 'static,
    {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = shutdown.changed() => break,
                    next = stream.next_payload() => match next {
                        Some(payload) => payload,
                        None => {
                            info!("[EventSync] Push stream ended");
                            break;
                        }
                    },
                };
                if let Err(err) = engine.enqueue_webhook(payload) {
                    warn!("[EventSync] Dropping pushed event: {}", err);
                }
            }
        });
        let mut tasks = self.background.lock().await;
        tasks.listeners.retain(|h| !h.is_finished());
        tasks.listeners.push(handle);
    }

    fn spawn_webhook_worker(self: &Arc<Self>, mut receiver: WebhookQueueReceiver) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    next = receiver.recv() => match next {
                        Some(payload) => payload,
                        None => break,
                    },
                };
                let event_id = payload.event_id.clone();
                if let Err(err) = engine.handle_webhook(payload).await {
                    warn!("[Webhook] Queued event {} failed: {}", event_id, err);
                }
            }
            debug!("[Webhook] Worker stopped");
        })
    }

    pub(super) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stops every background task.
    ///
    /// The webhook worker and the scheduler stop between records, so this waits
    /// for the record each of them is applying. Push listeners only forward
    /// into the queue and are aborted if they linger.
    pub async fn shutdown(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
        let mut tasks = self.background.lock().await;
        for mut handle in tasks.listeners.drain(..) {
            if tokio::time::timeout(LISTENER_GRACE, &mut handle).await.is_err() {
                warn!("[EventSync] Push listener did not stop in time, aborting");
                handle.abort();
            }
        }
        let workers = [tasks.webhook_worker.take(), tasks.scheduler.take()];
        for handle in workers.into_iter().flatten() {
            if let Err(err) = handle.await {
                warn!("[EventSync] Background task ended abnormally: {}", err);
            }
        }
        info!("[EventSync] Engine stopped");
    }
}
