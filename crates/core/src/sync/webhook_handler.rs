//! Single-record reconciliation triggered by push notifications.
//!
//! Delivery is at-least-once, so every payload is deduplicated by
//! `(source_system, event_id)`. The handler never retries a failed payload
//! itself; the error goes back to the transport.

use log::{debug, info, warn};

use super::record_locks::{external_key, internal_key};
use super::record_pipeline::{Counterpart, PassContext, RecordOutcome, RecordResult};
use super::sync_engine::SyncEngine;
use super::sync_events::SyncEvent;
use super::sync_retry::retry_transient;
use super::webhook_model::{WebhookEventType, WebhookOutcome, WebhookPayload, WebhookResult};
use crate::config::{SyncDirection, SystemId};
use crate::errors::{Error, Result};
use crate::ledger::{OperationKind, OperationOutcome, SyncTrigger};
use crate::records::{ExternalRecord, InternalRecord};

impl SyncEngine {
    /// Handles one notification inline and returns how it ended.
    pub async fn handle_webhook(&self, payload: WebhookPayload) -> Result<WebhookResult> {
        payload.validate()?;
        self.check_changed_fields(&payload);

        let source = payload.source_system;
        if self.ledger.is_webhook_processed(source, &payload.event_id)? {
            debug!(
                "[Webhook] {} already processed, ignoring redelivery",
                payload.idempotency_key()
            );
            return Ok(WebhookResult {
                outcome: WebhookOutcome::Duplicate,
                operation_id: None,
            });
        }

        let config = self.config().await;
        let mut ctx = PassContext::new(config, SyncTrigger::Webhook, source);
        ctx.idempotency_key = Some(payload.idempotency_key());

        let (lock_key, prefetched) = self.webhook_lock_key(&ctx, &payload).await?;
        let _guard = self.record_locks.lock(lock_key).await;
        // A concurrent delivery of the same event may have finished while we waited.
        if self.ledger.is_webhook_processed(source, &payload.event_id)? {
            return Ok(WebhookResult {
                outcome: WebhookOutcome::Duplicate,
                operation_id: None,
            });
        }

        if payload.event_type == WebhookEventType::ContractSigned {
            info!(
                "[Webhook] Contract signed for {} record {}",
                source, payload.record_id
            );
        }
        let result = match (source, payload.event_type) {
            (_, WebhookEventType::Deleted) => self.apply_delete(&ctx, &payload).await,
            (SystemId::SystemA, _) => self.sync_from_external(&ctx, &payload.record_id).await,
            (SystemId::SystemB, _) => {
                self.sync_from_internal(&ctx, &payload.record_id, prefetched)
                    .await
            }
        };

        match result {
            Ok(record) => {
                self.ledger
                    .mark_webhook_processed(source, &payload.event_id, record.operation_id.clone())
                    .await?;
                let outcome = webhook_outcome(record.outcome);
                info!(
                    "[Webhook] {} {} for record {}: {}",
                    payload.idempotency_key(),
                    payload.event_type.as_str(),
                    payload.record_id,
                    outcome.as_str()
                );
                self.event_sink.emit(SyncEvent::WebhookProcessed {
                    source,
                    event_id: payload.event_id.clone(),
                    outcome: outcome.as_str().to_string(),
                });
                Ok(WebhookResult {
                    outcome,
                    operation_id: record.operation_id,
                })
            }
            Err(err) => {
                warn!(
                    "[Webhook] {} {} for record {} failed: {}",
                    payload.idempotency_key(),
                    payload.event_type.as_str(),
                    payload.record_id,
                    err
                );
                Err(err)
            }
        }
    }

    fn check_changed_fields(&self, payload: &WebhookPayload) {
        let Some(fields) = payload.changed_fields.as_ref() else {
            return;
        };
        let table = self.mapper.table();
        let unknown: Vec<&str> = fields
            .iter()
            .map(String::as_str)
            .filter(|name| {
                !table.iter().any(|m| match payload.source_system {
                    SystemId::SystemA => m.external == *name,
                    SystemId::SystemB => m.internal == *name,
                })
            })
            .collect();
        if !unknown.is_empty() {
            debug!(
                "[Webhook] {} names untracked fields {:?}; reconciling the full table",
                payload.idempotency_key(),
                unknown
            );
        }
    }

    /// Lock key for the pair the payload touches. System B records without a
    /// link are fetched first so a back reference locks the external id.
    async fn webhook_lock_key(
        &self,
        ctx: &PassContext,
        payload: &WebhookPayload,
    ) -> Result<(String, Option<InternalRecord>)> {
        match payload.source_system {
            SystemId::SystemA => Ok((external_key(&payload.record_id), None)),
            SystemId::SystemB => {
                if let Some(link) = self.ledger.find_link_by_internal(&payload.record_id)? {
                    return Ok((external_key(&link.external_id), None));
                }
                if payload.event_type == WebhookEventType::Deleted {
                    return Ok((internal_key(&payload.record_id), None));
                }
                let record = self.fetch_internal(ctx, &payload.record_id).await?;
                let key = match record.external_id.as_deref() {
                    Some(external_id) => external_key(external_id),
                    None => internal_key(&record.id),
                };
                Ok((key, Some(record)))
            }
        }
    }

    async fn sync_from_external(&self, ctx: &PassContext, external_id: &str) -> Result<RecordResult> {
        let ext = self.fetch_external(ctx, external_id, None).await?;
        self.reconcile_external(ctx, &ext, Counterpart::Lookup).await
    }

    async fn sync_from_internal(
        &self,
        ctx: &PassContext,
        internal_id: &str,
        prefetched: Option<InternalRecord>,
    ) -> Result<RecordResult> {
        if let Some(link) = self.ledger.find_link_by_internal(internal_id)? {
            let ext = self
                .fetch_external(ctx, &link.external_id, Some(internal_id))
                .await?;
            let counterpart = match prefetched {
                Some(record) if record.id == link.internal_id => Counterpart::Known(Some(record)),
                _ => Counterpart::Lookup,
            };
            return self.reconcile_external(ctx, &ext, counterpart).await;
        }

        let record = match prefetched {
            Some(record) => record,
            None => self.fetch_internal(ctx, internal_id).await?,
        };
        let Some(external_id) = record.external_id.clone() else {
            debug!(
                "[Webhook] System B record {} has no external origin; System A is never created from B",
                internal_id
            );
            return Ok(RecordResult::skipped());
        };
        let ext = self
            .fetch_external(ctx, &external_id, Some(internal_id))
            .await?;
        self.reconcile_external(ctx, &ext, Counterpart::Known(Some(record)))
            .await
    }

    /// Deletion from System A removes the System B record and the link;
    /// deletion from System B only removes the link.
    async fn apply_delete(&self, ctx: &PassContext, payload: &WebhookPayload) -> Result<RecordResult> {
        let link = match payload.source_system {
            SystemId::SystemA => self.ledger.find_link_by_external(&payload.record_id)?,
            SystemId::SystemB => self.ledger.find_link_by_internal(&payload.record_id)?,
        };
        let Some(link) = link else {
            debug!(
                "[Webhook] Delete of unlinked {} record {}, nothing to do",
                payload.source_system, payload.record_id
            );
            return Ok(RecordResult::skipped());
        };
        let deletes_internal = payload.source_system == SystemId::SystemA;
        if deletes_internal && !ctx.direction().allows_to_internal() {
            debug!(
                "[Webhook] Direction {} does not propagate deletes to System B",
                ctx.direction()
            );
            return Ok(RecordResult::skipped());
        }

        let direction = if deletes_internal {
            SyncDirection::AToB
        } else {
            SyncDirection::BToA
        };
        let op = self
            .ledger
            .create_operation(ctx.operation(
                OperationKind::Delete,
                direction,
                &link.external_id,
                Some(&link.internal_id),
            ))
            .await?;

        let mut attempts = 0;
        if deletes_internal {
            let client = &self.internal;
            let id = link.internal_id.as_str();
            let deleted = retry_transient(ctx.retry, "delete System B record", move || {
                client.delete_record(id)
            })
            .await;
            attempts = deleted.attempts;
            match deleted.result {
                Ok(()) => {}
                Err(Error::NotFound(_)) => {
                    debug!("[Webhook] System B record {} was already gone", link.internal_id);
                }
                Err(err) => return Err(self.fail_operation(&op, err, attempts).await),
            }
        }
        if let Err(err) = self.ledger.remove_link(&link.external_id).await {
            return Err(self.fail_operation(&op, err, attempts).await);
        }
        let op = self
            .ledger
            .complete_operation(
                &op.id,
                OperationOutcome {
                    target_id: op.target_id.clone(),
                    changes: Vec::new(),
                    retry_count: attempts,
                },
            )
            .await?;
        info!(
            "[Webhook] Unlinked {} <-> {}{}",
            link.external_id,
            link.internal_id,
            if deletes_internal {
                " and deleted the System B record"
            } else {
                ""
            }
        );
        self.emit_completed(&op);
        Ok(RecordResult::new(RecordOutcome::Deleted, Some(op.id)))
    }

    async fn fetch_external(
        &self,
        ctx: &PassContext,
        external_id: &str,
        internal_id: Option<&str>,
    ) -> Result<ExternalRecord> {
        let client = &self.external;
        let fetched = retry_transient(ctx.retry, "fetch System A event", move || {
            client.get_event(external_id)
        })
        .await;
        match fetched.result {
            Ok(ext) => Ok(ext),
            Err(err) => {
                let op = ctx.operation(OperationKind::Update, ctx.direction(), external_id, internal_id);
                Err(self.record_failure(op, err, fetched.attempts).await)
            }
        }
    }

    async fn fetch_internal(&self, ctx: &PassContext, internal_id: &str) -> Result<InternalRecord> {
        let client = &self.internal;
        let fetched = retry_transient(ctx.retry, "fetch System B record", move || {
            client.get_record(internal_id)
        })
        .await;
        let missing = || Error::not_found(format!("System B record {} does not exist", internal_id));
        match fetched.result.and_then(|found| found.ok_or_else(missing)) {
            Ok(record) => Ok(record),
            Err(err) => {
                let op = ctx.operation(OperationKind::Update, ctx.direction(), internal_id, None);
                Err(self.record_failure(op, err, fetched.attempts).await)
            }
        }
    }
}

fn webhook_outcome(outcome: RecordOutcome) -> WebhookOutcome {
    match outcome {
        RecordOutcome::Created => WebhookOutcome::Created,
        RecordOutcome::Updated => WebhookOutcome::Updated,
        RecordOutcome::Deleted => WebhookOutcome::Deleted,
        RecordOutcome::Unchanged => WebhookOutcome::Unchanged,
        RecordOutcome::Conflicted => WebhookOutcome::Conflicted,
        RecordOutcome::Skipped => WebhookOutcome::Skipped,
    }
}
