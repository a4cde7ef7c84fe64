//! Ledger repository: operations, conflicts, links, webhook keys, batch runs and
//! persisted configuration for one organization.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::SqliteConnection;
use log::{debug, info};
use uuid::Uuid;

use eventsync_core::config::{SyncConfiguration, SystemId};
use eventsync_core::conflicts::{ConflictClaim, ConflictStatus, DataConflict, ResolvedPatch};
use eventsync_core::errors::{Error, Result};
use eventsync_core::ledger::{
    BatchCounts, BatchRun, BatchStatus, ConflictSettlement, NewSyncOperation, OperationCounts,
    OperationFailure, OperationOutcome, OperationStatus, RecordLink, SyncLedgerTrait,
    SyncOperation, SyncTrigger,
};
use eventsync_core::records::FieldMap;

use super::model::{
    enum_from_db, enum_to_db, timestamp_to_db, ProcessedWebhookDB, RecordLinkDB, SyncConfigurationDB,
    SyncConflictDB, SyncOperationDB, SyncRunDB,
};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{
    processed_webhooks, record_links, sync_configuration, sync_conflicts, sync_operations,
    sync_runs,
};

pub struct SqliteSyncLedger {
    pool: Arc<DbPool>,
    writer: WriteHandle,
    organization_id: String,
}

impl SqliteSyncLedger {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle, organization_id: impl Into<String>) -> Self {
        Self {
            pool,
            writer,
            organization_id: organization_id.into(),
        }
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }
}

fn load_operation(conn: &mut SqliteConnection, org: &str, id: &str) -> Result<SyncOperationDB> {
    sync_operations::table
        .filter(sync_operations::organization_id.eq(org))
        .filter(sync_operations::id.eq(id))
        .select(SyncOperationDB::as_select())
        .first(conn)
        .optional()
        .map_err(StorageError::from)?
        .ok_or_else(|| Error::not_found(format!("Sync operation {}", id)))
}

/// Rejects a status change the operation lifecycle does not allow.
fn transition(row: &SyncOperationDB, next: OperationStatus) -> Result<()> {
    let current: OperationStatus = enum_from_db(&row.status)?;
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "Sync operation {} cannot move from {} to {}",
            row.id,
            current.as_str(),
            next.as_str()
        )))
    }
}

fn load_conflict(conn: &mut SqliteConnection, org: &str, id: &str) -> Result<SyncConflictDB> {
    sync_conflicts::table
        .filter(sync_conflicts::organization_id.eq(org))
        .filter(sync_conflicts::id.eq(id))
        .select(SyncConflictDB::as_select())
        .first(conn)
        .optional()
        .map_err(StorageError::from)?
        .ok_or_else(|| Error::not_found(format!("Conflict {}", id)))
}

fn find_link_by(
    conn: &mut SqliteConnection,
    org: &str,
    external: Option<&str>,
    internal: Option<&str>,
) -> Result<Option<RecordLinkDB>> {
    let mut query = record_links::table
        .filter(record_links::organization_id.eq(org))
        .select(RecordLinkDB::as_select())
        .into_boxed();
    if let Some(external_id) = external {
        query = query.filter(record_links::external_id.eq(external_id.to_string()));
    }
    if let Some(internal_id) = internal {
        query = query.filter(record_links::internal_id.eq(internal_id.to_string()));
    }
    Ok(query.first(conn).optional().map_err(StorageError::from)?)
}

fn load_run(conn: &mut SqliteConnection, org: &str, id: &str) -> Result<SyncRunDB> {
    sync_runs::table
        .filter(sync_runs::organization_id.eq(org))
        .filter(sync_runs::id.eq(id))
        .select(SyncRunDB::as_select())
        .first(conn)
        .optional()
        .map_err(StorageError::from)?
        .ok_or_else(|| Error::not_found(format!("Batch run {}", id)))
}

#[async_trait]
impl SyncLedgerTrait for SqliteSyncLedger {
    async fn create_operation(&self, new_operation: NewSyncOperation) -> Result<SyncOperation> {
        let org = self.organization_id.clone();
        self.writer
            .exec(move |conn| {
                let op = new_operation.into_operation(Utc::now());
                diesel::insert_into(sync_operations::table)
                    .values(SyncOperationDB::from_domain(&org, &op)?)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(op)
            })
            .await
    }

    async fn complete_operation(
        &self,
        operation_id: &str,
        outcome: OperationOutcome,
    ) -> Result<SyncOperation> {
        let org = self.organization_id.clone();
        let id = operation_id.to_string();
        self.writer
            .exec(move |conn| {
                let row = load_operation(conn, &org, &id)?;
                transition(&row, OperationStatus::Completed)?;
                let now = timestamp_to_db(Utc::now());
                diesel::update(sync_operations::table.find(&id))
                    .set((
                        sync_operations::status.eq(enum_to_db(&OperationStatus::Completed)?),
                        sync_operations::target_id.eq(outcome.target_id.or(row.target_id)),
                        sync_operations::changes.eq(serde_json::to_string(&outcome.changes)?),
                        sync_operations::retry_count.eq(outcome.retry_count as i32),
                        sync_operations::last_error.eq::<Option<String>>(None),
                        sync_operations::last_error_code.eq::<Option<String>>(None),
                        sync_operations::updated_at.eq(&now),
                        sync_operations::completed_at.eq(Some(now.clone())),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                load_operation(conn, &org, &id)?.into_domain()
            })
            .await
    }

    async fn fail_operation(
        &self,
        operation_id: &str,
        failure: OperationFailure,
    ) -> Result<SyncOperation> {
        let org = self.organization_id.clone();
        let id = operation_id.to_string();
        self.writer
            .exec(move |conn| {
                let row = load_operation(conn, &org, &id)?;
                transition(&row, OperationStatus::Failed)?;
                diesel::update(sync_operations::table.find(&id))
                    .set((
                        sync_operations::status.eq(enum_to_db(&OperationStatus::Failed)?),
                        sync_operations::retry_count.eq(failure.retry_count as i32),
                        sync_operations::last_error.eq(Some(failure.message)),
                        sync_operations::last_error_code.eq(Some(failure.code.to_string())),
                        sync_operations::updated_at.eq(timestamp_to_db(Utc::now())),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                load_operation(conn, &org, &id)?.into_domain()
            })
            .await
    }

    async fn park_operation(
        &self,
        operation_id: &str,
        conflicts: Vec<DataConflict>,
    ) -> Result<Vec<DataConflict>> {
        let org = self.organization_id.clone();
        let id = operation_id.to_string();
        self.writer
            .exec(move |conn| {
                let row = load_operation(conn, &org, &id)?;
                transition(&row, OperationStatus::Conflicted)?;
                diesel::update(sync_operations::table.find(&id))
                    .set((
                        sync_operations::status.eq(enum_to_db(&OperationStatus::Conflicted)?),
                        sync_operations::updated_at.eq(timestamp_to_db(Utc::now())),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;

                let mut stored = Vec::with_capacity(conflicts.len());
                for mut conflict in conflicts {
                    conflict.operation_id = Some(id.clone());
                    diesel::insert_into(sync_conflicts::table)
                        .values(SyncConflictDB::from_domain(&org, &conflict)?)
                        .execute(conn)
                        .map_err(StorageError::from)?;
                    stored.push(conflict);
                }
                Ok(stored)
            })
            .await
    }

    fn get_operation(&self, operation_id: &str) -> Result<Option<SyncOperation>> {
        let mut conn = get_connection(&self.pool)?;
        let row = sync_operations::table
            .filter(sync_operations::organization_id.eq(&self.organization_id))
            .filter(sync_operations::id.eq(operation_id))
            .select(SyncOperationDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        row.map(SyncOperationDB::into_domain).transpose()
    }

    fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<SyncOperation>> {
        let mut conn = get_connection(&self.pool)?;
        let mut query = sync_operations::table
            .filter(sync_operations::organization_id.eq(&self.organization_id))
            .select(SyncOperationDB::as_select())
            .into_boxed();
        if let Some(status) = status {
            query = query.filter(sync_operations::status.eq(enum_to_db(&status)?));
        }
        let rows = query
            .order((sync_operations::created_at.desc(), sync_operations::id.desc()))
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .load(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(SyncOperationDB::into_domain).collect()
    }

    fn operation_counts(&self) -> Result<OperationCounts> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_operations::table
            .filter(sync_operations::organization_id.eq(&self.organization_id))
            .group_by(sync_operations::status)
            .select((sync_operations::status, count_star()))
            .load::<(String, i64)>(&mut conn)
            .map_err(StorageError::from)?;

        let mut counts = OperationCounts::default();
        for (status, count) in rows {
            let count = usize::try_from(count).unwrap_or(0);
            match enum_from_db::<OperationStatus>(&status)? {
                OperationStatus::Pending => counts.pending = count,
                OperationStatus::Completed => counts.completed = count,
                OperationStatus::Failed => counts.failed = count,
                OperationStatus::Conflicted => counts.conflicted = count,
            }
        }
        Ok(counts)
    }

    fn get_conflict(&self, conflict_id: &str) -> Result<Option<DataConflict>> {
        let mut conn = get_connection(&self.pool)?;
        let row = sync_conflicts::table
            .filter(sync_conflicts::organization_id.eq(&self.organization_id))
            .filter(sync_conflicts::id.eq(conflict_id))
            .select(SyncConflictDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        row.map(SyncConflictDB::into_domain).transpose()
    }

    fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<DataConflict>> {
        let mut conn = get_connection(&self.pool)?;
        let mut query = sync_conflicts::table
            .filter(sync_conflicts::organization_id.eq(&self.organization_id))
            .select(SyncConflictDB::as_select())
            .into_boxed();
        if let Some(status) = status {
            query = query.filter(sync_conflicts::status.eq(enum_to_db(&status)?));
        }
        let rows = query
            .order((sync_conflicts::created_at.asc(), sync_conflicts::id.asc()))
            .load(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(SyncConflictDB::into_domain).collect()
    }

    fn has_open_conflicts(&self, external_id: &str) -> Result<bool> {
        let mut conn = get_connection(&self.pool)?;
        let open: i64 = sync_conflicts::table
            .filter(sync_conflicts::organization_id.eq(&self.organization_id))
            .filter(sync_conflicts::external_id.eq(external_id))
            .filter(sync_conflicts::status.ne(enum_to_db(&ConflictStatus::Resolved)?))
            .select(count_star())
            .first(&mut conn)
            .map_err(StorageError::from)?;
        Ok(open > 0)
    }

    async fn claim_conflict(&self, conflict_id: &str) -> Result<ConflictClaim> {
        let org = self.organization_id.clone();
        let id = conflict_id.to_string();
        self.writer
            .exec(move |conn| {
                let mut conflict = load_conflict(conn, &org, &id)?.into_domain()?;
                match conflict.status {
                    ConflictStatus::Pending => {
                        diesel::update(sync_conflicts::table.find(&id))
                            .set(
                                sync_conflicts::status
                                    .eq(enum_to_db(&ConflictStatus::Resolving)?),
                            )
                            .execute(conn)
                            .map_err(StorageError::from)?;
                        conflict.status = ConflictStatus::Resolving;
                        Ok(ConflictClaim::Claimed(conflict))
                    }
                    ConflictStatus::Resolving => Err(Error::ConflictInFlight { conflict_id: id }),
                    ConflictStatus::Resolved => Ok(ConflictClaim::AlreadyResolved(conflict)),
                }
            })
            .await
    }

    async fn release_conflict(&self, conflict_id: &str) -> Result<()> {
        let org = self.organization_id.clone();
        let id = conflict_id.to_string();
        self.writer
            .exec(move |conn| {
                diesel::update(
                    sync_conflicts::table
                        .filter(sync_conflicts::organization_id.eq(&org))
                        .filter(sync_conflicts::id.eq(&id))
                        .filter(
                            sync_conflicts::status.eq(enum_to_db(&ConflictStatus::Resolving)?),
                        ),
                )
                .set(sync_conflicts::status.eq(enum_to_db(&ConflictStatus::Pending)?))
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        patch: ResolvedPatch,
    ) -> Result<ConflictSettlement> {
        let org = self.organization_id.clone();
        let id = conflict_id.to_string();
        self.writer
            .exec(move |conn| {
                let mut conflict = load_conflict(conn, &org, &id)?.into_domain()?;
                let now = Utc::now();
                conflict.status = ConflictStatus::Resolved;
                conflict.resolved_at = Some(now);
                conflict.resolution = Some(patch.clone());
                diesel::update(sync_conflicts::table.find(&id))
                    .set((
                        sync_conflicts::status.eq(enum_to_db(&ConflictStatus::Resolved)?),
                        sync_conflicts::resolution.eq(Some(serde_json::to_string(&patch)?)),
                        sync_conflicts::resolved_at.eq(Some(timestamp_to_db(now))),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;

                if let Some(link) = find_link_by(conn, &org, Some(&conflict.external_id), None)? {
                    let mut baseline: FieldMap = serde_json::from_str(&link.baseline)?;
                    baseline.insert(conflict.field.clone(), patch.baseline_value.clone());
                    diesel::update(
                        record_links::table
                            .filter(record_links::organization_id.eq(&org))
                            .filter(record_links::external_id.eq(&link.external_id)),
                    )
                    .set((
                        record_links::baseline.eq(serde_json::to_string(&baseline)?),
                        record_links::last_synced_at.eq(timestamp_to_db(now)),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                }

                let mut completed_operation = None;
                if let Some(operation_id) = conflict.operation_id.clone() {
                    let open: i64 = sync_conflicts::table
                        .filter(sync_conflicts::organization_id.eq(&org))
                        .filter(sync_conflicts::operation_id.eq(&operation_id))
                        .filter(sync_conflicts::status.ne(enum_to_db(&ConflictStatus::Resolved)?))
                        .select(count_star())
                        .first(conn)
                        .map_err(StorageError::from)?;
                    let row = load_operation(conn, &org, &operation_id)?;
                    if open == 0 && row.status == enum_to_db(&OperationStatus::Conflicted)? {
                        let stamp = timestamp_to_db(now);
                        diesel::update(sync_operations::table.find(&operation_id))
                            .set((
                                sync_operations::status
                                    .eq(enum_to_db(&OperationStatus::Completed)?),
                                sync_operations::updated_at.eq(&stamp),
                                sync_operations::completed_at.eq(Some(stamp.clone())),
                            ))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                        debug!(
                            "[Ledger] Operation {} completed after its last conflict was resolved",
                            operation_id
                        );
                        completed_operation =
                            Some(load_operation(conn, &org, &operation_id)?.into_domain()?);
                    }
                }
                Ok(ConflictSettlement {
                    conflict,
                    completed_operation,
                })
            })
            .await
    }

    fn find_link_by_external(&self, external_id: &str) -> Result<Option<RecordLink>> {
        let mut conn = get_connection(&self.pool)?;
        find_link_by(&mut conn, &self.organization_id, Some(external_id), None)?
            .map(RecordLinkDB::into_domain)
            .transpose()
    }

    fn find_link_by_internal(&self, internal_id: &str) -> Result<Option<RecordLink>> {
        let mut conn = get_connection(&self.pool)?;
        find_link_by(&mut conn, &self.organization_id, None, Some(internal_id))?
            .map(RecordLinkDB::into_domain)
            .transpose()
    }

    fn list_links(&self) -> Result<Vec<RecordLink>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = record_links::table
            .filter(record_links::organization_id.eq(&self.organization_id))
            .select(RecordLinkDB::as_select())
            .order(record_links::created_at.asc())
            .load(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(RecordLinkDB::into_domain).collect()
    }

    async fn create_link(
        &self,
        external_id: &str,
        internal_id: &str,
        baseline: FieldMap,
    ) -> Result<RecordLink> {
        let org = self.organization_id.clone();
        let external_id = external_id.to_string();
        let internal_id = internal_id.to_string();
        self.writer
            .exec(move |conn| {
                let by_external = find_link_by(conn, &org, Some(&external_id), None)?;
                let by_internal = find_link_by(conn, &org, None, Some(&internal_id))?;
                match (by_external, by_internal) {
                    (Some(existing), _) if existing.internal_id == internal_id => {
                        return existing.into_domain();
                    }
                    (Some(existing), _) => {
                        return Err(Error::link_integrity(format!(
                            "External record {} is already linked to {}",
                            external_id, existing.internal_id
                        )));
                    }
                    (None, Some(existing)) => {
                        return Err(Error::link_integrity(format!(
                            "Internal record {} is already linked to {}",
                            internal_id, existing.external_id
                        )));
                    }
                    (None, None) => {}
                }

                let row = RecordLinkDB::new(&org, &external_id, &internal_id, &baseline, Utc::now())?;
                diesel::insert_into(record_links::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(|e| {
                        let err = StorageError::from(e);
                        if err.is_unique_violation() {
                            Error::link_integrity(format!(
                                "Link {} <-> {} collides with an existing link",
                                external_id, internal_id
                            ))
                        } else {
                            err.into()
                        }
                    })?;
                info!("[Ledger] Linked {} <-> {}", external_id, internal_id);
                row.into_domain()
            })
            .await
    }

    async fn update_link_baseline(&self, external_id: &str, baseline: FieldMap) -> Result<()> {
        let org = self.organization_id.clone();
        let external_id = external_id.to_string();
        self.writer
            .exec(move |conn| {
                let updated = diesel::update(
                    record_links::table
                        .filter(record_links::organization_id.eq(&org))
                        .filter(record_links::external_id.eq(&external_id)),
                )
                .set((
                    record_links::baseline.eq(serde_json::to_string(&baseline)?),
                    record_links::last_synced_at.eq(timestamp_to_db(Utc::now())),
                ))
                .execute(conn)
                .map_err(StorageError::from)?;
                if updated == 0 {
                    return Err(Error::not_found(format!("Link for {}", external_id)));
                }
                Ok(())
            })
            .await
    }

    async fn remove_link(&self, external_id: &str) -> Result<bool> {
        let org = self.organization_id.clone();
        let external_id = external_id.to_string();
        self.writer
            .exec(move |conn| {
                let removed = diesel::delete(
                    record_links::table
                        .filter(record_links::organization_id.eq(&org))
                        .filter(record_links::external_id.eq(&external_id)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(removed > 0)
            })
            .await
    }

    fn is_webhook_processed(&self, source: SystemId, event_id: &str) -> Result<bool> {
        let mut conn = get_connection(&self.pool)?;
        let found: i64 = processed_webhooks::table
            .filter(processed_webhooks::organization_id.eq(&self.organization_id))
            .filter(processed_webhooks::source_system.eq(enum_to_db(&source)?))
            .filter(processed_webhooks::event_id.eq(event_id))
            .select(count_star())
            .first(&mut conn)
            .map_err(StorageError::from)?;
        Ok(found > 0)
    }

    async fn mark_webhook_processed(
        &self,
        source: SystemId,
        event_id: &str,
        operation_id: Option<String>,
    ) -> Result<bool> {
        let row = ProcessedWebhookDB {
            organization_id: self.organization_id.clone(),
            source_system: enum_to_db(&source)?,
            event_id: event_id.to_string(),
            operation_id,
            processed_at: timestamp_to_db(Utc::now()),
        };
        self.writer
            .exec(move |conn| {
                let inserted = diesel::insert_into(processed_webhooks::table)
                    .values(&row)
                    .on_conflict((
                        processed_webhooks::organization_id,
                        processed_webhooks::source_system,
                        processed_webhooks::event_id,
                    ))
                    .do_nothing()
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(inserted > 0)
            })
            .await
    }

    async fn start_batch_run(&self, trigger: SyncTrigger) -> Result<BatchRun> {
        let org = self.organization_id.clone();
        self.writer
            .exec(move |conn| {
                let run = BatchRun {
                    id: Uuid::now_v7().to_string(),
                    trigger,
                    status: BatchStatus::Running,
                    counts: BatchCounts::default(),
                    error: None,
                    started_at: Utc::now(),
                    finished_at: None,
                };
                diesel::insert_into(sync_runs::table)
                    .values(SyncRunDB::from_domain(&org, &run)?)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(run)
            })
            .await
    }

    async fn finish_batch_run(
        &self,
        batch_id: &str,
        status: BatchStatus,
        counts: BatchCounts,
        error: Option<String>,
    ) -> Result<BatchRun> {
        let org = self.organization_id.clone();
        let id = batch_id.to_string();
        self.writer
            .exec(move |conn| {
                let mut run = load_run(conn, &org, &id)?.into_domain()?;
                run.status = status;
                run.counts = counts;
                run.error = error;
                run.finished_at = Some(Utc::now());
                let row = SyncRunDB::from_domain(&org, &run)?;
                diesel::update(sync_runs::table.find(&id))
                    .set((
                        sync_runs::status.eq(row.status),
                        sync_runs::created_count.eq(row.created_count),
                        sync_runs::updated_count.eq(row.updated_count),
                        sync_runs::unchanged_count.eq(row.unchanged_count),
                        sync_runs::conflicted_count.eq(row.conflicted_count),
                        sync_runs::failed_count.eq(row.failed_count),
                        sync_runs::skipped_count.eq(row.skipped_count),
                        sync_runs::error.eq(row.error),
                        sync_runs::finished_at.eq(row.finished_at),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(run)
            })
            .await
    }

    fn last_batch_run(&self) -> Result<Option<BatchRun>> {
        let mut conn = get_connection(&self.pool)?;
        let row = sync_runs::table
            .filter(sync_runs::organization_id.eq(&self.organization_id))
            .select(SyncRunDB::as_select())
            .order((sync_runs::started_at.desc(), sync_runs::id.desc()))
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        row.map(SyncRunDB::into_domain).transpose()
    }

    fn load_configuration(&self) -> Result<Option<SyncConfiguration>> {
        let mut conn = get_connection(&self.pool)?;
        let row = sync_configuration::table
            .find(&self.organization_id)
            .select(SyncConfigurationDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.config)?)),
            None => Ok(None),
        }
    }

    async fn save_configuration(&self, config: &SyncConfiguration) -> Result<()> {
        if config.organization_id != self.organization_id {
            return Err(Error::configuration(format!(
                "Ledger for {} cannot store configuration of {}",
                self.organization_id, config.organization_id
            )));
        }
        let row = SyncConfigurationDB {
            organization_id: self.organization_id.clone(),
            config: serde_json::to_string(config)?,
            updated_at: timestamp_to_db(Utc::now()),
        };
        self.writer
            .exec(move |conn| {
                diesel::insert_into(sync_configuration::table)
                    .values(&row)
                    .on_conflict(sync_configuration::organization_id)
                    .do_update()
                    .set((
                        sync_configuration::config.eq(&row.config),
                        sync_configuration::updated_at.eq(&row.updated_at),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }
}
