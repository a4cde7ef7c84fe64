//! Database rows for the ledger tables and their conversions.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;

use eventsync_core::conflicts::DataConflict;
use eventsync_core::errors::{DatabaseError, Error, Result};
use eventsync_core::ledger::{BatchCounts, BatchRun, RecordLink, SyncOperation};
use eventsync_core::records::FieldMap;

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub(crate) fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn timestamp_from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            Error::Database(DatabaseError::Internal(format!(
                "Invalid stored timestamp '{}': {}",
                value, e
            )))
        })
}

fn optional_timestamp_from_db(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(timestamp_from_db).transpose()
}

pub(crate) fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub(crate) fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

fn count_to_db(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn count_from_db(value: i32) -> usize {
    usize::try_from(value).unwrap_or(0)
}

#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_operations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncOperationDB {
    pub id: String,
    pub organization_id: String,
    pub kind: String,
    pub direction: String,
    pub source_system: String,
    pub source_id: String,
    pub target_id: Option<String>,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub changes: String,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub trigger_kind: String,
    pub idempotency_key: Option<String>,
    pub batch_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl SyncOperationDB {
    pub fn from_domain(organization_id: &str, op: &SyncOperation) -> Result<Self> {
        Ok(Self {
            id: op.id.clone(),
            organization_id: organization_id.to_string(),
            kind: enum_to_db(&op.kind)?,
            direction: enum_to_db(&op.direction)?,
            source_system: enum_to_db(&op.source_system)?,
            source_id: op.source_id.clone(),
            target_id: op.target_id.clone(),
            status: enum_to_db(&op.status)?,
            retry_count: op.retry_count as i32,
            max_retries: op.max_retries as i32,
            changes: serde_json::to_string(&op.changes)?,
            last_error: op.last_error.clone(),
            last_error_code: op.last_error_code.clone(),
            trigger_kind: enum_to_db(&op.trigger)?,
            idempotency_key: op.idempotency_key.clone(),
            batch_id: op.batch_id.clone(),
            created_at: timestamp_to_db(op.created_at),
            updated_at: timestamp_to_db(op.updated_at),
            completed_at: op.completed_at.map(timestamp_to_db),
        })
    }

    pub fn into_domain(self) -> Result<SyncOperation> {
        Ok(SyncOperation {
            kind: enum_from_db(&self.kind)?,
            direction: enum_from_db(&self.direction)?,
            source_system: enum_from_db(&self.source_system)?,
            status: enum_from_db(&self.status)?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            max_retries: u32::try_from(self.max_retries).unwrap_or(0),
            changes: serde_json::from_str(&self.changes)?,
            trigger: enum_from_db(&self.trigger_kind)?,
            created_at: timestamp_from_db(&self.created_at)?,
            updated_at: timestamp_from_db(&self.updated_at)?,
            completed_at: optional_timestamp_from_db(self.completed_at.as_deref())?,
            id: self.id,
            source_id: self.source_id,
            target_id: self.target_id,
            last_error: self.last_error,
            last_error_code: self.last_error_code,
            idempotency_key: self.idempotency_key,
            batch_id: self.batch_id,
        })
    }
}

#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_conflicts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncConflictDB {
    pub id: String,
    pub organization_id: String,
    pub operation_id: Option<String>,
    pub external_id: String,
    pub internal_id: String,
    pub field: String,
    pub external_field: String,
    pub external_value: String,
    pub internal_value: String,
    pub external_modified_at: String,
    pub internal_modified_at: String,
    pub priority: String,
    pub status: String,
    pub resolution: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
}

impl SyncConflictDB {
    pub fn from_domain(organization_id: &str, conflict: &DataConflict) -> Result<Self> {
        Ok(Self {
            id: conflict.id.clone(),
            organization_id: organization_id.to_string(),
            operation_id: conflict.operation_id.clone(),
            external_id: conflict.external_id.clone(),
            internal_id: conflict.internal_id.clone(),
            field: conflict.field.clone(),
            external_field: conflict.external_field.clone(),
            external_value: serde_json::to_string(&conflict.external_value)?,
            internal_value: serde_json::to_string(&conflict.internal_value)?,
            external_modified_at: timestamp_to_db(conflict.external_modified_at),
            internal_modified_at: timestamp_to_db(conflict.internal_modified_at),
            priority: enum_to_db(&conflict.priority)?,
            status: enum_to_db(&conflict.status)?,
            resolution: conflict
                .resolution
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            resolved_at: conflict.resolved_at.map(timestamp_to_db),
            created_at: timestamp_to_db(conflict.created_at),
        })
    }

    pub fn into_domain(self) -> Result<DataConflict> {
        Ok(DataConflict {
            external_value: serde_json::from_str(&self.external_value)?,
            internal_value: serde_json::from_str(&self.internal_value)?,
            external_modified_at: timestamp_from_db(&self.external_modified_at)?,
            internal_modified_at: timestamp_from_db(&self.internal_modified_at)?,
            priority: enum_from_db(&self.priority)?,
            status: enum_from_db(&self.status)?,
            resolution: self
                .resolution
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            resolved_at: optional_timestamp_from_db(self.resolved_at.as_deref())?,
            created_at: timestamp_from_db(&self.created_at)?,
            id: self.id,
            operation_id: self.operation_id,
            external_id: self.external_id,
            internal_id: self.internal_id,
            field: self.field,
            external_field: self.external_field,
        })
    }
}

#[derive(Queryable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::record_links)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RecordLinkDB {
    pub organization_id: String,
    pub external_id: String,
    pub internal_id: String,
    pub baseline: String,
    pub last_synced_at: String,
    pub created_at: String,
}

impl RecordLinkDB {
    pub fn new(
        organization_id: &str,
        external_id: &str,
        internal_id: &str,
        baseline: &FieldMap,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            organization_id: organization_id.to_string(),
            external_id: external_id.to_string(),
            internal_id: internal_id.to_string(),
            baseline: serde_json::to_string(baseline)?,
            last_synced_at: timestamp_to_db(now),
            created_at: timestamp_to_db(now),
        })
    }

    pub fn into_domain(self) -> Result<RecordLink> {
        Ok(RecordLink {
            baseline: serde_json::from_str(&self.baseline)?,
            last_synced_at: timestamp_from_db(&self.last_synced_at)?,
            created_at: timestamp_from_db(&self.created_at)?,
            external_id: self.external_id,
            internal_id: self.internal_id,
        })
    }
}

#[derive(Queryable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::processed_webhooks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProcessedWebhookDB {
    pub organization_id: String,
    pub source_system: String,
    pub event_id: String,
    pub operation_id: Option<String>,
    pub processed_at: String,
}

#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncRunDB {
    pub id: String,
    pub organization_id: String,
    pub trigger_kind: String,
    pub status: String,
    pub created_count: i32,
    pub updated_count: i32,
    pub unchanged_count: i32,
    pub conflicted_count: i32,
    pub failed_count: i32,
    pub skipped_count: i32,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl SyncRunDB {
    pub fn from_domain(organization_id: &str, run: &BatchRun) -> Result<Self> {
        Ok(Self {
            id: run.id.clone(),
            organization_id: organization_id.to_string(),
            trigger_kind: enum_to_db(&run.trigger)?,
            status: enum_to_db(&run.status)?,
            created_count: count_to_db(run.counts.created),
            updated_count: count_to_db(run.counts.updated),
            unchanged_count: count_to_db(run.counts.unchanged),
            conflicted_count: count_to_db(run.counts.conflicted),
            failed_count: count_to_db(run.counts.failed),
            skipped_count: count_to_db(run.counts.skipped),
            error: run.error.clone(),
            started_at: timestamp_to_db(run.started_at),
            finished_at: run.finished_at.map(timestamp_to_db),
        })
    }

    pub fn into_domain(self) -> Result<BatchRun> {
        Ok(BatchRun {
            trigger: enum_from_db(&self.trigger_kind)?,
            status: enum_from_db(&self.status)?,
            counts: BatchCounts {
                created: count_from_db(self.created_count),
                updated: count_from_db(self.updated_count),
                unchanged: count_from_db(self.unchanged_count),
                conflicted: count_from_db(self.conflicted_count),
                failed: count_from_db(self.failed_count),
                skipped: count_from_db(self.skipped_count),
            },
            started_at: timestamp_from_db(&self.started_at)?,
            finished_at: optional_timestamp_from_db(self.finished_at.as_deref())?,
            id: self.id,
            error: self.error,
        })
    }
}

#[derive(Queryable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_configuration)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncConfigurationDB {
    pub organization_id: String,
    pub config: String,
    pub updated_at: String,
}
