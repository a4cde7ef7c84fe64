use async_trait::async_trait;

use super::records_model::{
    EventFilter, ExternalRecord, ExternalRecordPatch, InternalRecord, InternalRecordFilter,
    InternalRecordPatch,
};
use crate::errors::Result;

/// Read/write access to System A's event records.
///
/// Transient transport failures must surface as `Error::Connection` so the
/// engine can retry them; everything else is treated as permanent.
#[async_trait]
pub trait ExternalEventClientTrait: Send + Sync {
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<ExternalRecord>>;

    async fn get_event(&self, id: &str) -> Result<ExternalRecord>;

    async fn update_event(&self, id: &str, patch: &ExternalRecordPatch) -> Result<()>;

    /// Lightweight connectivity probe used by the health reporter.
    async fn ping(&self) -> Result<()>;
}

/// Read/write access to System B's internal records.
#[async_trait]
pub trait InternalRecordClientTrait: Send + Sync {
    async fn list_records(&self, filter: &InternalRecordFilter) -> Result<Vec<InternalRecord>>;

    /// Creates a record and returns its id.
    async fn create_record(&self, patch: &InternalRecordPatch) -> Result<String>;

    async fn update_record(&self, id: &str, patch: &InternalRecordPatch) -> Result<()>;

    async fn delete_record(&self, id: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    async fn get_record(&self, id: &str) -> Result<Option<InternalRecord>> {
        let mut records = self
            .list_records(&InternalRecordFilter::by_ids(vec![id.to_string()]))
            .await?;
        Ok(records
            .iter()
            .position(|record| record.id == id)
            .map(|idx| records.swap_remove(idx)))
    }
}
