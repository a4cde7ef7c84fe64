use std::sync::Arc;

use log::warn;

use super::mapping_model::{default_field_table, normalize_value, values_equal, FieldMapping};
use crate::records::{
    ExternalRecord, ExternalRecordPatch, FieldMap, InternalRecord, InternalRecordPatch,
};

/// Pure translation between System A and System B record shapes.
///
/// Output is always a patch: fields outside the table are never emitted, so
/// local-only fields on either system survive a sync pass.
#[derive(Debug, Clone)]
pub struct RecordMapper {
    table: Arc<Vec<FieldMapping>>,
}

impl Default for RecordMapper {
    fn default() -> Self {
        Self::new(default_field_table())
    }
}

impl RecordMapper {
    pub fn new(table: Vec<FieldMapping>) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn table(&self) -> &[FieldMapping] {
        &self.table
    }

    pub fn mapping_for_internal(&self, internal_field: &str) -> Option<&FieldMapping> {
        self.table.iter().find(|m| m.internal == internal_field)
    }

    /// Tracked fields of an external record, renamed to System B names.
    pub fn to_internal(&self, record: &ExternalRecord) -> InternalRecordPatch {
        InternalRecordPatch {
            external_id: Some(record.id.clone()),
            fields: self.project(&record.fields, &record.id, |m| &m.external, |m| &m.internal),
        }
    }

    /// Tracked fields of an internal record, renamed to System A names.
    ///
    /// Fields whose normalized value already matches `prior` are left out.
    pub fn to_external(
        &self,
        record: &InternalRecord,
        prior: Option<&ExternalRecord>,
    ) -> ExternalRecordPatch {
        let mut fields =
            self.project(&record.fields, &record.id, |m| &m.internal, |m| &m.external);
        if let Some(prior) = prior {
            fields.retain(|name, value| {
                let Some(mapping) = self.table.iter().find(|m| &m.external == name) else {
                    return true;
                };
                prior
                    .fields
                    .get(name)
                    .map_or(true, |current| !values_equal(mapping.kind, current, value))
            });
        }
        ExternalRecordPatch { fields }
    }

    /// Normalizes tracked fields of an internal-shaped field map.
    pub fn normalize_internal(&self, fields: &FieldMap) -> FieldMap {
        self.project(fields, "<baseline>", |m| &m.internal, |m| &m.internal)
    }

    fn project(
        &self,
        source: &FieldMap,
        record_id: &str,
        from: impl Fn(&FieldMapping) -> &String,
        to: impl Fn(&FieldMapping) -> &String,
    ) -> FieldMap {
        let mut out = FieldMap::new();
        for mapping in self.table.iter() {
            let Some(value) = source.get(from(mapping)) else {
                continue;
            };
            match normalize_value(mapping.kind, value) {
                Ok(normalized) => {
                    out.insert(to(mapping).clone(), normalized);
                }
                Err(reason) => {
                    warn!(
                        "[EventSync] Dropping field '{}' of record {}: {}",
                        from(mapping),
                        record_id,
                        reason
                    );
                }
            }
        }
        out
    }
}
