use log::warn;
use serde_json::Value;

use super::conflicts_model::DataConflict;
use crate::mapping::{normalize_value, values_equal, FieldMapping, RecordMapper};
use crate::records::{ExternalRecord, FieldMap, InternalRecord};

/// Result of a three-way comparison of a linked pair against its baseline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldReconciliation {
    /// Fields only System A changed, keyed by internal name, normalized.
    pub to_internal: FieldMap,
    /// Fields only System B changed, keyed by external name, normalized.
    pub to_external: FieldMap,
    pub conflicts: Vec<DataConflict>,
}

impl FieldReconciliation {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn is_noop(&self) -> bool {
        self.to_internal.is_empty() && self.to_external.is_empty() && self.conflicts.is_empty()
    }
}

/// Read-only field diff over the declarative comparison table.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    mapper: RecordMapper,
}

struct ComparedField<'a> {
    mapping: &'a FieldMapping,
    external: Option<Value>,
    internal: Option<Value>,
}

impl ConflictDetector {
    pub fn new(mapper: RecordMapper) -> Self {
        Self { mapper }
    }

    /// Every tracked field present on both sides whose normalized values differ.
    pub fn detect(&self, ext: &ExternalRecord, local: &InternalRecord) -> Vec<DataConflict> {
        self.compare(ext, local)
            .into_iter()
            .filter_map(|field| match (field.external, field.internal) {
                (Some(e), Some(i)) if e != i => Some(self.conflict(ext, local, field.mapping, e, i)),
                _ => None,
            })
            .collect()
    }

    /// Classifies each differing field against the last agreed `baseline`
    /// (internal names): changed on one side only becomes a patch towards the
    /// other side, changed on both sides (or never agreed) becomes a conflict.
    pub fn reconcile(
        &self,
        ext: &ExternalRecord,
        local: &InternalRecord,
        baseline: Option<&FieldMap>,
    ) -> FieldReconciliation {
        let mut result = FieldReconciliation::default();
        for field in self.compare(ext, local) {
            let mapping = field.mapping;
            match (field.external, field.internal) {
                (Some(e), None) => {
                    result.to_internal.insert(mapping.internal.clone(), e);
                }
                (None, Some(i)) => {
                    result.to_external.insert(mapping.external.clone(), i);
                }
                (Some(e), Some(i)) if e != i => {
                    let agreed = baseline.and_then(|b| b.get(&mapping.internal));
                    let external_changed =
                        agreed.map_or(true, |b| !values_equal(mapping.kind, b, &e));
                    let internal_changed =
                        agreed.map_or(true, |b| !values_equal(mapping.kind, b, &i));
                    match (external_changed, internal_changed) {
                        (true, false) => {
                            result.to_internal.insert(mapping.internal.clone(), e);
                        }
                        (false, true) => {
                            result.to_external.insert(mapping.external.clone(), i);
                        }
                        _ => result
                            .conflicts
                            .push(self.conflict(ext, local, mapping, e, i)),
                    }
                }
                _ => {}
            }
        }
        result
    }

    fn compare<'a>(&'a self, ext: &ExternalRecord, local: &InternalRecord) -> Vec<ComparedField<'a>> {
        self.mapper
            .table()
            .iter()
            .filter_map(|mapping| {
                let external = Self::normalized(mapping, &ext.id, ext.fields.get(&mapping.external));
                let internal =
                    Self::normalized(mapping, &local.id, local.fields.get(&mapping.internal));
                if external.is_none() && internal.is_none() {
                    return None;
                }
                Some(ComparedField {
                    mapping,
                    external,
                    internal,
                })
            })
            .collect()
    }

    fn normalized(mapping: &FieldMapping, record_id: &str, value: Option<&Value>) -> Option<Value> {
        let value = value?;
        match normalize_value(mapping.kind, value) {
            Ok(normalized) => Some(normalized),
            Err(reason) => {
                warn!(
                    "[EventSync] Ignoring unparseable field '{}' on record {}: {}",
                    mapping.internal, record_id, reason
                );
                None
            }
        }
    }

    fn conflict(
        &self,
        ext: &ExternalRecord,
        local: &InternalRecord,
        mapping: &FieldMapping,
        external_value: Value,
        internal_value: Value,
    ) -> DataConflict {
        DataConflict::new(
            ext.id.clone(),
            local.id.clone(),
            mapping.internal.clone(),
            mapping.external.clone(),
            external_value,
            internal_value,
            ext.last_modified,
            local.updated_at,
            mapping.priority,
        )
    }
}
