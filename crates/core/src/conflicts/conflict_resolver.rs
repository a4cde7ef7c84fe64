use serde_json::Value;

use super::conflicts_model::{DataConflict, ResolutionPolicy, ResolvedPatch};
use crate::config::{SyncConfiguration, SyncDirection, SystemId};
use crate::errors::{Error, Result};
use crate::mapping::{normalize_value, RecordMapper};

/// Turns a conflict plus a policy into the write that settles it.
///
/// Pure: the caller owns the conflict state machine and applies the patch.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    mapper: RecordMapper,
}

impl ConflictResolver {
    pub fn new(mapper: RecordMapper) -> Self {
        Self { mapper }
    }

    pub fn resolve(
        &self,
        conflict: &DataConflict,
        policy: &ResolutionPolicy,
        config: &SyncConfiguration,
    ) -> Result<ResolvedPatch> {
        let mapping = self.mapper.mapping_for_internal(&conflict.field).ok_or_else(|| {
            Error::validation(format!(
                "Field '{}' is not part of the comparison table",
                conflict.field
            ))
        })?;

        let authority = config.authority_for(&conflict.field);
        let value_of = |system: SystemId| match system {
            SystemId::SystemA => conflict.external_value.clone(),
            SystemId::SystemB => conflict.internal_value.clone(),
        };

        let (value, write_internal, write_external) = match policy {
            ResolutionPolicy::SourceWins => {
                let value = value_of(authority);
                match authority {
                    SystemId::SystemA => (value, true, false),
                    SystemId::SystemB => (value, false, true),
                }
            }
            ResolutionPolicy::TargetWins => {
                let kept = authority.other();
                let value = value_of(kept);
                // Only a bidirectional setup may write back into the authoritative side.
                let propagate = config.direction == SyncDirection::Bidirectional;
                match kept {
                    SystemId::SystemA => (value, propagate, false),
                    SystemId::SystemB => (value, false, propagate),
                }
            }
            ResolutionPolicy::Custom { value } => {
                let normalized = normalize_value(mapping.kind, value).map_err(|reason| {
                    Error::validation(format!(
                        "Custom value for '{}' rejected: {}",
                        conflict.field, reason
                    ))
                })?;
                (
                    normalized,
                    config.direction.allows_to_internal(),
                    config.direction.allows_to_external(),
                )
            }
        };

        let external_after = if write_external {
            value.clone()
        } else {
            conflict.external_value.clone()
        };
        let internal_after = if write_internal {
            value.clone()
        } else {
            conflict.internal_value.clone()
        };
        let baseline_value = Self::baseline_after(config.direction, external_after, internal_after);

        Ok(ResolvedPatch {
            conflict_id: conflict.id.clone(),
            field: conflict.field.clone(),
            external_field: conflict.external_field.clone(),
            value,
            write_internal,
            write_external,
            baseline_value,
            policy: policy.clone(),
        })
    }

    /// When both sides end up equal that value is the new baseline; otherwise
    /// the source side of a one-way setup is, so the withheld target value is
    /// not re-flagged on the next pass.
    fn baseline_after(direction: SyncDirection, external: Value, internal: Value) -> Value {
        if external == internal {
            return external;
        }
        match direction {
            SyncDirection::BToA => internal,
            SyncDirection::AToB | SyncDirection::Bidirectional => external,
        }
    }
}
