//! Merge planning: a resolved policy becomes an ordered list of typed,
//! set-based operations. Nothing here touches the database.

use super::error::OperationId;
use super::policy::{AssociationPolicy, ColumnPolicy, ResolvedPolicy};
use crate::catalog_store::{BatchColumn, ColumnKind, EntityType, IdentifierKind};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOperation {
    /// Insert null-named rows into `target` for every identifier referenced by
    /// `source` that `target` does not hold yet.
    CreatePlaceholders {
        id: OperationId,
        target: EntityType,
        target_key: IdentifierKind,
        source: &'static BatchColumn,
    },
    /// Insert-or-update the main entity, matching stored rows on each of
    /// `conflict_keys` in turn.
    UpsertEntity {
        id: OperationId,
        entity: EntityType,
        conflict_keys: Vec<IdentifierKind>,
        columns: Vec<ColumnPolicy>,
    },
    ReconcileAssociations {
        id: OperationId,
        policy: AssociationPolicy,
    },
}

impl MergeOperation {
    pub fn id(&self) -> &OperationId {
        match self {
            MergeOperation::CreatePlaceholders { id, .. }
            | MergeOperation::UpsertEntity { id, .. }
            | MergeOperation::ReconcileAssociations { id, .. } => id,
        }
    }

    /// Table this operation writes to.
    pub fn target_table(&self) -> &'static str {
        match self {
            MergeOperation::CreatePlaceholders { target, .. } => target.table_name(),
            MergeOperation::UpsertEntity { entity, .. } => entity.table_name(),
            MergeOperation::ReconcileAssociations { policy, .. } => policy.association.table,
        }
    }
}

impl fmt::Display for MergeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeOperation::CreatePlaceholders {
                id,
                target_key,
                source,
                ..
            } => write!(
                f,
                "{}: from {} by {}",
                id,
                source.name,
                target_key.column_name()
            ),
            MergeOperation::UpsertEntity {
                id,
                conflict_keys,
                columns,
                ..
            } => {
                let keys: Vec<&str> = conflict_keys.iter().map(|k| k.column_name()).collect();
                write!(f, "{}: on {}", id, keys.join(" then "))?;
                for policy in columns {
                    write!(f, ", {}={}", policy.column.name, policy.mode.as_str())?;
                }
                Ok(())
            }
            MergeOperation::ReconcileAssociations { id, policy } => {
                write!(f, "{}: {} from {}", id, policy.mode.as_str(), policy.column.name)
            }
        }
    }
}

/// Ordered operations for one entity type in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub entity: EntityType,
    pub staging_table: String,
    pub conflict_key: IdentifierKind,
    /// Present identifiers in precedence order, `conflict_key` first.
    pub conflict_keys: Vec<IdentifierKind>,
    pub operations: Vec<MergeOperation>,
}

impl MergePlan {
    /// Main table first, then every other table an operation writes to.
    pub fn affected_tables(&self) -> Vec<&'static str> {
        let mut tables = vec![self.entity.table_name()];
        for operation in &self.operations {
            let table = operation.target_table();
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        tables
    }

    pub fn association(&self) -> Option<&AssociationPolicy> {
        self.operations.iter().find_map(|op| match op {
            MergeOperation::ReconcileAssociations { policy, .. } => Some(policy),
            _ => None,
        })
    }

    pub fn upsert_columns(&self) -> &[ColumnPolicy] {
        self.operations
            .iter()
            .find_map(|op| match op {
                MergeOperation::UpsertEntity { columns, .. } => Some(columns.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn placeholder_targets(
        &self,
    ) -> impl Iterator<Item = (EntityType, &'static BatchColumn)> + '_ {
        self.operations.iter().filter_map(|op| match op {
            MergeOperation::CreatePlaceholders { target, source, .. } => Some((*target, *source)),
            _ => None,
        })
    }
}

pub struct MergePlanner;

impl MergePlanner {
    /// Plan the merge of `staging_table` under `policy`. Placeholder creation
    /// comes first so every reference resolves before the upsert and the
    /// reconciliation read it.
    pub fn plan(policy: &ResolvedPolicy, staging_table: &str) -> MergePlan {
        let entity = policy.entity;
        let mut operations = Vec::new();

        for column_policy in &policy.columns {
            if let ColumnKind::Reference(reference) = &column_policy.column.kind {
                operations.push(MergeOperation::CreatePlaceholders {
                    id: OperationId::new(format!(
                        "create_placeholder_{}",
                        reference.target.table_name()
                    )),
                    target: reference.target,
                    target_key: reference.target_key,
                    source: column_policy.column,
                });
            }
        }

        if let Some(association) = &policy.association {
            operations.push(MergeOperation::CreatePlaceholders {
                id: OperationId::new(format!(
                    "create_placeholder_{}",
                    association.association.target.table_name()
                )),
                target: association.association.target,
                target_key: association.association.target_key,
                source: association.column,
            });
        }

        operations.push(MergeOperation::UpsertEntity {
            id: OperationId::new(format!("upsert_{}", entity.table_name())),
            entity,
            conflict_keys: policy.conflict_keys.clone(),
            columns: policy.columns.clone(),
        });

        if let Some(association) = &policy.association {
            operations.push(MergeOperation::ReconcileAssociations {
                id: OperationId::new(format!("reconcile_{}", association.association.table)),
                policy: *association,
            });
        }

        MergePlan {
            entity,
            staging_table: staging_table.to_string(),
            conflict_key: policy.conflict_key,
            conflict_keys: policy.conflict_keys.clone(),
            operations,
        }
    }
}
