//! Conflict-resolution policy: raw per-entity configuration, its validation,
//! and resolution against the columns a batch actually carries.

use super::error::ConfigurationError;
use super::reconcile::list_items;
use super::sql;
use crate::catalog_store::{
    AssociationDef, BatchColumn, ColumnKind, EntityType, IdentifierKind, ValueType,
};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

// =============================================================================
// Modes
// =============================================================================

/// Per-column conflict mode applied when an incoming row hits an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnMode {
    PreferIncoming,
    PreferNonNull,
    PreferLonger,
    /// Append incoming list items missing from the stored list. List columns only.
    Extend,
}

impl ColumnMode {
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s {
            "prefer_incoming" => Some(ColumnMode::PreferIncoming),
            "prefer_non_null" => Some(ColumnMode::PreferNonNull),
            "prefer_longer" => Some(ColumnMode::PreferLonger),
            "extend" => Some(ColumnMode::Extend),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnMode::PreferIncoming => "prefer_incoming",
            ColumnMode::PreferNonNull => "prefer_non_null",
            ColumnMode::PreferLonger => "prefer_longer",
            ColumnMode::Extend => "extend",
        }
    }

    /// The value stored after merging `incoming` into `existing`.
    pub fn choose(&self, existing: &Value, incoming: &Value) -> Value {
        match self {
            ColumnMode::PreferIncoming => incoming.clone(),
            ColumnMode::PreferNonNull => match existing {
                Value::Null => incoming.clone(),
                _ => existing.clone(),
            },
            ColumnMode::PreferLonger => match (existing, incoming) {
                (_, Value::Null) => existing.clone(),
                (Value::Null, _) => incoming.clone(),
                _ if sql_length(incoming) >= sql_length(existing) => incoming.clone(),
                _ => existing.clone(),
            },
            ColumnMode::Extend => extend_list(existing, incoming),
        }
    }

    /// SQL expression for the `DO UPDATE SET` assignment of `column`, where
    /// `table` names the existing row and `excluded` the incoming one.
    pub fn render_assignment(&self, table: &str, column: &str) -> String {
        match self {
            ColumnMode::PreferIncoming => format!("{column} = excluded.{column}"),
            ColumnMode::PreferNonNull => {
                format!("{column} = COALESCE({table}.{column}, excluded.{column})")
            }
            ColumnMode::PreferLonger => format!(
                "{column} = CASE \
                 WHEN excluded.{column} IS NULL THEN {table}.{column} \
                 WHEN {table}.{column} IS NULL THEN excluded.{column} \
                 WHEN length(excluded.{column}) >= length({table}.{column}) THEN excluded.{column} \
                 ELSE {table}.{column} END"
            ),
            ColumnMode::Extend => format!(
                "{column} = {}({table}.{column}, excluded.{column})",
                sql::EXTEND_LIST_FUNCTION
            ),
        }
    }
}

/// Stored list followed by the incoming items it lacks, re-encoded as `{a,b}`.
/// The stored value is kept as is when nothing new comes in.
fn extend_list(existing: &Value, incoming: &Value) -> Value {
    let Value::Text(incoming) = incoming else {
        return existing.clone();
    };
    let stored = match existing {
        Value::Text(raw) => list_items(raw),
        _ => Vec::new(),
    };
    let mut seen = HashSet::new();
    let mut merged: Vec<String> = stored
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect();
    let kept = merged.len();
    merged.extend(
        list_items(incoming)
            .into_iter()
            .filter(|item| seen.insert(item.clone())),
    );
    if merged.len() == kept {
        return existing.clone();
    }
    Value::Text(format!("{{{}}}", merged.join(",")))
}

/// Character length as SQLite's `length()` reports it.
fn sql_length(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Integer(i) => i.to_string().len(),
        Value::Real(f) => f.to_string().len(),
        Value::Text(s) => s.chars().count(),
        Value::Blob(b) => b.len(),
    }
}

/// How an incoming artist list is reconciled with the stored one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationMode {
    Replace,
    Extend,
    PreferNonNull,
}

impl AssociationMode {
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s {
            // `prefer_incoming` is the historic spelling of `replace`
            "replace" | "prefer_incoming" => Some(AssociationMode::Replace),
            "extend" => Some(AssociationMode::Extend),
            "prefer_non_null" => Some(AssociationMode::PreferNonNull),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssociationMode::Replace => "replace",
            AssociationMode::Extend => "extend",
            AssociationMode::PreferNonNull => "prefer_non_null",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Raw policy for one entity type, as written in a dataset manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default)]
    pub associations: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnPolicy {
    pub column: &'static BatchColumn,
    pub mode: ColumnMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationPolicy {
    pub column: &'static BatchColumn,
    pub association: &'static AssociationDef,
    pub mode: AssociationMode,
}

/// Policy narrowed to the columns of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub entity: EntityType,
    pub conflict_key: IdentifierKind,
    /// Present identifiers in precedence order, `conflict_key` first.
    pub conflict_keys: Vec<IdentifierKind>,
    /// Every present column stored on the entity row, in canonical order.
    /// The primary identifier appears only when fallback identifiers exist,
    /// filled under `prefer_non_null` for rows matched through a fallback.
    pub columns: Vec<ColumnPolicy>,
    pub association: Option<AssociationPolicy>,
}

impl ResolvedPolicy {
    pub fn column_mode(&self, name: &str) -> Option<ColumnMode> {
        self.columns
            .iter()
            .find(|p| p.column.name == name)
            .map(|p| p.mode)
    }
}

#[derive(Debug, Default)]
struct EntityPolicy {
    columns: HashMap<&'static str, ColumnMode>,
    association: Option<AssociationMode>,
}

/// Validated policies for all configured entity types.
#[derive(Debug, Default)]
pub struct PolicyResolver {
    entities: HashMap<EntityType, EntityPolicy>,
}

impl PolicyResolver {
    /// Validate raw configurations. Every mode string is checked here, so
    /// resolution never sees an unparsed mode.
    pub fn new<'a, I>(configs: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = (EntityType, &'a PolicyConfig)>,
    {
        let mut entities = HashMap::new();
        for (entity, config) in configs {
            entities.insert(entity, Self::validate_entity(entity, config)?);
        }
        Ok(PolicyResolver { entities })
    }

    fn validate_entity(
        entity: EntityType,
        config: &PolicyConfig,
    ) -> Result<EntityPolicy, ConfigurationError> {
        let mut policy = EntityPolicy::default();

        for (name, mode) in &config.columns {
            let column = entity
                .column(name)
                .ok_or_else(|| ConfigurationError::UnknownColumn {
                    entity,
                    column: name.clone(),
                })?;
            let parsed =
                ColumnMode::from_config_str(mode).ok_or_else(|| ConfigurationError::UnknownMode {
                    entity,
                    target: name.clone(),
                    mode: mode.clone(),
                })?;
            let supported = match (&column.kind, parsed) {
                (ColumnKind::ArtistList(_), _) => false,
                (ColumnKind::Reference(_), ColumnMode::PreferLonger) => false,
                (_, ColumnMode::Extend) => column.value_type == ValueType::TextList,
                (_, ColumnMode::PreferLonger) => {
                    matches!(column.value_type, ValueType::Text | ValueType::TextList)
                }
                _ => true,
            };
            if !supported {
                return Err(ConfigurationError::UnsupportedMode {
                    entity,
                    column: name.clone(),
                    mode: mode.clone(),
                });
            }
            policy.columns.insert(column.name, parsed);
        }

        if let Some(mode) = &config.associations {
            if entity.association().is_none() {
                return Err(ConfigurationError::UnsupportedMode {
                    entity,
                    column: "associations".to_string(),
                    mode: mode.clone(),
                });
            }
            let parsed = AssociationMode::from_config_str(mode).ok_or_else(|| {
                ConfigurationError::UnknownMode {
                    entity,
                    target: "associations".to_string(),
                    mode: mode.clone(),
                }
            })?;
            policy.association = Some(parsed);
        }

        Ok(policy)
    }

    /// Narrow the configured policy to `present` columns. Fails if a present
    /// column has no applicable policy.
    pub fn resolve<S: AsRef<str>>(
        &self,
        entity: EntityType,
        present: &[S],
    ) -> Result<ResolvedPolicy, ConfigurationError> {
        let mut seen = HashSet::new();
        for name in present {
            let name = name.as_ref();
            if entity.column(name).is_none() {
                return Err(ConfigurationError::UnknownColumn {
                    entity,
                    column: name.to_string(),
                });
            }
            if !seen.insert(name) {
                return Err(ConfigurationError::DuplicateColumn {
                    entity,
                    column: name.to_string(),
                });
            }
        }

        let conflict_keys: Vec<IdentifierKind> = IdentifierKind::PRECEDENCE
            .into_iter()
            .filter(|kind| seen.contains(kind.column_name()))
            .collect();
        let Some(&conflict_key) = conflict_keys.first() else {
            return Err(ConfigurationError::MissingIdentifier { entity });
        };

        let empty = EntityPolicy::default();
        let configured = self.entities.get(&entity).unwrap_or(&empty);

        let mut columns = Vec::new();
        let mut association = None;
        // canonical order keeps rendered statements stable across batches
        for column in entity.columns() {
            if !seen.contains(column.name) {
                continue;
            }
            if column.identifier() == Some(conflict_key) {
                if conflict_keys.len() > 1 {
                    columns.push(ColumnPolicy {
                        column,
                        mode: ColumnMode::PreferNonNull,
                    });
                }
                continue;
            }
            match &column.kind {
                ColumnKind::ArtistList(def) => {
                    let mode = configured.association.ok_or_else(|| {
                        ConfigurationError::MissingAssociationPolicy {
                            entity,
                            column: column.name.to_string(),
                        }
                    })?;
                    association = Some(AssociationPolicy {
                        column,
                        association: def,
                        mode,
                    });
                }
                _ => {
                    let mode = configured.columns.get(column.name).copied().ok_or_else(|| {
                        ConfigurationError::MissingColumnPolicy {
                            entity,
                            column: column.name.to_string(),
                        }
                    })?;
                    columns.push(ColumnPolicy { column, mode });
                }
            }
        }

        Ok(ResolvedPolicy {
            entity,
            conflict_key,
            conflict_keys,
            columns,
            association,
        })
    }
}
