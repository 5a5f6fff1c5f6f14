//! Change statistics.
//!
//! Two independent derivations produce the same [`MergeStats`]:
//! [`StatsReporter::predict`] reads the catalog and staging before anything
//! runs and applies the column and association rules in Rust, while
//! [`StatsReporter::observe`] diffs snapshots taken inside the executed,
//! uncommitted transaction.

use super::plan::MergePlan;
use super::policy::AssociationMode;
use super::reconcile::{parse_artist_list, reconcile};
use super::sql::{self, IncomingPairs};
use super::staging::StagingTable;
use crate::catalog_store::{ColumnKind, EntityType, IdentifierKind};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssociationStats {
    pub table: &'static str,
    pub current_total: u64,
    pub total_after: u64,
    /// Pairs that never existed before.
    pub new: u64,
    /// Incoming pairs that already existed.
    pub recreated: u64,
    pub deleted: u64,
    /// Kept pairs whose position changed.
    pub repositioned: u64,
    pub entities_with_changes: u64,
}

/// Placeholder rows created in another table as a side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SideEffectStats {
    pub table: &'static str,
    pub source_column: &'static str,
    pub placeholders_created: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub entity: EntityType,
    pub staging_rows: u64,
    /// Staging rows without any usable identifier.
    pub excluded_rows: u64,
    /// Staging rows superseded by another row addressing the same identifier.
    pub collapsed_rows: u64,
    pub main_rows_before: u64,
    pub main_rows_after: u64,
    pub new_rows: u64,
    pub existing_rows: u64,
    pub updated_rows: u64,
    pub unchanged_rows: u64,
    pub column_changes: BTreeMap<String, u64>,
    pub associations: Option<AssociationStats>,
    pub side_effects: Vec<SideEffectStats>,
}

impl MergeStats {
    fn from_staging(staging: &StagingTable<'_>, plan: &MergePlan) -> rusqlite::Result<Self> {
        let keys = plan.conflict_keys.as_slice();
        let staging_rows = staging.row_count()? as u64;
        let excluded_rows = staging.excluded_count(keys)? as u64;
        let effective = staging.effective_count(keys)? as u64;
        Ok(MergeStats {
            entity: plan.entity,
            staging_rows,
            excluded_rows,
            collapsed_rows: staging_rows - excluded_rows - effective,
            main_rows_before: 0,
            main_rows_after: 0,
            new_rows: 0,
            existing_rows: 0,
            updated_rows: 0,
            unchanged_rows: 0,
            column_changes: plan
                .upsert_columns()
                .iter()
                .map(|p| (p.column.name.to_string(), 0))
                .collect(),
            associations: None,
            side_effects: Vec::new(),
        })
    }

    /// Staging rows the merge acted on.
    pub fn effective_rows(&self) -> u64 {
        self.new_rows + self.existing_rows
    }

    /// `part` as a percentage of the effective rows.
    pub fn share(&self, part: u64) -> f64 {
        match self.effective_rows() {
            0 => 0.0,
            total => part as f64 * 100.0 / total as f64,
        }
    }

    pub fn placeholders_created(&self) -> u64 {
        self.side_effects.iter().map(|s| s.placeholders_created).sum()
    }
}

// =============================================================================
// Reporter
// =============================================================================

/// Artist or album as seen before execution: stored already, or to be created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Handle {
    Existing(i64),
    Pending(String),
}

impl Handle {
    fn as_value(&self) -> Value {
        match self {
            Handle::Existing(id) => Value::Integer(*id),
            // never equal to a stored id nor to NULL
            Handle::Pending(key) => Value::Text(key.clone()),
        }
    }
}

fn value_as_key(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) if !s.is_empty() => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
    Ok(n as u64)
}

fn count(conn: &Connection, sql: &str) -> rusqlite::Result<u64> {
    let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
    Ok(n as u64)
}

fn lookup(
    conn: &Connection,
    entity: EntityType,
    kind: IdentifierKind,
    value: &str,
) -> rusqlite::Result<Option<i64>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT id FROM {} WHERE {} = ?1",
        entity.table_name(),
        kind.column_name()
    ))?;
    stmt.query_row(params![value], |r| r.get(0)).optional()
}

struct StagedRow {
    /// Identifier values in conflict key order.
    keys: Vec<Option<String>>,
    values: Vec<Value>,
    list: Option<String>,
}

fn blank_as_null(value: Value) -> Value {
    match value {
        Value::Text(s) if s.is_empty() => Value::Null,
        other => other,
    }
}

/// Names of the snapshot tables taken inside an executed merge.
pub(crate) struct Snapshot {
    entity_table: String,
    association_table: Option<String>,
}

impl Snapshot {
    pub(crate) fn drop_tables(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(&format!("DROP TABLE IF EXISTS temp.{}", self.entity_table), [])?;
        if let Some(table) = &self.association_table {
            conn.execute(&format!("DROP TABLE IF EXISTS temp.{}", table), [])?;
        }
        Ok(())
    }
}

/// Ids of the main-table rows the effective staging rows address.
fn touched_ids(plan: &MergePlan) -> String {
    let keys = plan.conflict_keys.as_slice();
    format!(
        "SELECT {} FROM {} s WHERE s.rowid IN ({})",
        sql::matched_id(plan.entity.table_name(), keys, "s"),
        plan.staging_table,
        sql::effective_rows(&plan.staging_table, keys)
    )
}

pub struct StatsReporter;

impl StatsReporter {
    /// Predict the statistics of executing `plan` without writing anything.
    pub fn predict(staging: &StagingTable<'_>, plan: &MergePlan) -> rusqlite::Result<MergeStats> {
        let conn = staging.connection();
        let keys = plan.conflict_keys.as_slice();
        let main = plan.entity.table_name();
        let columns = plan.upsert_columns();
        let association = plan.association();

        let mut stats = MergeStats::from_staging(staging, plan)?;
        stats.main_rows_before = count_rows(conn, main)?;

        let mut select: Vec<String> = keys
            .iter()
            .map(|k| format!("s.{}", k.column_name()))
            .collect();
        select.extend(columns.iter().map(|p| format!("s.{}", p.column.name)));
        if let Some(association) = association {
            select.push(format!("s.{}", association.column.name));
        }
        let rows: Vec<StagedRow> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} s WHERE s.rowid IN ({}) ORDER BY s.rowid",
                select.join(", "),
                plan.staging_table,
                sql::effective_rows(&plan.staging_table, keys)
            ))?;
            let offset = keys.len();
            let width = columns.len();
            let rows = stmt
                .query_map([], |r| {
                    let mut identifiers = Vec::with_capacity(offset);
                    for i in 0..offset {
                        let value = r.get::<_, Option<String>>(i)?;
                        identifiers.push(value.filter(|v| !v.is_empty()));
                    }
                    let mut values = Vec::with_capacity(width);
                    for (i, policy) in columns.iter().enumerate() {
                        let value = r.get::<_, Value>(offset + i)?;
                        values.push(match policy.column.kind {
                            ColumnKind::Identifier(_) => blank_as_null(value),
                            _ => value,
                        });
                    }
                    let list = if association.is_some() {
                        r.get::<_, Option<String>>(offset + width)?
                    } else {
                        None
                    };
                    Ok(StagedRow {
                        keys: identifiers,
                        values,
                        list,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let stored: String = columns
            .iter()
            .filter_map(|p| p.column.stored_as())
            .map(|c| format!(", {c}"))
            .collect();
        let mut existing_stmts = keys
            .iter()
            .map(|k| {
                conn.prepare(&format!(
                    "SELECT id{stored} FROM {main} WHERE {} = ?1",
                    k.column_name()
                ))
            })
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let placeholder_targets: Vec<_> = plan.placeholder_targets().collect();
        let mut missing: Vec<BTreeSet<String>> = vec![BTreeSet::new(); placeholder_targets.len()];
        let mut association_stats = association.map(|a| AssociationStats {
            table: a.association.table,
            current_total: 0,
            total_after: 0,
            new: 0,
            recreated: 0,
            deleted: 0,
            repositioned: 0,
            entities_with_changes: 0,
        });

        for row in rows {
            let mut incoming = Vec::with_capacity(row.values.len());
            for (policy, value) in columns.iter().zip(&row.values) {
                match &policy.column.kind {
                    ColumnKind::Reference(reference) => match value_as_key(value) {
                        None => incoming.push(Value::Null),
                        Some(target_key) => {
                            let found =
                                lookup(conn, reference.target, reference.target_key, &target_key)?;
                            let handle = match found {
                                Some(id) => Handle::Existing(id),
                                None => {
                                    let slot = placeholder_targets
                                        .iter()
                                        .position(|(_, source)| source.name == policy.column.name);
                                    if let Some(slot) = slot {
                                        missing[slot].insert(target_key.clone());
                                    }
                                    Handle::Pending(target_key)
                                }
                            };
                            incoming.push(handle.as_value());
                        }
                    },
                    _ => incoming.push(value.clone()),
                }
            }

            // same order as the upsert's conflict clauses
            let mut existing = None;
            for (stmt, key) in existing_stmts.iter_mut().zip(&row.keys) {
                let Some(key) = key else {
                    continue;
                };
                existing = stmt
                    .query_row(params![key], |r| {
                        let id: i64 = r.get(0)?;
                        let mut values = Vec::with_capacity(incoming.len());
                        for i in 0..incoming.len() {
                            values.push(r.get::<_, Value>(i + 1)?);
                        }
                        Ok((id, values))
                    })
                    .optional()?;
                if existing.is_some() {
                    break;
                }
            }

            let owner_id = match &existing {
                None => {
                    stats.new_rows += 1;
                    None
                }
                Some((id, old_values)) => {
                    stats.existing_rows += 1;
                    let mut changed = false;
                    for ((policy, old), new) in columns.iter().zip(old_values).zip(&incoming) {
                        if policy.mode.choose(old, new) != *old {
                            *stats
                                .column_changes
                                .entry(policy.column.name.to_string())
                                .or_insert(0) += 1;
                            changed = true;
                        }
                    }
                    if changed {
                        stats.updated_rows += 1;
                    }
                    Some(*id)
                }
            };

            if let (Some(policy), Some(totals)) = (association, association_stats.as_mut()) {
                let def = policy.association;
                let current: Vec<(Handle, i64)> = match owner_id {
                    None => Vec::new(),
                    Some(owner_id) => {
                        let mut stmt = conn.prepare_cached(&format!(
                            "SELECT {}, position FROM {} WHERE {} = ?1",
                            def.artist_column, def.table, def.owner_column
                        ))?;
                        let pairs = stmt
                            .query_map(params![owner_id], |r| {
                                Ok((Handle::Existing(r.get(0)?), r.get(1)?))
                            })?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        pairs
                    }
                };

                let slot = placeholder_targets
                    .iter()
                    .position(|(_, source)| source.name == policy.column.name);
                let mut incoming_pairs = Vec::new();
                for (artist_key, idx) in parse_artist_list(row.list.as_deref().unwrap_or("")) {
                    let handle = match lookup(conn, def.target, def.target_key, &artist_key)? {
                        Some(id) => Handle::Existing(id),
                        None => {
                            if let Some(slot) = slot {
                                missing[slot].insert(artist_key.clone());
                            }
                            Handle::Pending(artist_key)
                        }
                    };
                    incoming_pairs.push((handle, idx));
                }

                let diff = reconcile(policy.mode, &current, &incoming_pairs);
                totals.new += diff.inserted.len() as u64;
                totals.deleted += diff.deleted.len() as u64;
                totals.recreated += diff.recreated as u64;
                totals.repositioned += diff.repositioned() as u64;
                if diff.has_changes() {
                    totals.entities_with_changes += 1;
                }
            }
        }

        if let Some(totals) = association_stats.as_mut() {
            totals.current_total = count_rows(conn, totals.table)?;
            totals.total_after = totals.current_total + totals.new - totals.deleted;
        }

        stats.main_rows_after = stats.main_rows_before + stats.new_rows;
        stats.unchanged_rows = stats.existing_rows - stats.updated_rows;
        stats.associations = association_stats;
        stats.side_effects = placeholder_targets
            .iter()
            .zip(&missing)
            .map(|((target, source), keys)| SideEffectStats {
                table: target.table_name(),
                source_column: source.name,
                placeholders_created: keys.len() as u64,
            })
            .collect();
        Ok(stats)
    }

    /// Snapshot the rows and associations the run can touch. Must run inside
    /// the merge transaction, before any operation.
    pub(crate) fn snapshot(conn: &Connection, plan: &MergePlan) -> rusqlite::Result<Snapshot> {
        let main = plan.entity.table_name();
        let entity_table = format!("merge_before_{main}");
        let stored: String = plan
            .upsert_columns()
            .iter()
            .filter_map(|p| p.column.stored_as())
            .map(|c| format!(", {c}"))
            .collect();

        conn.execute(&format!("DROP TABLE IF EXISTS temp.{entity_table}"), [])?;
        conn.execute(
            &format!(
                "CREATE TEMP TABLE {entity_table} AS \
                 SELECT id{stored} FROM {main} WHERE id IN ({touched})",
                touched = touched_ids(plan),
            ),
            [],
        )?;

        let association_table = match plan.association() {
            None => None,
            Some(policy) => {
                let def = policy.association;
                let name = format!("merge_before_{}", def.table);
                conn.execute(&format!("DROP TABLE IF EXISTS temp.{name}"), [])?;
                conn.execute(
                    &format!(
                        "CREATE TEMP TABLE {name} AS \
                         SELECT {owner} AS owner_id, {artist} AS artist_id, position \
                         FROM {table} WHERE {owner} IN (SELECT id FROM {entity_table})",
                        owner = def.owner_column,
                        artist = def.artist_column,
                        table = def.table,
                    ),
                    [],
                )?;
                Some(name)
            }
        };

        Ok(Snapshot {
            entity_table,
            association_table,
        })
    }

    /// Derive the statistics of an executed, uncommitted merge.
    /// `counts_before` holds the row counts of [`MergePlan::affected_tables`]
    /// taken before the first operation.
    pub(crate) fn observe(
        conn: &Connection,
        staging: &StagingTable<'_>,
        plan: &MergePlan,
        snapshot: &Snapshot,
        counts_before: &BTreeMap<&'static str, u64>,
    ) -> rusqlite::Result<MergeStats> {
        let main = plan.entity.table_name();
        let before = &snapshot.entity_table;
        let before_count = |table: &str| counts_before.get(table).copied().unwrap_or(0);

        let mut stats = MergeStats::from_staging(staging, plan)?;
        stats.main_rows_before = before_count(main);
        stats.main_rows_after = count_rows(conn, main)?;
        stats.new_rows = stats.main_rows_after - stats.main_rows_before;
        stats.existing_rows = count_rows(conn, before)?;

        let mut any_changed = Vec::new();
        for policy in plan.upsert_columns() {
            let Some(stored) = policy.column.stored_as() else {
                continue;
            };
            let changed = count(
                conn,
                &format!(
                    "SELECT COUNT(*) FROM {before} b JOIN {main} m ON m.id = b.id \
                     WHERE b.{stored} IS NOT m.{stored}"
                ),
            )?;
            stats
                .column_changes
                .insert(policy.column.name.to_string(), changed);
            any_changed.push(format!("b.{stored} IS NOT m.{stored}"));
        }
        if !any_changed.is_empty() {
            stats.updated_rows = count(
                conn,
                &format!(
                    "SELECT COUNT(*) FROM {before} b JOIN {main} m ON m.id = b.id WHERE {}",
                    any_changed.join(" OR ")
                ),
            )?;
        }
        stats.unchanged_rows = stats.existing_rows - stats.updated_rows;

        if let (Some(policy), Some(before_pairs)) =
            (plan.association(), &snapshot.association_table)
        {
            let def = policy.association;
            let table = def.table;
            let owner = def.owner_column;
            let artist = def.artist_column;
            let touched = touched_ids(plan);
            let added = format!(
                "SELECT j.{owner} AS owner_id FROM {table} j \
                 WHERE j.{owner} IN ({touched}) AND NOT EXISTS ( \
                     SELECT 1 FROM {before_pairs} b \
                     WHERE b.owner_id = j.{owner} AND b.artist_id = j.{artist})"
            );
            let removed = format!(
                "SELECT b.owner_id FROM {before_pairs} b WHERE NOT EXISTS ( \
                     SELECT 1 FROM {table} j \
                     WHERE j.{owner} = b.owner_id AND j.{artist} = b.artist_id)"
            );
            let moved = format!(
                "SELECT b.owner_id FROM {before_pairs} b JOIN {table} j \
                 ON j.{owner} = b.owner_id AND j.{artist} = b.artist_id \
                 WHERE j.position <> b.position"
            );

            let recreated = match policy.mode {
                AssociationMode::PreferNonNull => 0,
                AssociationMode::Replace | AssociationMode::Extend => {
                    let pairs = IncomingPairs::new(plan, policy.column, def);
                    count(
                        conn,
                        &format!(
                            "WITH RECURSIVE {} SELECT COUNT(*) FROM incoming i \
                             JOIN {before_pairs} b \
                             ON b.owner_id = i.owner_id AND b.artist_id = i.artist_id",
                            pairs.ctes()
                        ),
                    )?
                }
            };

            stats.associations = Some(AssociationStats {
                table,
                current_total: before_count(table),
                total_after: count_rows(conn, table)?,
                new: count(conn, &format!("SELECT COUNT(*) FROM ({added})"))?,
                recreated,
                deleted: count(conn, &format!("SELECT COUNT(*) FROM ({removed})"))?,
                repositioned: count(conn, &format!("SELECT COUNT(*) FROM ({moved})"))?,
                entities_with_changes: count(
                    conn,
                    &format!(
                        "SELECT COUNT(DISTINCT owner_id) FROM \
                         ({added} UNION ALL {removed} UNION ALL {moved})"
                    ),
                )?,
            });
        }

        for (target, source) in plan.placeholder_targets() {
            let table = target.table_name();
            stats.side_effects.push(SideEffectStats {
                table,
                source_column: source.name,
                placeholders_created: count_rows(conn, table)? - before_count(table),
            });
        }

        Ok(stats)
    }
}
