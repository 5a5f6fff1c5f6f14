//! Dry-run executor.
//!
//! A run moves through `Staged -> Planned -> Executed -> {Committed | RolledBack}`.
//! The first three states are distinct types, so an uncommitted merge can only
//! be finished through [`ExecutedMerge::commit`], [`ExecutedMerge::rollback`] or
//! [`ExecutedMerge::decide`]. Dropping it undecided rolls back.

use super::error::{ConfigurationError, MergeError, MergeExecutionError, OperationId};
use super::plan::{MergePlan, MergePlanner};
use super::policy::PolicyResolver;
use super::sql;
use super::staging::StagingTable;
use super::stats::{MergeStats, StatsReporter};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{named_params, Connection, Transaction};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Who wrote a row, and when. Stamped on every row a run touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub source_name: String,
    pub ingested_at: DateTime<Utc>,
}

impl Provenance {
    pub fn new(source_name: impl Into<String>, ingested_at: DateTime<Utc>) -> Self {
        Provenance {
            source_name: source_name.into(),
            ingested_at,
        }
    }

    /// Stored representation of `ingested_at`.
    pub fn ingested_at_str(&self) -> String {
        self.ingested_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Staged,
    Planned,
    Executed,
    Committed,
    RolledBack,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Staged => "staged",
            RunState::Planned => "planned",
            RunState::Executed => "executed",
            RunState::Committed => "committed",
            RunState::RolledBack => "rolled_back",
        }
    }
}

// =============================================================================
// Row count deltas
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDelta {
    pub table: &'static str,
    pub before: u64,
    pub after: u64,
}

impl TableDelta {
    pub fn delta(&self) -> i64 {
        self.after as i64 - self.before as i64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableDeltas {
    pub tables: Vec<TableDelta>,
}

impl TableDeltas {
    fn between(
        before: &BTreeMap<&'static str, u64>,
        after: &BTreeMap<&'static str, u64>,
        order: &[&'static str],
    ) -> Self {
        TableDeltas {
            tables: order
                .iter()
                .map(|&table| TableDelta {
                    table,
                    before: before.get(table).copied().unwrap_or(0),
                    after: after.get(table).copied().unwrap_or(0),
                })
                .collect(),
        }
    }

    pub fn get(&self, table: &str) -> Option<&TableDelta> {
        self.tables.iter().find(|d| d.table == table)
    }

    pub fn is_zero(&self) -> bool {
        self.tables.iter().all(|d| d.delta() == 0)
    }
}

fn count_tables(
    conn: &Connection,
    tables: &[&'static str],
) -> rusqlite::Result<BTreeMap<&'static str, u64>> {
    let mut counts = BTreeMap::new();
    for table in tables {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        counts.insert(*table, n as u64);
    }
    Ok(counts)
}

/// [`count_tables`] inside the run transaction, failing as operation `count_<entity>`.
fn count_in_run(
    tx: &Transaction<'_>,
    plan: &MergePlan,
    tables: &[&'static str],
) -> Result<BTreeMap<&'static str, u64>, MergeExecutionError> {
    count_tables(tx, tables).map_err(|source| MergeExecutionError {
        operation: OperationId::new(format!("count_{}", plan.entity.table_name())),
        source,
    })
}

// =============================================================================
// Decision port
// =============================================================================

/// Decides whether an executed merge is committed, given its statistics.
pub trait MergeDecision {
    fn confirm(&self, stats: &MergeStats) -> bool;
}

impl<F> MergeDecision for F
where
    F: Fn(&MergeStats) -> bool,
{
    fn confirm(&self, stats: &MergeStats) -> bool {
        self(stats)
    }
}

pub struct AlwaysCommit;

impl MergeDecision for AlwaysCommit {
    fn confirm(&self, _stats: &MergeStats) -> bool {
        true
    }
}

pub struct AlwaysRollback;

impl MergeDecision for AlwaysRollback {
    fn confirm(&self, _stats: &MergeStats) -> bool {
        false
    }
}

// =============================================================================
// Run states
// =============================================================================

pub struct Staged;

pub struct Planned {
    plan: MergePlan,
}

pub struct MergeRun<'a, S> {
    staging: &'a StagingTable<'a>,
    provenance: Provenance,
    run_id: Uuid,
    state: S,
}

impl<S> MergeRun<'_, S> {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}

impl<'a> MergeRun<'a, Staged> {
    pub fn staged(staging: &'a StagingTable<'a>, provenance: Provenance) -> Self {
        MergeRun {
            staging,
            provenance,
            run_id: Uuid::new_v4(),
            state: Staged,
        }
    }

    pub fn state(&self) -> RunState {
        RunState::Staged
    }

    /// Resolve the policy for the staged columns and plan the merge.
    pub fn plan(
        self,
        resolver: &PolicyResolver,
    ) -> Result<MergeRun<'a, Planned>, ConfigurationError> {
        let policy = resolver.resolve(self.staging.entity(), &self.staging.column_names())?;
        let plan = MergePlanner::plan(&policy, self.staging.name());
        for operation in &plan.operations {
            debug!("[{}] planned {}", self.run_id, operation);
        }
        Ok(MergeRun {
            staging: self.staging,
            provenance: self.provenance,
            run_id: self.run_id,
            state: Planned { plan },
        })
    }
}

impl<'a> MergeRun<'a, Planned> {
    pub fn state(&self) -> RunState {
        RunState::Planned
    }

    pub fn merge_plan(&self) -> &MergePlan {
        &self.state.plan
    }

    /// Statistics the merge would produce, computed without writing.
    pub fn predict(&self) -> Result<MergeStats, MergeError> {
        Ok(StatsReporter::predict(self.staging, &self.state.plan)?)
    }

    /// Run every planned operation inside one transaction and leave it open.
    pub fn execute(self) -> Result<ExecutedMerge<'a>, MergeError> {
        let plan = self.state.plan;
        let tx = self.staging.connection().unchecked_transaction()?;

        match Self::apply(&tx, self.staging, &plan, &self.provenance) {
            Ok((stats, deltas)) => {
                info!(
                    "[{}] Executed merge of {} (uncommitted): {} new, {} updated, {} unchanged",
                    self.run_id,
                    plan.entity,
                    stats.new_rows,
                    stats.updated_rows,
                    stats.unchanged_rows
                );
                Ok(ExecutedMerge {
                    tx: Some(tx),
                    staging: self.staging,
                    plan,
                    provenance: self.provenance,
                    run_id: self.run_id,
                    stats,
                    deltas,
                })
            }
            Err(e) => {
                warn!(
                    "[{}] Merge of {} failed, rolling back: {}",
                    self.run_id, plan.entity, e
                );
                if let Err(rollback_err) = tx.rollback() {
                    warn!("[{}] Rollback failed: {}", self.run_id, rollback_err);
                }
                Err(e)
            }
        }
    }

    fn apply(
        tx: &Transaction<'_>,
        staging: &StagingTable<'_>,
        plan: &MergePlan,
        provenance: &Provenance,
    ) -> Result<(MergeStats, TableDeltas), MergeError> {
        let entity = plan.entity.table_name();
        let tables = plan.affected_tables();
        let counts_before = count_in_run(tx, plan, &tables)?;

        let snapshot = StatsReporter::snapshot(tx, plan).map_err(|source| MergeExecutionError {
            operation: OperationId::new(format!("snapshot_{entity}")),
            source,
        })?;

        let source_name = provenance.source_name.as_str();
        let ingested_at = provenance.ingested_at_str();
        for operation in &plan.operations {
            let mut affected = 0;
            for statement in sql::render(plan, operation) {
                debug!("{}: {}", operation.id(), statement.sql);
                let result = if statement.binds_provenance {
                    tx.execute(
                        &statement.sql,
                        named_params! {
                            ":source_name": source_name,
                            ":ingested_at": ingested_at,
                        },
                    )
                } else {
                    tx.execute(&statement.sql, [])
                };
                affected += result.map_err(|source| MergeExecutionError {
                    operation: operation.id().clone(),
                    source,
                })?;
            }
            info!("{} affected {} rows", operation.id(), affected);
        }

        let stats = StatsReporter::observe(tx, staging, plan, &snapshot, &counts_before)
            .and_then(|stats| snapshot.drop_tables(tx).map(|_| stats))
            .map_err(|source| MergeExecutionError {
                operation: OperationId::new(format!("observe_{entity}")),
                source,
            })?;

        let counts_after = count_in_run(tx, plan, &tables)?;
        Ok((
            stats,
            TableDeltas::between(&counts_before, &counts_after, &tables),
        ))
    }
}

/// A merge whose statements ran inside a still-open transaction.
pub struct ExecutedMerge<'a> {
    tx: Option<Transaction<'a>>,
    staging: &'a StagingTable<'a>,
    plan: MergePlan,
    provenance: Provenance,
    run_id: Uuid,
    stats: MergeStats,
    deltas: TableDeltas,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub run_id: Uuid,
    pub state: RunState,
    pub provenance: Provenance,
    pub stats: MergeStats,
    /// Row counts before the run against counts after the decision.
    pub deltas: TableDeltas,
}

impl MergeOutcome {
    pub fn committed(&self) -> bool {
        self.state == RunState::Committed
    }
}

impl<'a> ExecutedMerge<'a> {
    pub fn state(&self) -> RunState {
        RunState::Executed
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn stats(&self) -> &MergeStats {
        &self.stats
    }

    /// Row counts inside the uncommitted transaction.
    pub fn deltas(&self) -> &TableDeltas {
        &self.deltas
    }

    pub fn merge_plan(&self) -> &MergePlan {
        &self.plan
    }

    pub fn commit(mut self) -> Result<MergeOutcome, MergeError> {
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
        }
        info!("[{}] Committed merge of {}", self.run_id, self.plan.entity);
        self.finish(RunState::Committed)
    }

    pub fn rollback(mut self) -> Result<MergeOutcome, MergeError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback()?;
        }
        info!("[{}] Rolled back merge of {}", self.run_id, self.plan.entity);
        self.finish(RunState::RolledBack)
    }

    /// Ask `decision` once and commit or roll back accordingly.
    pub fn decide(self, decision: &dyn MergeDecision) -> Result<MergeOutcome, MergeError> {
        if decision.confirm(&self.stats) {
            self.commit()
        } else {
            self.rollback()
        }
    }

    fn finish(&self, state: RunState) -> Result<MergeOutcome, MergeError> {
        let tables = self.plan.affected_tables();
        let before: BTreeMap<&'static str, u64> =
            self.deltas.tables.iter().map(|d| (d.table, d.before)).collect();
        let after = count_tables(self.staging.connection(), &tables)?;
        Ok(MergeOutcome {
            run_id: self.run_id,
            state,
            provenance: self.provenance.clone(),
            stats: self.stats.clone(),
            deltas: TableDeltas::between(&before, &after, &tables),
        })
    }
}

impl Drop for ExecutedMerge<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!(
                "[{}] Executed merge of {} dropped without a decision, rolling back",
                self.run_id, self.plan.entity
            );
            if let Err(e) = tx.rollback() {
                warn!("[{}] Rollback failed: {}", self.run_id, e);
            }
        }
    }
}
