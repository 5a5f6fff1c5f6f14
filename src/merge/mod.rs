//! The merge engine: policy-driven upserts of staged catalog batches, artist
//! association reconciliation, and a transactional preview-then-commit flow.

mod engine;
mod error;
mod executor;
mod plan;
mod policy;
mod reconcile;
mod sql;
mod staging;
mod stats;

pub use engine::MergeEngine;
pub use error::{ConfigurationError, MergeError, MergeExecutionError, OperationId, StagingError};
pub use executor::{
    AlwaysCommit, AlwaysRollback, ExecutedMerge, MergeDecision, MergeOutcome, MergeRun, Planned,
    Provenance, RunState, Staged, TableDelta, TableDeltas,
};
pub use plan::{MergeOperation, MergePlan, MergePlanner};
pub use policy::{
    AssociationMode, AssociationPolicy, ColumnMode, ColumnPolicy, PolicyConfig, PolicyResolver,
    ResolvedPolicy,
};
pub use reconcile::{list_items, parse_artist_list, reconcile, AssociationDiff, RetainedPair};
pub use sql::{register_functions, render, RenderedStatement, EXTEND_LIST_FUNCTION};
pub use staging::{parse_field, CsvIngestor, RowsIngestor, StagingIngestor, StagingTable};
pub use stats::{AssociationStats, MergeStats, SideEffectStats, StatsReporter};
