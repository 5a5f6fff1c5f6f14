use super::error::MergeError;
use super::executor::{MergeDecision, MergeOutcome, MergeRun, Provenance};
use super::policy::PolicyResolver;
use super::staging::{StagingIngestor, StagingTable};
use super::stats::MergeStats;
use crate::catalog_store::EntityType;
use rusqlite::Connection;
use tracing::info;

/// Runs whole merges against one connection: policy check, staging, planning,
/// execution and the commit decision.
pub struct MergeEngine<'c> {
    conn: &'c Connection,
    resolver: PolicyResolver,
}

impl<'c> MergeEngine<'c> {
    pub fn new(conn: &'c Connection, resolver: PolicyResolver) -> Self {
        MergeEngine { conn, resolver }
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    /// Merge one batch of `entity` rows with the given `columns`.
    ///
    /// The policy is resolved before the staging table is created, so a
    /// configuration error leaves the database untouched.
    pub fn run<S: AsRef<str>>(
        &self,
        entity: EntityType,
        columns: &[S],
        ingestor: &mut dyn StagingIngestor,
        provenance: Provenance,
        decision: &dyn MergeDecision,
    ) -> Result<MergeOutcome, MergeError> {
        self.resolver.resolve(entity, columns)?;

        let staging = StagingTable::create(self.conn, entity, columns)?;
        staging.load(ingestor)?;

        let executed = MergeRun::staged(&staging, provenance)
            .plan(&self.resolver)?
            .execute()?;
        let outcome = executed.decide(decision)?;
        info!(
            "Merge of {} finished as {}",
            entity,
            outcome.state.as_str()
        );
        Ok(outcome)
    }

    /// Predict the statistics of merging a batch without executing it.
    pub fn preview<S: AsRef<str>>(
        &self,
        entity: EntityType,
        columns: &[S],
        ingestor: &mut dyn StagingIngestor,
        provenance: Provenance,
    ) -> Result<MergeStats, MergeError> {
        self.resolver.resolve(entity, columns)?;

        let staging = StagingTable::create(self.conn, entity, columns)?;
        staging.load(ingestor)?;

        MergeRun::staged(&staging, provenance)
            .plan(&self.resolver)?
            .predict()
    }
}
