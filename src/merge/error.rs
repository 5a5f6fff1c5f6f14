use crate::catalog_store::EntityType;
use std::fmt;
use thiserror::Error;

/// Stable identity of a planned (or bookkeeping) operation, e.g.
/// `upsert_tracks` or `reconcile_track_artists`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        OperationId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raised before any statement executes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("unknown entity type '{0}'")]
    UnknownEntity(String),

    #[error("column '{column}' is not a known {entity} column")]
    UnknownColumn { entity: EntityType, column: String },

    #[error("column '{column}' appears more than once in the {entity} batch")]
    DuplicateColumn { entity: EntityType, column: String },

    #[error("{entity} batch carries neither spotify_uri nor mbid")]
    MissingIdentifier { entity: EntityType },

    #[error("no column policy for {entity}.{column}")]
    MissingColumnPolicy { entity: EntityType, column: String },

    #[error("no association policy for {entity}.{column}")]
    MissingAssociationPolicy { entity: EntityType, column: String },

    #[error("unknown policy mode '{mode}' for {entity}.{target}")]
    UnknownMode {
        entity: EntityType,
        target: String,
        mode: String,
    },

    #[error("policy mode '{mode}' cannot be applied to {entity}.{column}")]
    UnsupportedMode {
        entity: EntityType,
        column: String,
        mode: String,
    },
}

/// A planned operation failed; the run has been rolled back.
#[derive(Debug, Error)]
#[error("merge operation {operation} failed: {source}")]
pub struct MergeExecutionError {
    pub operation: OperationId,
    #[source]
    pub source: rusqlite::Error,
}

/// Failures while loading a batch into its staging table.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to read CSV {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("CSV {path} has no column '{column}'")]
    MissingCsvColumn { path: String, column: String },

    #[error("staging row {row} has {found} values, expected {expected}")]
    RowWidth {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("invalid value '{value}' for {column} at row {row}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },

    #[error("staging database error: {0}")]
    Database(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Execution(#[from] MergeExecutionError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}
