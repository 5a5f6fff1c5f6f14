//! Pezzottify Catalog Merge Library
//!
//! Policy-driven merging of dataset batches (artists, albums, tracks) into the
//! canonical SQLite catalog, with a dry run and change statistics before every
//! commit.

pub mod catalog_store;
pub mod cli_style;
pub mod config;
pub mod merge;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use catalog_store::{EntityType, SqliteCatalogStore};
pub use config::{CliConfig, FileConfig, MergeConfig};
pub use merge::{MergeEngine, MergeError, MergeOutcome, MergeStats, PolicyResolver, Provenance};
