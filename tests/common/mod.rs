//! Common test infrastructure
//!
//! Catalogs on temporary files, batch builders and policy helpers shared by
//! the end-to-end merge tests. Tests should only import from this module.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{batch, policy, resolver, TestCatalog, ARTIST_X};
//! use pezzottify_catalog_merge::catalog_store::EntityType;
//! use pezzottify_catalog_merge::merge::AlwaysCommit;
//!
//! #[test]
//! fn test_merge_one_artist() {
//!     let catalog = TestCatalog::new();
//!     let artists = batch(EntityType::Artist, &["spotify_uri", "name"], &[&[Some(ARTIST_X), Some("X")]]);
//!     let resolver = resolver(&[(EntityType::Artist, policy(&[("name", "prefer_incoming")], None))]);
//!     let outcome = catalog.run(resolver, &artists, &AlwaysCommit);
//!     assert_eq!(outcome.stats.new_rows, 1);
//! }
//! ```

#![allow(dead_code)]

mod constants;
mod fixtures;

pub use constants::*;
pub use fixtures::{batch, policy, provenance, resolver, write_file, Batch, TestCatalog};
