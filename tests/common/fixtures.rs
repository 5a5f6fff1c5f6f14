//! Test fixtures: temporary catalogs and in-memory batches

use super::constants::*;
use chrono::{DateTime, Utc};
use pezzottify_catalog_merge::catalog_store::{EntityType, IdentifierKind, SqliteCatalogStore};
use pezzottify_catalog_merge::merge::{
    parse_field, MergeDecision, MergeEngine, MergeOutcome, MergeStats, PolicyConfig,
    PolicyResolver, Provenance, RowsIngestor,
};
use rusqlite::types::Value;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A batch of staged rows for one entity type.
#[derive(Debug, Clone)]
pub struct Batch {
    pub entity: EntityType,
    pub columns: Vec<&'static str>,
    pub rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn ingestor(&self) -> RowsIngestor {
        RowsIngestor::new(self.rows.clone())
    }
}

/// Build a batch from raw CSV-like fields; `None` and `""` stage as NULL.
pub fn batch(entity: EntityType, columns: &[&'static str], rows: &[&[Option<&str>]]) -> Batch {
    let parsed = rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            columns
                .iter()
                .zip(row.iter())
                .map(|(name, raw)| {
                    let column = entity.column(name).expect("unknown test column");
                    parse_field(column, raw.unwrap_or(""), index + 1).expect("invalid test value")
                })
                .collect()
        })
        .collect();
    Batch {
        entity,
        columns: columns.to_vec(),
        rows: parsed,
    }
}

pub fn policy(columns: &[(&str, &str)], associations: Option<&str>) -> PolicyConfig {
    PolicyConfig {
        columns: columns
            .iter()
            .map(|(c, m)| (c.to_string(), m.to_string()))
            .collect(),
        associations: associations.map(str::to_string),
    }
}

pub fn resolver(entries: &[(EntityType, PolicyConfig)]) -> PolicyResolver {
    PolicyResolver::new(entries.iter().map(|(entity, config)| (*entity, config)))
        .expect("invalid test policy")
}

pub fn provenance() -> Provenance {
    let ingested_at = DateTime::parse_from_rfc3339(INGESTED_AT)
        .unwrap()
        .with_timezone(&Utc);
    Provenance::new(SOURCE_NAME, ingested_at)
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

/// A catalog database in a temporary directory, removed on drop.
pub struct TestCatalog {
    pub dir: TempDir,
    pub db_path: PathBuf,
    pub store: SqliteCatalogStore,
}

impl TestCatalog {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("catalog.db");
        let store = SqliteCatalogStore::open(&db_path).unwrap();
        TestCatalog {
            dir,
            db_path,
            store,
        }
    }

    pub fn conn(&self) -> &Connection {
        self.store.connection()
    }

    pub fn run(
        &self,
        resolver: PolicyResolver,
        batch: &Batch,
        decision: &dyn MergeDecision,
    ) -> MergeOutcome {
        MergeEngine::new(self.conn(), resolver)
            .run(
                batch.entity,
                &batch.columns,
                &mut batch.ingestor(),
                provenance(),
                decision,
            )
            .unwrap()
    }

    pub fn preview(&self, resolver: PolicyResolver, batch: &Batch) -> MergeStats {
        MergeEngine::new(self.conn(), resolver)
            .preview(batch.entity, &batch.columns, &mut batch.ingestor(), provenance())
            .unwrap()
    }

    pub fn id_of(&self, entity: EntityType, spotify_uri: &str) -> Option<i64> {
        self.store
            .find_id(entity, IdentifierKind::SpotifyUri, spotify_uri)
            .unwrap()
    }

    pub fn name_of(&self, entity: EntityType, spotify_uri: &str) -> Option<String> {
        let id = self.id_of(entity, spotify_uri)?;
        self.store.get_entity(entity, id).unwrap()?.name
    }

    /// Credited artists of an album or track as `(spotify_uri, position)`.
    pub fn credits(&self, entity: EntityType, spotify_uri: &str) -> Vec<(String, i64)> {
        let id = self
            .id_of(entity, spotify_uri)
            .expect("owner not in catalog");
        self.store
            .get_credited_artists(entity, id)
            .unwrap()
            .into_iter()
            .map(|(uri, position)| (uri.unwrap_or_default(), position))
            .collect()
    }

    pub fn count(&self, table: &str) -> i64 {
        self.conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }
}
