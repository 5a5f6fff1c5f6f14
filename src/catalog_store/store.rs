//! SQLite-backed canonical catalog.
//!
//! The store owns schema bootstrap and a handful of read helpers. All writes to
//! the canonical tables go through the merge engine, which borrows the
//! connection.

use super::models::*;
use super::schema::CATALOG_VERSIONED_SCHEMAS;
use crate::merge::register_functions;
use crate::sqlite_persistence::{VersionedSchema, BASE_DB_VERSION};
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

/// A canonical entity row as stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: i64,
    pub spotify_uri: Option<String>,
    pub mbid: Option<String>,
    pub name: Option<String>,
    pub source_name: Option<String>,
    pub ingested_at: Option<String>,
}

pub struct SqliteCatalogStore {
    conn: Connection,
}

fn migrate_if_needed(conn: &mut Connection, schemas: &[VersionedSchema]) -> Result<()> {
    let db_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    let Some(latest_schema) = schemas.last() else {
        bail!("No catalog schema versions defined");
    };
    let latest_version = latest_schema.version;

    let table_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |r| r.get(0),
    )?;

    if table_count == 0 {
        info!("Creating catalog db schema at version {}", latest_version);
        latest_schema.create(conn)?;
        return Ok(());
    }

    if db_version < BASE_DB_VERSION as i64 {
        bail!(
            "Database user_version {} is not a catalog schema version",
            db_version
        );
    }

    let mut current_version = (db_version - BASE_DB_VERSION as i64) as usize;
    if current_version >= latest_version {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for schema in schemas.iter().skip(current_version + 1) {
        if let Some(migration_fn) = schema.migration {
            info!(
                "Migrating catalog db from version {} to {}",
                current_version, schema.version
            );
            migration_fn(&tx)?;
            current_version = schema.version;
        }
    }
    tx.pragma_update(None, "user_version", BASE_DB_VERSION + current_version)?;
    tx.commit()?;
    Ok(())
}

impl SqliteCatalogStore {
    /// Open (creating if needed) the catalog database at `db_path` and
    /// validate its schema.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let mut conn = Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open catalog database {:?}", db_path))?;

        Self::prepare_connection(&mut conn)?;
        let store = SqliteCatalogStore { conn };

        let counts = store.counts()?;
        info!(
            "Opened catalog: {} artists, {} albums, {} tracks",
            counts.artists, counts.albums, counts.tracks
        );
        Ok(store)
    }

    /// Fresh in-memory catalog, used by tests and dry experiments.
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::prepare_connection(&mut conn)?;
        Ok(SqliteCatalogStore { conn })
    }

    fn prepare_connection(conn: &mut Connection) -> Result<()> {
        migrate_if_needed(conn, CATALOG_VERSIONED_SCHEMAS)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if let Some(latest_schema) = CATALOG_VERSIONED_SCHEMAS.last() {
            latest_schema
                .validate(conn)
                .context("Catalog schema validation failed")?;
        }
        register_functions(conn).context("Failed to register catalog SQL functions")?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn counts(&self) -> Result<CatalogCounts> {
        let count = |table: &str| -> Result<usize> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
            Ok(n as usize)
        };
        Ok(CatalogCounts {
            artists: count("artists")?,
            albums: count("albums")?,
            tracks: count("tracks")?,
            album_artists: count("album_artists")?,
            track_artists: count("track_artists")?,
        })
    }

    /// Look up an entity's surrogate id by external identifier.
    pub fn find_id(
        &self,
        entity: EntityType,
        kind: IdentifierKind,
        value: &str,
    ) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                &format!(
                    "SELECT id FROM {} WHERE {} = ?1",
                    entity.table_name(),
                    kind.column_name()
                ),
                params![value],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn get_entity(&self, entity: EntityType, id: i64) -> Result<Option<EntityRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, spotify_uri, mbid, name, source_name, ingested_at FROM {} WHERE id = ?1",
                    entity.table_name()
                ),
                params![id],
                |row| {
                    Ok(EntityRecord {
                        id: row.get(0)?,
                        spotify_uri: row.get(1)?,
                        mbid: row.get(2)?,
                        name: row.get(3)?,
                        source_name: row.get(4)?,
                        ingested_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Credited artists of an album or track as `(artist spotify_uri, position)`,
    /// ordered by position.
    pub fn get_credited_artists(
        &self,
        entity: EntityType,
        owner_id: i64,
    ) -> Result<Vec<(Option<String>, i64)>> {
        let Some(association) = entity.association() else {
            bail!("{} have no artist associations", entity);
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT a.spotify_uri, j.position FROM {table} j \
             JOIN artists a ON a.id = j.{artist} \
             WHERE j.{owner} = ?1 ORDER BY j.position",
            table = association.table,
            artist = association.artist_column,
            owner = association.owner_column,
        ))?;
        let rows = stmt
            .query_map(params![owner_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of entity rows lacking both external identifiers. Always zero
    /// unless the check constraint was bypassed.
    pub fn count_rows_without_identifier(&self) -> Result<usize> {
        let mut total = 0;
        for entity in EntityType::ALL {
            let n: i64 = self.conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE spotify_uri IS NULL AND mbid IS NULL",
                    entity.table_name()
                ),
                [],
                |r| r.get(0),
            )?;
            total += n as usize;
        }
        Ok(total)
    }
}
