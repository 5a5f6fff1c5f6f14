//! SQLite schema definitions for the canonical catalog.
//!
//! Entities use an integer surrogate key plus two nullable external
//! identifiers, at least one of which must be set. Junction tables carry the
//! credited artist order in `position`.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};

const IDENTIFIER_CHECK: &str = "spotify_uri IS NOT NULL OR mbid IS NOT NULL";

// =============================================================================
// Entity Tables
// =============================================================================

const ARTISTS_TABLE: Table = Table {
    name: "artists",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("spotify_uri", &SqlType::Text),
        sqlite_column!("mbid", &SqlType::Text),
        sqlite_column!("name", &SqlType::Text), // NULL for placeholders
        sqlite_column!("genres", &SqlType::Text),
        sqlite_column!("source_name", &SqlType::Text),
        sqlite_column!("ingested_at", &SqlType::Text), // RFC 3339
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_artists_name", "name")],
    unique_constraints: &[&["spotify_uri"], &["mbid"]],
    checks: &[("artists_has_identifier", IDENTIFIER_CHECK)],
};

const ALBUMS_TABLE: Table = Table {
    name: "albums",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("spotify_uri", &SqlType::Text),
        sqlite_column!("mbid", &SqlType::Text),
        sqlite_column!("name", &SqlType::Text),
        sqlite_column!("album_type", &SqlType::Text), // 'album', 'single', 'compilation'
        sqlite_column!("release_date", &SqlType::Text),
        sqlite_column!("release_date_precision", &SqlType::Text),
        sqlite_column!("n_tracks", &SqlType::Integer),
        sqlite_column!("source_name", &SqlType::Text),
        sqlite_column!("ingested_at", &SqlType::Text),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_albums_name", "name")],
    unique_constraints: &[&["spotify_uri"], &["mbid"]],
    checks: &[("albums_has_identifier", IDENTIFIER_CHECK)],
};

const TRACKS_TABLE: Table = Table {
    name: "tracks",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("spotify_uri", &SqlType::Text),
        sqlite_column!("mbid", &SqlType::Text),
        sqlite_column!("name", &SqlType::Text),
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("explicit", &SqlType::Integer),
        sqlite_column!("isrc", &SqlType::Text),
        sqlite_column!("disc_number", &SqlType::Integer),
        sqlite_column!("track_number", &SqlType::Integer),
        sqlite_column!(
            "album_id",
            &SqlType::Integer,
            foreign_key = Some(&ForeignKey {
                foreign_table: "albums",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::SetNull,
            })
        ),
        sqlite_column!("source_name", &SqlType::Text),
        sqlite_column!("ingested_at", &SqlType::Text),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_tracks_album", "album_id"),
        ("idx_tracks_isrc", "isrc"),
    ],
    unique_constraints: &[&["spotify_uri"], &["mbid"]],
    checks: &[("tracks_has_identifier", IDENTIFIER_CHECK)],
};

// =============================================================================
// Junction Tables
// =============================================================================

const ALBUM_ARTISTS_TABLE: Table = Table {
    name: "album_artists",
    columns: &[
        sqlite_column!(
            "album_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "albums",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!(
            "artist_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "artists",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("position", &SqlType::Integer, non_null = true), // 0-based credit order
    ],
    indices: &[("idx_album_artists_artist", "artist_id")],
    unique_constraints: &[&["album_id", "artist_id"]],
    checks: &[],
};

const TRACK_ARTISTS_TABLE: Table = Table {
    name: "track_artists",
    columns: &[
        sqlite_column!(
            "track_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "tracks",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!(
            "artist_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "artists",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("position", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_track_artists_artist", "artist_id")],
    unique_constraints: &[&["track_id", "artist_id"]],
    checks: &[],
};

// =============================================================================
// Versioned Schema
// =============================================================================

pub const CATALOG_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        ARTISTS_TABLE,
        ALBUMS_TABLE,
        TRACKS_TABLE,
        ALBUM_ARTISTS_TABLE,
        TRACK_ARTISTS_TABLE,
    ],
    migration: None,
}];
