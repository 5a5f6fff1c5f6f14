//! Catalog entity vocabulary shared by the schema, the merge engine and the
//! dataset manifests.
//!
//! Every column a batch may carry is declared here once, together with how it
//! maps onto the canonical tables.

use crate::sqlite_persistence::SqlType;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Enumerations
// =============================================================================

/// Catalog entity types, leaf-first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "artists")]
    Artist,
    #[serde(rename = "albums")]
    Album,
    #[serde(rename = "tracks")]
    Track,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Artist, EntityType::Album, EntityType::Track];

    /// Parse a canonical table name (`artists`, `albums`, `tracks`).
    pub fn from_table_name(s: &str) -> Option<Self> {
        match s {
            "artists" => Some(EntityType::Artist),
            "albums" => Some(EntityType::Album),
            "tracks" => Some(EntityType::Track),
            _ => None,
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            EntityType::Artist => "artists",
            EntityType::Album => "albums",
            EntityType::Track => "tracks",
        }
    }

    /// Batch columns this entity accepts, in canonical order.
    pub fn columns(&self) -> &'static [BatchColumn] {
        match self {
            EntityType::Artist => ARTIST_COLUMNS,
            EntityType::Album => ALBUM_COLUMNS,
            EntityType::Track => TRACK_COLUMNS,
        }
    }

    pub fn column(&self, name: &str) -> Option<&'static BatchColumn> {
        self.columns().iter().find(|c| c.name == name)
    }

    /// The association this entity owns, if any.
    pub fn association(&self) -> Option<&'static AssociationDef> {
        self.columns().iter().find_map(|c| match &c.kind {
            ColumnKind::ArtistList(association) => Some(association),
            _ => None,
        })
    }

    /// Single-valued references to other entities.
    pub fn references(&self) -> impl Iterator<Item = &'static ReferenceDef> {
        self.columns().iter().filter_map(|c| match &c.kind {
            ColumnKind::Reference(reference) => Some(reference),
            _ => None,
        })
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// External identifier kinds. Every entity row carries at least one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    SpotifyUri,
    Mbid,
}

impl IdentifierKind {
    /// Conflict key precedence.
    pub const PRECEDENCE: [IdentifierKind; 2] = [IdentifierKind::SpotifyUri, IdentifierKind::Mbid];

    pub fn column_name(&self) -> &'static str {
        match self {
            IdentifierKind::SpotifyUri => "spotify_uri",
            IdentifierKind::Mbid => "mbid",
        }
    }
}

/// Value type of a batch column as staged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueType {
    Text,
    Integer,
    /// Stored as 0/1.
    Bool,
    /// Text encoding an item list, e.g. `{rock,pop}`.
    TextList,
}

impl ValueType {
    pub fn sql_type(&self) -> SqlType {
        match self {
            ValueType::Text | ValueType::TextList => SqlType::Text,
            ValueType::Integer | ValueType::Bool => SqlType::Integer,
        }
    }
}

// =============================================================================
// Column vocabulary
// =============================================================================

/// A single-valued reference to another entity by external identifier,
/// stored as the target's surrogate id.
#[derive(Debug, PartialEq, Eq)]
pub struct ReferenceDef {
    pub target: EntityType,
    pub target_key: IdentifierKind,
    /// Canonical column receiving the resolved id.
    pub stored_as: &'static str,
}

/// A many-to-many link from the owning entity to artists.
#[derive(Debug, PartialEq, Eq)]
pub struct AssociationDef {
    pub table: &'static str,
    pub owner_column: &'static str,
    pub artist_column: &'static str,
    pub target: EntityType,
    pub target_key: IdentifierKind,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Identifier(IdentifierKind),
    Scalar,
    Reference(ReferenceDef),
    /// List-valued text encoding an ordered artist list, e.g. `{a,b}`.
    ArtistList(AssociationDef),
}

#[derive(Debug, PartialEq, Eq)]
pub struct BatchColumn {
    pub name: &'static str,
    pub value_type: ValueType,
    pub kind: ColumnKind,
}

impl BatchColumn {
    /// Canonical column written by the upsert, if the column is stored on the
    /// entity row itself.
    pub fn stored_as(&self) -> Option<&'static str> {
        match &self.kind {
            ColumnKind::Identifier(_) | ColumnKind::Scalar => Some(self.name),
            ColumnKind::Reference(reference) => Some(reference.stored_as),
            ColumnKind::ArtistList(_) => None,
        }
    }

    pub fn identifier(&self) -> Option<IdentifierKind> {
        match self.kind {
            ColumnKind::Identifier(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, ColumnKind::ArtistList(_))
    }
}

const fn text(name: &'static str) -> BatchColumn {
    BatchColumn {
        name,
        value_type: ValueType::Text,
        kind: ColumnKind::Scalar,
    }
}

const fn integer(name: &'static str) -> BatchColumn {
    BatchColumn {
        name,
        value_type: ValueType::Integer,
        kind: ColumnKind::Scalar,
    }
}

const SPOTIFY_URI: BatchColumn = BatchColumn {
    name: "spotify_uri",
    value_type: ValueType::Text,
    kind: ColumnKind::Identifier(IdentifierKind::SpotifyUri),
};

const MBID: BatchColumn = BatchColumn {
    name: "mbid",
    value_type: ValueType::Text,
    kind: ColumnKind::Identifier(IdentifierKind::Mbid),
};

const ARTIST_COLUMNS: &[BatchColumn] = &[
    SPOTIFY_URI,
    MBID,
    text("name"),
    BatchColumn {
        name: "genres",
        value_type: ValueType::TextList,
        kind: ColumnKind::Scalar,
    },
];

const ALBUM_COLUMNS: &[BatchColumn] = &[
    SPOTIFY_URI,
    MBID,
    text("name"),
    text("album_type"),
    text("release_date"),
    text("release_date_precision"), // 'day', 'month', 'year'
    integer("n_tracks"),
    BatchColumn {
        name: "artist_spotify_uris",
        value_type: ValueType::Text,
        kind: ColumnKind::ArtistList(AssociationDef {
            table: "album_artists",
            owner_column: "album_id",
            artist_column: "artist_id",
            target: EntityType::Artist,
            target_key: IdentifierKind::SpotifyUri,
        }),
    },
];

const TRACK_COLUMNS: &[BatchColumn] = &[
    SPOTIFY_URI,
    MBID,
    text("name"),
    integer("duration_ms"),
    BatchColumn {
        name: "explicit",
        value_type: ValueType::Bool,
        kind: ColumnKind::Scalar,
    },
    text("isrc"),
    integer("disc_number"),
    integer("track_number"),
    BatchColumn {
        name: "album_spotify_uri",
        value_type: ValueType::Text,
        kind: ColumnKind::Reference(ReferenceDef {
            target: EntityType::Album,
            target_key: IdentifierKind::SpotifyUri,
            stored_as: "album_id",
        }),
    },
    BatchColumn {
        name: "artist_spotify_uris",
        value_type: ValueType::Text,
        kind: ColumnKind::ArtistList(AssociationDef {
            table: "track_artists",
            owner_column: "track_id",
            artist_column: "artist_id",
            target: EntityType::Artist,
            target_key: IdentifierKind::SpotifyUri,
        }),
    },
];

// =============================================================================
// Store-side summaries
// =============================================================================

/// Row counts of the canonical tables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
    pub album_artists: usize,
    pub track_artists: usize,
}
