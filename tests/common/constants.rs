//! Shared constants for end-to-end tests

// ============================================================================
// Provenance
// ============================================================================

pub const SOURCE_NAME: &str = "test_source";

/// Fixed ingestion time so stored timestamps are predictable.
pub const INGESTED_AT: &str = "2024-05-01T12:00:00Z";

// ============================================================================
// Catalog identifiers
// ============================================================================

pub const ARTIST_X: &str = "spotify:artist:x";
pub const ARTIST_Y: &str = "spotify:artist:y";
pub const ARTIST_Z: &str = "spotify:artist:z";

pub const ALBUM_1: &str = "spotify:album:1";
pub const ALBUM_A1: &str = "A1";

pub const TRACK_1: &str = "spotify:track:1";
pub const TRACK_2: &str = "spotify:track:2";
