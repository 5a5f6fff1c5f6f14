//! Association reconciliation.
//!
//! The same three semantics exist twice: as a pure function over in-memory
//! sets (used for predicted statistics) and as set-based SQL (used by the
//! executor). Both must produce the same final association set.

use super::policy::AssociationMode;
use super::sql;
use crate::catalog_store::AssociationDef;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Items of a list-valued column such as `{"a", b,c}`, in order.
///
/// Braces and double quotes are stripped, items are split on commas and
/// trimmed of spaces, and empty items are dropped.
pub fn list_items(raw: &str) -> Vec<String> {
    let cleaned: String = raw.chars().filter(|c| !matches!(c, '{' | '}' | '"')).collect();
    cleaned
        .split(',')
        .map(|item| item.trim_matches(' '))
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an artist list into `(identifier, position)` pairs. Positions count
/// the items of [`list_items`]; a repeated identifier keeps its first position.
pub fn parse_artist_list(raw: &str) -> Vec<(String, i64)> {
    let mut seen = HashSet::new();
    list_items(raw)
        .into_iter()
        .enumerate()
        .filter(|(_, item)| seen.insert(item.clone()))
        .map(|(idx, item)| (item, idx as i64))
        .collect()
}

/// A pair present both before and after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedPair<A> {
    pub artist: A,
    pub old_position: i64,
    pub new_position: i64,
}

/// Effect of reconciling one owning entity's association set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationDiff<A> {
    /// Pairs that did not exist before, with their position.
    pub inserted: Vec<(A, i64)>,
    /// Pairs that existed before and are gone, with their old position.
    pub deleted: Vec<(A, i64)>,
    pub retained: Vec<RetainedPair<A>>,
    /// Incoming pairs the applied policy matched against an existing pair.
    pub recreated: usize,
}

impl<A: Clone> AssociationDiff<A> {
    fn unchanged(current: &[(A, i64)]) -> Self {
        AssociationDiff {
            inserted: Vec::new(),
            deleted: Vec::new(),
            retained: current
                .iter()
                .map(|(artist, position)| RetainedPair {
                    artist: artist.clone(),
                    old_position: *position,
                    new_position: *position,
                })
                .collect(),
            recreated: 0,
        }
    }

    pub fn repositioned(&self) -> usize {
        self.retained
            .iter()
            .filter(|p| p.old_position != p.new_position)
            .count()
    }

    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.deleted.is_empty() || self.repositioned() > 0
    }

    /// Association set after reconciliation, ordered by position.
    pub fn final_set(&self) -> Vec<(A, i64)> {
        let mut pairs: Vec<(A, i64)> = self
            .retained
            .iter()
            .map(|p| (p.artist.clone(), p.new_position))
            .chain(self.inserted.iter().cloned())
            .collect();
        pairs.sort_by_key(|(_, position)| *position);
        pairs
    }
}

/// Reconcile `incoming` (deduplicated, with list positions) into `current`.
pub fn reconcile<A: Eq + Hash + Clone>(
    mode: AssociationMode,
    current: &[(A, i64)],
    incoming: &[(A, i64)],
) -> AssociationDiff<A> {
    if incoming.is_empty() {
        return AssociationDiff::unchanged(current);
    }
    match mode {
        AssociationMode::Replace => replace(current, incoming),
        AssociationMode::PreferNonNull if current.is_empty() => replace(current, incoming),
        AssociationMode::PreferNonNull => AssociationDiff::unchanged(current),
        AssociationMode::Extend => extend(current, incoming),
    }
}

fn replace<A: Eq + Hash + Clone>(
    current: &[(A, i64)],
    incoming: &[(A, i64)],
) -> AssociationDiff<A> {
    let old: HashMap<&A, i64> = current.iter().map(|(a, p)| (a, *p)).collect();
    let new: HashSet<&A> = incoming.iter().map(|(a, _)| a).collect();

    let mut diff = AssociationDiff {
        inserted: Vec::new(),
        deleted: Vec::new(),
        retained: Vec::new(),
        recreated: 0,
    };
    for (artist, position) in incoming {
        match old.get(artist) {
            Some(old_position) => {
                diff.recreated += 1;
                diff.retained.push(RetainedPair {
                    artist: artist.clone(),
                    old_position: *old_position,
                    new_position: *position,
                });
            }
            None => diff.inserted.push((artist.clone(), *position)),
        }
    }
    diff.deleted = current
        .iter()
        .filter(|(artist, _)| !new.contains(artist))
        .cloned()
        .collect();
    diff
}

fn extend<A: Eq + Hash + Clone>(current: &[(A, i64)], incoming: &[(A, i64)]) -> AssociationDiff<A> {
    let existing: HashSet<&A> = current.iter().map(|(a, _)| a).collect();
    let base = current.iter().map(|(_, p)| *p).max().unwrap_or(-1);

    let mut fresh: Vec<&(A, i64)> = incoming
        .iter()
        .filter(|(artist, _)| !existing.contains(artist))
        .collect();
    fresh.sort_by_key(|(_, idx)| *idx);

    let mut diff = AssociationDiff::unchanged(current);
    diff.recreated = incoming.len() - fresh.len();
    diff.inserted = fresh
        .into_iter()
        .zip(1..)
        .map(|((artist, _), rank)| (artist.clone(), base + rank))
        .collect();
    diff
}

// =============================================================================
// SQL rendering
// =============================================================================

/// Statements reconciling `association` for every effective staging row, in
/// execution order.
pub fn render_statements(
    association: &AssociationDef,
    mode: AssociationMode,
    pairs: &sql::IncomingPairs,
) -> Vec<String> {
    let table = association.table;
    let owner = association.owner_column;
    let artist = association.artist_column;
    let ctes = pairs.ctes();

    match mode {
        AssociationMode::Replace => vec![
            format!(
                "WITH RECURSIVE {ctes} \
                 DELETE FROM {table} WHERE {owner} IN (SELECT owner_id FROM incoming)"
            ),
            format!(
                "WITH RECURSIVE {ctes} \
                 INSERT INTO {table} ({owner}, {artist}, position) \
                 SELECT owner_id, artist_id, idx FROM incoming WHERE true"
            ),
        ],
        AssociationMode::Extend => vec![format!(
            "WITH RECURSIVE {ctes}, \
             fresh AS ( \
                 SELECT i.owner_id, i.artist_id, i.idx FROM incoming i \
                 WHERE NOT EXISTS (SELECT 1 FROM {table} t \
                                   WHERE t.{owner} = i.owner_id AND t.{artist} = i.artist_id) \
             ), \
             current_max AS ( \
                 SELECT {owner} AS owner_id, MAX(position) AS max_pos FROM {table} GROUP BY {owner} \
             ) \
             INSERT INTO {table} ({owner}, {artist}, position) \
             SELECT f.owner_id, f.artist_id, \
                    COALESCE(m.max_pos, -1) + ROW_NUMBER() OVER (PARTITION BY f.owner_id ORDER BY f.idx) \
             FROM fresh f LEFT JOIN current_max m ON m.owner_id = f.owner_id \
             WHERE true"
        )],
        AssociationMode::PreferNonNull => vec![format!(
            "WITH RECURSIVE {ctes} \
             INSERT INTO {table} ({owner}, {artist}, position) \
             SELECT i.owner_id, i.artist_id, i.idx FROM incoming i \
             WHERE NOT EXISTS (SELECT 1 FROM {table} t WHERE t.{owner} = i.owner_id)"
        )],
    }
}
