//! Renders planned operations into SQLite statements.
//!
//! Identifiers come from the static column vocabulary, never from batch data;
//! provenance values are bound as `:source_name` and `:ingested_at`.
//!
//! A batch may carry more than one external identifier. A staging row is
//! addressed by its first non-empty identifier in precedence order, and the
//! upsert carries one conflict clause per identifier in the same order.

use super::plan::{MergeOperation, MergePlan};
use super::policy::ColumnMode;
use super::reconcile;
use crate::catalog_store::{
    AssociationDef, BatchColumn, ColumnKind, EntityType, IdentifierKind,
};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::Connection;

/// SQL function merging two list-encoded values, see [`ColumnMode::Extend`].
pub const EXTEND_LIST_FUNCTION: &str = "extend_list";

/// Register the scalar functions rendered statements rely on.
pub fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        EXTEND_LIST_FUNCTION,
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let existing: Value = ctx.get(0)?;
            let incoming: Value = ctx.get(1)?;
            Ok(ColumnMode::Extend.choose(&existing, &incoming))
        },
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedStatement {
    pub sql: String,
    /// Whether `:source_name` and `:ingested_at` must be bound.
    pub binds_provenance: bool,
}

impl RenderedStatement {
    fn plain(sql: String) -> Self {
        RenderedStatement {
            sql,
            binds_provenance: false,
        }
    }

    fn with_provenance(sql: String) -> Self {
        RenderedStatement {
            sql,
            binds_provenance: true,
        }
    }
}

fn present(alias: &str, column: &str) -> String {
    format!("NULLIF({alias}.{column}, '')")
}

fn coalesce(mut exprs: Vec<String>) -> String {
    if exprs.len() == 1 {
        exprs.remove(0)
    } else {
        format!("COALESCE({})", exprs.join(", "))
    }
}

/// Value of the identifier addressing row `alias`, NULL when it has none.
pub fn identity(alias: &str, keys: &[IdentifierKind]) -> String {
    coalesce(
        keys.iter()
            .map(|k| present(alias, k.column_name()))
            .collect(),
    )
}

/// Surrogate id of the `table` row that staging row `alias` addresses: the
/// first identifier in `keys` with a stored match wins.
pub fn matched_id(table: &str, keys: &[IdentifierKind], alias: &str) -> String {
    coalesce(
        keys.iter()
            .map(|k| {
                let column = k.column_name();
                format!(
                    "(SELECT m.id FROM {table} m WHERE m.{column} = {})",
                    present(alias, column)
                )
            })
            .collect(),
    )
}

/// Rowids of the staging rows a run acts on.
///
/// Rows are grouped by their addressing identifier and the last loaded row of
/// each group wins. A row addressed only by a fallback identifier is dropped
/// when another row of the batch carries that same identifier next to an
/// earlier one.
pub fn effective_rows(staging: &str, keys: &[IdentifierKind]) -> String {
    let columns: Vec<&str> = keys.iter().map(|k| k.column_name()).collect();

    let rank = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("WHEN {} IS NOT NULL THEN {i}", present("s", c)))
        .collect::<Vec<_>>()
        .join(" ");

    let mut conditions = vec![format!("{} IS NOT NULL", identity("s", keys))];
    for (i, column) in columns.iter().enumerate().skip(1) {
        let earlier_absent = columns[..i]
            .iter()
            .map(|c| format!("{} IS NULL", present("s", c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let earlier_present = columns[..i]
            .iter()
            .map(|c| format!("{} IS NOT NULL", present("p", c)))
            .collect::<Vec<_>>()
            .join(" OR ");
        conditions.push(format!(
            "NOT ({earlier_absent} AND EXISTS (SELECT 1 FROM {staging} p \
             WHERE p.{column} = s.{column} AND ({earlier_present})))"
        ));
    }

    format!(
        "SELECT MAX(s.rowid) FROM {staging} s WHERE {} \
         GROUP BY CASE {rank} END, {}",
        conditions.join(" AND "),
        identity("s", keys)
    )
}

/// `split` and `items` CTEs exploding a list column of the effective staging
/// rows into `(owner_row, item, idx)`, `idx` counting non-empty items.
pub fn list_items_ctes(staging: &str, keys: &[IdentifierKind], list_column: &str) -> String {
    let effective = effective_rows(staging, keys);
    format!(
        "split(owner_row, rest, item, raw_pos) AS ( \
             SELECT s.rowid, \
                    replace(replace(replace(s.{list_column}, '{{', ''), '}}', ''), '\"', '') || ',', \
                    NULL, -1 \
             FROM {staging} s WHERE s.rowid IN ({effective}) \
             UNION ALL \
             SELECT owner_row, \
                    substr(rest, instr(rest, ',') + 1), \
                    trim(substr(rest, 1, instr(rest, ',') - 1)), \
                    raw_pos + 1 \
             FROM split WHERE rest <> '' \
         ), \
         items AS ( \
             SELECT owner_row, item, \
                    ROW_NUMBER() OVER (PARTITION BY owner_row ORDER BY raw_pos) - 1 AS idx \
             FROM split WHERE item IS NOT NULL AND item <> '' \
         )"
    )
}

/// CTEs yielding `incoming(owner_id, artist_id, idx)`: the deduplicated,
/// resolved association pairs carried by the batch.
#[derive(Debug, Clone)]
pub struct IncomingPairs {
    staging: String,
    owner: EntityType,
    conflict_keys: Vec<IdentifierKind>,
    list_column: &'static str,
    target: EntityType,
    target_key: IdentifierKind,
}

impl IncomingPairs {
    pub fn new(
        plan: &MergePlan,
        list_column: &'static BatchColumn,
        association: &AssociationDef,
    ) -> Self {
        IncomingPairs {
            staging: plan.staging_table.clone(),
            owner: plan.entity,
            conflict_keys: plan.conflict_keys.clone(),
            list_column: list_column.name,
            target: association.target,
            target_key: association.target_key,
        }
    }

    pub fn ctes(&self) -> String {
        let staging = &self.staging;
        let target_table = self.target.table_name();
        let target_key = self.target_key.column_name();
        let items = list_items_ctes(staging, &self.conflict_keys, self.list_column);
        let owner_id = matched_id(self.owner.table_name(), &self.conflict_keys, "s");
        format!(
            "{items}, \
             resolved AS ( \
                 SELECT {owner_id} AS owner_id, a.id AS artist_id, i.idx \
                 FROM items i \
                 JOIN {staging} s ON s.rowid = i.owner_row \
                 JOIN {target_table} a ON a.{target_key} = i.item \
             ), \
             incoming AS ( \
                 SELECT owner_id, artist_id, MIN(idx) AS idx FROM resolved \
                 WHERE owner_id IS NOT NULL GROUP BY owner_id, artist_id \
             )"
        )
    }
}

/// Render one operation of `plan` as its fixed statement sequence.
pub fn render(plan: &MergePlan, operation: &MergeOperation) -> Vec<RenderedStatement> {
    let staging = plan.staging_table.as_str();
    let keys = plan.conflict_keys.as_slice();

    match operation {
        MergeOperation::CreatePlaceholders {
            target,
            target_key,
            source,
            ..
        } => {
            let target_table = target.table_name();
            let target_key = target_key.column_name();
            let sql = if source.is_list() {
                let items = list_items_ctes(staging, keys, source.name);
                format!(
                    "WITH RECURSIVE {items} \
                     INSERT INTO {target_table} ({target_key}, source_name, ingested_at) \
                     SELECT DISTINCT item, :source_name, :ingested_at FROM items \
                     WHERE NOT EXISTS (SELECT 1 FROM {target_table} t WHERE t.{target_key} = items.item) \
                     ORDER BY item"
                )
            } else {
                let effective = effective_rows(staging, keys);
                let column = source.name;
                format!(
                    "INSERT INTO {target_table} ({target_key}, source_name, ingested_at) \
                     SELECT DISTINCT s.{column}, :source_name, :ingested_at FROM {staging} s \
                     WHERE s.rowid IN ({effective}) \
                       AND s.{column} IS NOT NULL AND s.{column} <> '' \
                       AND NOT EXISTS (SELECT 1 FROM {target_table} t WHERE t.{target_key} = s.{column}) \
                     ORDER BY s.{column}"
                )
            };
            vec![RenderedStatement::with_provenance(sql)]
        }
        MergeOperation::UpsertEntity {
            entity,
            conflict_keys,
            columns,
            ..
        } => {
            let table = entity.table_name();
            let effective = effective_rows(staging, keys);

            let mut targets = Vec::new();
            let mut values = Vec::new();
            let mut assignments = Vec::new();
            let primary = conflict_keys.first().map(|k| k.column_name());
            if let Some(key) = primary {
                if !columns.iter().any(|p| p.column.name == key) {
                    targets.push(key.to_string());
                    values.push(present("s", key));
                }
            }
            for policy in columns {
                let column = policy.column;
                let Some(stored) = column.stored_as() else {
                    continue;
                };
                targets.push(stored.to_string());
                values.push(match &column.kind {
                    ColumnKind::Reference(reference) => format!(
                        "(SELECT r.id FROM {} r WHERE r.{} = NULLIF(s.{}, ''))",
                        reference.target.table_name(),
                        reference.target_key.column_name(),
                        column.name
                    ),
                    ColumnKind::Identifier(_) => present("s", column.name),
                    _ => format!("s.{}", column.name),
                });
                assignments.push(policy.mode.render_assignment(table, stored));
            }
            targets.push("source_name".to_string());
            targets.push("ingested_at".to_string());
            values.push(":source_name".to_string());
            values.push(":ingested_at".to_string());
            assignments.push("source_name = excluded.source_name".to_string());
            assignments.push("ingested_at = excluded.ingested_at".to_string());

            let assignments = assignments.join(", ");
            let conflicts = conflict_keys
                .iter()
                .map(|k| format!("ON CONFLICT({}) DO UPDATE SET {assignments}", k.column_name()))
                .collect::<Vec<_>>()
                .join(" ");
            let sql = format!(
                "INSERT INTO {table} ({targets}) \
                 SELECT {values} FROM {staging} s WHERE s.rowid IN ({effective}) \
                 {conflicts}",
                targets = targets.join(", "),
                values = values.join(", "),
            );
            vec![RenderedStatement::with_provenance(sql)]
        }
        MergeOperation::ReconcileAssociations { policy, .. } => {
            let pairs = IncomingPairs::new(plan, policy.column, policy.association);
            reconcile::render_statements(policy.association, policy.mode, &pairs)
                .into_iter()
                .map(RenderedStatement::plain)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::plan::MergePlanner;
    use crate::merge::policy::{PolicyConfig, PolicyResolver};
    use rusqlite::Connection;

    fn track_plan() -> MergePlan {
        let tracks = PolicyConfig {
            columns: [
                ("name", "prefer_incoming"),
                ("duration_ms", "prefer_non_null"),
                ("album_spotify_uri", "prefer_incoming"),
            ]
            .into_iter()
            .map(|(c, m)| (c.to_string(), m.to_string()))
            .collect(),
            associations: Some("extend".to_string()),
        };
        let resolver = PolicyResolver::new([(EntityType::Track, &tracks)]).unwrap();
        let policy = resolver
            .resolve(
                EntityType::Track,
                &[
                    "spotify_uri",
                    "name",
                    "duration_ms",
                    "album_spotify_uri",
                    "artist_spotify_uris",
                ],
            )
            .unwrap();
        MergePlanner::plan(&policy, "staging_tracks")
    }

    #[test]
    fn test_upsert_shape() {
        let plan = track_plan();
        let upsert = plan
            .operations
            .iter()
            .find(|op| op.id().as_str() == "upsert_tracks")
            .unwrap();
        let statements = render(&plan, upsert);
        assert_eq!(statements.len(), 1);
        let sql = &statements[0].sql;
        assert!(statements[0].binds_provenance);
        assert!(sql.starts_with(
            "INSERT INTO tracks (spotify_uri, name, duration_ms, album_id, source_name, ingested_at)"
        ));
        assert!(sql.contains("ON CONFLICT(spotify_uri) DO UPDATE SET name = excluded.name"));
        assert!(sql.contains("duration_ms = COALESCE(tracks.duration_ms, excluded.duration_ms)"));
        assert!(sql.contains("NULLIF(s.album_spotify_uri, '')"));
        assert!(sql.ends_with("ingested_at = excluded.ingested_at"));
        assert_eq!(sql.matches("ON CONFLICT").count(), 1);
    }

    #[test]
    fn test_upsert_with_both_identifiers_has_a_clause_per_key() {
        let artists = PolicyConfig {
            columns: [("name", "prefer_incoming"), ("mbid", "prefer_non_null")]
                .into_iter()
                .map(|(c, m)| (c.to_string(), m.to_string()))
                .collect(),
            associations: None,
        };
        let resolver = PolicyResolver::new([(EntityType::Artist, &artists)]).unwrap();
        let policy = resolver
            .resolve(EntityType::Artist, &["spotify_uri", "mbid", "name"])
            .unwrap();
        let plan = MergePlanner::plan(&policy, "staging_artists");
        let statements = render(&plan, &plan.operations[0]);
        let sql = &statements[0].sql;

        assert!(sql.starts_with(
            "INSERT INTO artists (spotify_uri, mbid, name, source_name, ingested_at) \
             SELECT NULLIF(s.spotify_uri, ''), NULLIF(s.mbid, ''), s.name"
        ));
        let spotify = sql.find("ON CONFLICT(spotify_uri) DO UPDATE SET").unwrap();
        let mbid = sql.find("ON CONFLICT(mbid) DO UPDATE SET").unwrap();
        assert!(spotify < mbid);
        assert!(sql.contains(
            "spotify_uri = COALESCE(artists.spotify_uri, excluded.spotify_uri)"
        ));
    }

    #[test]
    fn test_effective_rows_use_the_first_present_identifier() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TEMP TABLE staging_artists (spotify_uri TEXT, mbid TEXT, name TEXT)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO staging_artists (rowid, spotify_uri, mbid, name) VALUES \
             (1, 'ar1', 'mb-1', 'One'), \
             (2, NULL, 'mb-9', 'Nine'), \
             (3, '', 'mb-9', 'Nine again'), \
             (4, NULL, 'mb-1', 'One by mbid'), \
             (5, NULL, NULL, 'Nobody'), \
             (6, 'ar1', NULL, 'One again')",
            [],
        )
        .unwrap();

        let keys = [IdentifierKind::SpotifyUri, IdentifierKind::Mbid];
        let sql = format!(
            "SELECT rowid FROM staging_artists WHERE rowid IN ({}) ORDER BY rowid",
            effective_rows("staging_artists", &keys)
        );
        let mut stmt = conn.prepare(&sql).unwrap();
        let rows: Vec<i64> = stmt
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        // 4 is covered by row 1, which carries mb-1 next to a spotify_uri
        assert_eq!(rows, vec![3, 6]);

        let spotify_only = format!(
            "SELECT COUNT(*) FROM ({})",
            effective_rows("staging_artists", &keys[..1])
        );
        let n: i64 = conn.query_row(&spotify_only, [], |r| r.get(0)).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_extend_list_function() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();
        let merged: Option<String> = conn
            .query_row(
                "SELECT extend_list('{rock,pop}', '{\"pop\", jazz}')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(merged.as_deref(), Some("{rock,pop,jazz}"));

        let kept: Option<String> = conn
            .query_row("SELECT extend_list('{rock}', NULL)", [], |r| r.get(0))
            .unwrap();
        assert_eq!(kept.as_deref(), Some("{rock}"));
    }

    #[test]
    fn test_every_statement_prepares() {
        let conn = Connection::open_in_memory().unwrap();
        crate::catalog_store::CATALOG_VERSIONED_SCHEMAS[0]
            .create(&conn)
            .unwrap();
        conn.execute(
            "CREATE TEMP TABLE staging_tracks (spotify_uri TEXT, name TEXT, duration_ms INTEGER, \
             album_spotify_uri TEXT, artist_spotify_uris TEXT)",
            [],
        )
        .unwrap();

        let plan = track_plan();
        for operation in &plan.operations {
            for statement in render(&plan, operation) {
                conn.prepare(&statement.sql)
                    .unwrap_or_else(|e| panic!("{}: {}\n{}", operation.id(), e, statement.sql));
            }
        }
    }

    #[test]
    fn test_list_items_explode_like_the_parser() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TEMP TABLE staging_albums (spotify_uri TEXT, artist_spotify_uris TEXT)",
            [],
        )
        .unwrap();
        let raw = r#"{"ar1", ar2,,ar1 ,ar3}"#;
        conn.execute(
            "INSERT INTO staging_albums VALUES ('al1', ?1)",
            [raw],
        )
        .unwrap();

        let sql = format!(
            "WITH RECURSIVE {} SELECT item, MIN(idx) FROM items GROUP BY item ORDER BY MIN(idx)",
            list_items_ctes(
                "staging_albums",
                &[IdentifierKind::SpotifyUri],
                "artist_spotify_uris"
            )
        );
        let mut stmt = conn.prepare(&sql).unwrap();
        let exploded: Vec<(String, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        assert_eq!(exploded, reconcile::parse_artist_list(raw));
    }
}
