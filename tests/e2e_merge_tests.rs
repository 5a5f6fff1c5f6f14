//! End-to-end tests for entity merges: column policies, dry runs,
//! referential completion and statistics.

mod common;

use common::{
    batch, policy, provenance, resolver, Batch, TestCatalog, ALBUM_1, ALBUM_A1, ARTIST_X,
    ARTIST_Y, ARTIST_Z, INGESTED_AT, SOURCE_NAME, TRACK_1, TRACK_2,
};
use pezzottify_catalog_merge::catalog_store::{EntityType, IdentifierKind};
use pezzottify_catalog_merge::merge::{
    AlwaysCommit, MergeError, MergeOperation, MergeRun, PolicyResolver, RunState, StagingTable,
};

fn artists(rows: &[&[Option<&str>]]) -> Batch {
    batch(EntityType::Artist, &["spotify_uri", "name"], rows)
}

fn artist_names(mode: &str) -> PolicyResolver {
    resolver(&[(EntityType::Artist, policy(&[("name", mode)], None))])
}

const TRACK_COLUMNS: &[&str] = &[
    "spotify_uri",
    "name",
    "duration_ms",
    "explicit",
    "album_spotify_uri",
    "artist_spotify_uris",
];

fn tracks_resolver(mode: &str, associations: &str) -> PolicyResolver {
    resolver(&[(
        EntityType::Track,
        policy(
            &[
                ("name", mode),
                ("duration_ms", "prefer_non_null"),
                ("explicit", mode),
                ("album_spotify_uri", "prefer_non_null"),
            ],
            Some(associations),
        ),
    )])
}

/// Stage `batch`, predict, execute, and check the prediction against what
/// the executed statements did.
fn assert_prediction_matches(catalog: &TestCatalog, resolver: &PolicyResolver, batch: &Batch) {
    let staging = StagingTable::create(catalog.conn(), batch.entity, &batch.columns).unwrap();
    staging.load(&mut batch.ingestor()).unwrap();
    let run = MergeRun::staged(&staging, provenance())
        .plan(resolver)
        .unwrap();

    let predicted = run.predict().unwrap();
    let executed = run.execute().unwrap();
    assert_eq!(&predicted, executed.stats());
    executed.commit().unwrap();
}

// =============================================================================
// Column policies
// =============================================================================

#[test]
fn test_prefer_incoming_overwrites_name() {
    let catalog = TestCatalog::new();
    catalog.run(
        artist_names("prefer_incoming"),
        &artists(&[&[Some(ARTIST_X), Some("Alpha")]]),
        &AlwaysCommit,
    );

    let outcome = catalog.run(
        artist_names("prefer_incoming"),
        &artists(&[&[Some(ARTIST_X), Some("Beta")]]),
        &AlwaysCommit,
    );

    assert_eq!(
        catalog.name_of(EntityType::Artist, ARTIST_X).as_deref(),
        Some("Beta")
    );
    assert_eq!(outcome.stats.existing_rows, 1);
    assert_eq!(outcome.stats.updated_rows, 1);
    assert_eq!(outcome.stats.column_changes["name"], 1);
}

#[test]
fn test_prefer_non_null_keeps_name() {
    let catalog = TestCatalog::new();
    catalog.run(
        artist_names("prefer_non_null"),
        &artists(&[&[Some(ARTIST_X), Some("Alpha")]]),
        &AlwaysCommit,
    );

    let outcome = catalog.run(
        artist_names("prefer_non_null"),
        &artists(&[&[Some(ARTIST_X), Some("Beta")]]),
        &AlwaysCommit,
    );

    assert_eq!(
        catalog.name_of(EntityType::Artist, ARTIST_X).as_deref(),
        Some("Alpha")
    );
    assert_eq!(outcome.stats.unchanged_rows, 1);
    assert_eq!(outcome.stats.column_changes["name"], 0);
}

#[test]
fn test_prefer_longer_keeps_the_longer_text() {
    let catalog = TestCatalog::new();
    let albums = |name: &str| {
        batch(
            EntityType::Album,
            &["spotify_uri", "name"],
            &[&[Some(ALBUM_1), Some(name)]],
        )
    };
    let longer = || resolver(&[(EntityType::Album, policy(&[("name", "prefer_longer")], None))]);

    catalog.run(longer(), &albums("Abbey"), &AlwaysCommit);
    catalog.run(longer(), &albums("Abbey Road"), &AlwaysCommit);
    assert_eq!(
        catalog.name_of(EntityType::Album, ALBUM_1).as_deref(),
        Some("Abbey Road")
    );

    let outcome = catalog.run(longer(), &albums("Ab"), &AlwaysCommit);
    assert_eq!(
        catalog.name_of(EntityType::Album, ALBUM_1).as_deref(),
        Some("Abbey Road")
    );
    assert_eq!(outcome.stats.column_changes["name"], 0);
}

#[test]
fn test_provenance_is_stamped_on_merged_rows() {
    let catalog = TestCatalog::new();
    catalog.run(
        artist_names("prefer_incoming"),
        &artists(&[&[Some(ARTIST_X), Some("Alpha")]]),
        &AlwaysCommit,
    );

    let id = catalog.id_of(EntityType::Artist, ARTIST_X).unwrap();
    let record = catalog.store.get_entity(EntityType::Artist, id).unwrap().unwrap();
    assert_eq!(record.source_name.as_deref(), Some(SOURCE_NAME));
    assert_eq!(record.ingested_at.as_deref(), Some(INGESTED_AT));
}

#[test]
fn test_mbid_is_the_conflict_key_without_spotify_uri() {
    let catalog = TestCatalog::new();
    let with_both = batch(
        EntityType::Artist,
        &["spotify_uri", "mbid", "name"],
        &[&[Some(ARTIST_X), Some("mbid-x"), Some("Alpha")]],
    );
    let names = || {
        resolver(&[(
            EntityType::Artist,
            policy(&[("name", "prefer_incoming"), ("mbid", "prefer_non_null")], None),
        )])
    };
    catalog.run(names(), &with_both, &AlwaysCommit);

    let by_mbid = batch(
        EntityType::Artist,
        &["mbid", "name"],
        &[&[Some("mbid-x"), Some("Alpha (MB)")]],
    );
    let outcome = catalog.run(names(), &by_mbid, &AlwaysCommit);

    assert_eq!(outcome.stats.existing_rows, 1);
    assert_eq!(outcome.stats.new_rows, 0);
    assert_eq!(catalog.count("artists"), 1);
    let id = catalog
        .store
        .find_id(EntityType::Artist, IdentifierKind::Mbid, "mbid-x")
        .unwrap()
        .unwrap();
    let record = catalog.store.get_entity(EntityType::Artist, id).unwrap().unwrap();
    assert_eq!(record.spotify_uri.as_deref(), Some(ARTIST_X));
    assert_eq!(record.name.as_deref(), Some("Alpha (MB)"));
}

#[test]
fn test_rows_addressed_by_mbid_alone_are_stored() {
    let catalog = TestCatalog::new();
    let mixed = batch(
        EntityType::Artist,
        &["spotify_uri", "mbid", "name"],
        &[
            &[Some("spotify:artist:1"), Some("mb-1"), Some("One")],
            &[None, Some("mb-9"), Some("Nine")],
        ],
    );
    let outcome = catalog.run(
        resolver(&[(
            EntityType::Artist,
            policy(&[("name", "prefer_incoming"), ("mbid", "prefer_non_null")], None),
        )]),
        &mixed,
        &AlwaysCommit,
    );

    assert_eq!(outcome.stats.excluded_rows, 0);
    assert_eq!(outcome.stats.new_rows, 2);
    assert_eq!(catalog.count("artists"), 2);
    let id = catalog
        .store
        .find_id(EntityType::Artist, IdentifierKind::Mbid, "mb-9")
        .unwrap()
        .unwrap();
    let record = catalog.store.get_entity(EntityType::Artist, id).unwrap().unwrap();
    assert_eq!(record.spotify_uri, None);
    assert_eq!(record.name.as_deref(), Some("Nine"));
}

#[test]
fn test_mbid_match_fills_missing_spotify_uri() {
    let catalog = TestCatalog::new();
    let names = || {
        resolver(&[(
            EntityType::Artist,
            policy(&[("name", "prefer_incoming"), ("mbid", "prefer_non_null")], None),
        )])
    };
    let by_mbid = batch(
        EntityType::Artist,
        &["mbid", "name"],
        &[&[Some("mb-5"), Some("Five")]],
    );
    catalog.run(names(), &by_mbid, &AlwaysCommit);

    let mixed = batch(
        EntityType::Artist,
        &["spotify_uri", "mbid", "name"],
        &[
            &[Some(ARTIST_X), Some("mb-5"), Some("Five!")],
            &[None, Some("mb-9"), Some("Nine")],
            &[Some(ARTIST_Y), None, Some("Why")],
        ],
    );
    assert_prediction_matches(&catalog, &names(), &mixed);

    assert_eq!(catalog.count("artists"), 3);
    let id = catalog
        .store
        .find_id(EntityType::Artist, IdentifierKind::Mbid, "mb-5")
        .unwrap()
        .unwrap();
    let record = catalog.store.get_entity(EntityType::Artist, id).unwrap().unwrap();
    assert_eq!(record.spotify_uri.as_deref(), Some(ARTIST_X));
    assert_eq!(record.name.as_deref(), Some("Five!"));
}

#[test]
fn test_genres_extend_adds_missing_items() {
    let catalog = TestCatalog::new();
    let genres = || resolver(&[(EntityType::Artist, policy(&[("genres", "extend")], None))]);
    let with_genres = |list: &str| {
        batch(
            EntityType::Artist,
            &["spotify_uri", "genres"],
            &[&[Some(ARTIST_X), Some(list)]],
        )
    };
    let stored_genres = || -> Option<String> {
        catalog
            .conn()
            .query_row(
                "SELECT genres FROM artists WHERE spotify_uri = ?1",
                [ARTIST_X],
                |row| row.get(0),
            )
            .unwrap()
    };

    catalog.run(genres(), &with_genres("{rock,pop}"), &AlwaysCommit);
    assert_prediction_matches(&catalog, &genres(), &with_genres(r#"{"pop", jazz}"#));
    assert_eq!(stored_genres().as_deref(), Some("{rock,pop,jazz}"));

    let outcome = catalog.run(genres(), &with_genres("{jazz,rock}"), &AlwaysCommit);
    assert_eq!(outcome.stats.updated_rows, 0);
    assert_eq!(outcome.stats.column_changes["genres"], 0);
    assert_eq!(stored_genres().as_deref(), Some("{rock,pop,jazz}"));
}

#[test]
fn test_last_duplicate_row_wins() {
    let catalog = TestCatalog::new();
    let outcome = catalog.run(
        artist_names("prefer_incoming"),
        &artists(&[
            &[Some(ARTIST_X), Some("First")],
            &[Some(ARTIST_X), Some("Second")],
        ]),
        &AlwaysCommit,
    );

    assert_eq!(outcome.stats.staging_rows, 2);
    assert_eq!(outcome.stats.collapsed_rows, 1);
    assert_eq!(outcome.stats.new_rows, 1);
    assert_eq!(
        catalog.name_of(EntityType::Artist, ARTIST_X).as_deref(),
        Some("Second")
    );
}

// =============================================================================
// Dry run
// =============================================================================

#[test]
fn test_dry_run_rollback_keeps_catalog_and_staging() {
    let catalog = TestCatalog::new();
    catalog.run(
        artist_names("prefer_incoming"),
        &artists(&[&[Some(ARTIST_X), Some("X")], &[Some(ARTIST_Y), Some("Y")]]),
        &AlwaysCommit,
    );
    let before = catalog.count("artists");

    let five = artists(&[
        &[Some("spotify:artist:1"), Some("One")],
        &[Some("spotify:artist:2"), Some("Two")],
        &[Some("spotify:artist:3"), Some("Three")],
        &[Some("spotify:artist:4"), Some("Four")],
        &[Some("spotify:artist:5"), Some("Five")],
    ]);
    let staging = StagingTable::create(catalog.conn(), EntityType::Artist, &five.columns).unwrap();
    staging.load(&mut five.ingestor()).unwrap();

    let resolver = artist_names("prefer_incoming");
    let executed = MergeRun::staged(&staging, provenance())
        .plan(&resolver)
        .unwrap()
        .execute()
        .unwrap();
    assert_eq!(executed.stats().new_rows, 5);
    assert_eq!(executed.deltas().get("artists").unwrap().delta(), 5);

    let outcome = executed.rollback().unwrap();
    assert_eq!(outcome.state, RunState::RolledBack);
    assert_eq!(outcome.stats.new_rows, 5);
    assert_eq!(catalog.count("artists"), before);
    assert_eq!(staging.row_count().unwrap(), 5);
}

#[test]
fn test_rejecting_decision_rolls_back() {
    let catalog = TestCatalog::new();
    let reject_new = |stats: &pezzottify_catalog_merge::merge::MergeStats| stats.new_rows == 0;

    let outcome = catalog.run(
        artist_names("prefer_incoming"),
        &artists(&[&[Some(ARTIST_X), Some("X")]]),
        &reject_new,
    );

    assert_eq!(outcome.state, RunState::RolledBack);
    assert_eq!(catalog.count("artists"), 0);
}

#[test]
fn test_preview_predicts_without_writing() {
    let catalog = TestCatalog::new();
    let stats = catalog.preview(
        artist_names("prefer_incoming"),
        &artists(&[&[Some(ARTIST_X), Some("X")], &[None, Some("No id")]]),
    );

    assert_eq!(stats.new_rows, 1);
    assert_eq!(stats.excluded_rows, 1);
    assert_eq!(catalog.count("artists"), 0);
}

// =============================================================================
// Referential completion
// =============================================================================

#[test]
fn test_missing_album_becomes_one_placeholder() {
    let catalog = TestCatalog::new();
    let tracks = batch(
        EntityType::Track,
        TRACK_COLUMNS,
        &[
            &[Some(TRACK_1), Some("One"), Some("1000"), Some("false"), Some(ALBUM_A1), None],
            &[Some(TRACK_2), Some("Two"), Some("2000"), Some("true"), Some(ALBUM_A1), None],
        ],
    );

    let resolver = tracks_resolver("prefer_incoming", "replace");
    let staging = StagingTable::create(catalog.conn(), EntityType::Track, &tracks.columns).unwrap();
    staging.load(&mut tracks.ingestor()).unwrap();
    let run = MergeRun::staged(&staging, provenance())
        .plan(&resolver)
        .unwrap();
    assert!(matches!(
        run.merge_plan().operations.first(),
        Some(MergeOperation::CreatePlaceholders {
            target: EntityType::Album,
            ..
        })
    ));

    let outcome = run.execute().unwrap().commit().unwrap();

    assert_eq!(catalog.count("albums"), 1);
    let album_id = catalog.id_of(EntityType::Album, ALBUM_A1).unwrap();
    let album = catalog.store.get_entity(EntityType::Album, album_id).unwrap().unwrap();
    assert_eq!(album.name, None);
    assert_eq!(album.spotify_uri.as_deref(), Some(ALBUM_A1));

    let linked: i64 = catalog
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM tracks WHERE album_id = ?1",
            [album_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(linked, 2);
    assert_eq!(outcome.stats.placeholders_created(), 1);
    assert_eq!(outcome.deltas.get("albums").unwrap().delta(), 1);
}

#[test]
fn test_placeholder_name_filled_by_later_album_batch() {
    let catalog = TestCatalog::new();
    let tracks = batch(
        EntityType::Track,
        TRACK_COLUMNS,
        &[&[Some(TRACK_1), Some("One"), None, None, Some(ALBUM_A1), None]],
    );
    catalog.run(tracks_resolver("prefer_incoming", "replace"), &tracks, &AlwaysCommit);
    assert_eq!(catalog.name_of(EntityType::Album, ALBUM_A1), None);

    let albums = batch(
        EntityType::Album,
        &["spotify_uri", "name"],
        &[&[Some(ALBUM_A1), Some("Real Album")]],
    );
    let outcome = catalog.run(
        resolver(&[(EntityType::Album, policy(&[("name", "prefer_non_null")], None))]),
        &albums,
        &AlwaysCommit,
    );

    assert_eq!(
        catalog.name_of(EntityType::Album, ALBUM_A1).as_deref(),
        Some("Real Album")
    );
    assert_eq!(outcome.stats.existing_rows, 1);
    assert_eq!(outcome.stats.column_changes["name"], 1);
}

#[test]
fn test_failed_operation_rolls_back_placeholders() {
    let catalog = TestCatalog::new();
    let seed = batch(
        EntityType::Track,
        &["spotify_uri", "mbid", "name"],
        &[
            &[Some(TRACK_1), Some("mbid-1"), Some("One")],
            &[Some(TRACK_2), Some("mbid-2"), Some("Two")],
        ],
    );
    catalog.run(
        resolver(&[(
            EntityType::Track,
            policy(&[("name", "prefer_incoming"), ("mbid", "prefer_incoming")], None),
        )]),
        &seed,
        &AlwaysCommit,
    );

    let clash = batch(
        EntityType::Track,
        &["spotify_uri", "mbid", "album_spotify_uri"],
        &[&[Some(TRACK_1), Some("mbid-2"), Some(ALBUM_A1)]],
    );
    let result = pezzottify_catalog_merge::merge::MergeEngine::new(
        catalog.conn(),
        resolver(&[(
            EntityType::Track,
            policy(
                &[("mbid", "prefer_incoming"), ("album_spotify_uri", "prefer_incoming")],
                None,
            ),
        )]),
    )
    .run(
        EntityType::Track,
        &clash.columns,
        &mut clash.ingestor(),
        provenance(),
        &AlwaysCommit,
    );

    match result {
        Err(MergeError::Execution(e)) => assert_eq!(e.operation.as_str(), "upsert_tracks"),
        other => panic!("expected execution error, got {:?}", other.map(|o| o.state)),
    }
    assert_eq!(catalog.count("albums"), 0);
    assert_eq!(catalog.count("tracks"), 2);
}

// =============================================================================
// Invariants
// =============================================================================

#[test]
fn test_rows_without_identifier_are_never_stored() {
    let catalog = TestCatalog::new();
    let outcome = catalog.run(
        artist_names("prefer_incoming"),
        &artists(&[
            &[Some(ARTIST_X), Some("X")],
            &[None, Some("Anonymous")],
            &[Some(""), Some("Blank")],
        ]),
        &AlwaysCommit,
    );

    assert_eq!(outcome.stats.excluded_rows, 2);
    assert_eq!(outcome.stats.new_rows, 1);
    assert_eq!(catalog.store.count_rows_without_identifier().unwrap(), 0);

    let direct = catalog
        .conn()
        .execute("INSERT INTO artists (name) VALUES ('Nobody')", []);
    assert!(direct.is_err());
}

#[test]
fn test_identical_batch_is_idempotent() {
    let list = format!("{},{}", ARTIST_X, ARTIST_Y);
    let tracks = batch(
        EntityType::Track,
        TRACK_COLUMNS,
        &[
            &[Some(TRACK_1), Some("One"), Some("1000"), Some("no"), Some(ALBUM_1), Some(list.as_str())],
            &[Some(TRACK_2), Some("Two"), None, Some("yes"), Some(ALBUM_A1), Some(ARTIST_Z)],
        ],
    );

    for associations in ["prefer_non_null", "extend"] {
        let catalog = TestCatalog::new();
        let first = catalog.run(
            tracks_resolver("prefer_non_null", associations),
            &tracks,
            &AlwaysCommit,
        );
        assert_eq!(first.stats.new_rows, 2);

        let second = catalog.run(
            tracks_resolver("prefer_non_null", associations),
            &tracks,
            &AlwaysCommit,
        );
        let stats = &second.stats;
        assert_eq!(stats.new_rows, 0, "{}", associations);
        assert_eq!(stats.updated_rows, 0, "{}", associations);
        assert!(stats.column_changes.values().all(|n| *n == 0));
        assert_eq!(stats.placeholders_created(), 0);
        let assoc = stats.associations.as_ref().unwrap();
        assert_eq!(assoc.new, 0, "{}", associations);
        assert_eq!(assoc.deleted, 0, "{}", associations);
        assert_eq!(assoc.repositioned, 0, "{}", associations);
        assert!(second.deltas.is_zero());
    }
}

#[test]
fn test_predictions_match_execution() {
    let catalog = TestCatalog::new();

    let seed_artists = artists(&[&[Some(ARTIST_X), Some("X")], &[Some(ARTIST_Y), None]]);
    let artist_policy = artist_names("prefer_non_null");
    assert_prediction_matches(&catalog, &artist_policy, &seed_artists);

    let more_artists = artists(&[
        &[Some(ARTIST_Y), Some("Y")],
        &[Some(ARTIST_X), Some("Renamed")],
        &[Some(ARTIST_Z), Some("Z")],
        &[None, Some("Dropped")],
    ]);
    assert_prediction_matches(&catalog, &artist_names("prefer_incoming"), &more_artists);

    let albums = batch(
        EntityType::Album,
        &["spotify_uri", "name", "n_tracks", "artist_spotify_uris"],
        &[
            &[Some(ALBUM_1), Some("First"), Some("2"), Some(ARTIST_X)],
            &[Some("spotify:album:2"), None, None, Some("{spotify:artist:new}")],
        ],
    );
    let album_policy = resolver(&[(
        EntityType::Album,
        policy(
            &[("name", "prefer_longer"), ("n_tracks", "prefer_non_null")],
            Some("extend"),
        ),
    )]);
    assert_prediction_matches(&catalog, &album_policy, &albums);

    let list_a = format!("{},{}", ARTIST_Y, ARTIST_X);
    let list_b = format!("{}, {}, {}", ARTIST_Z, ARTIST_Z, ARTIST_X);
    let tracks = batch(
        EntityType::Track,
        TRACK_COLUMNS,
        &[
            &[Some(TRACK_1), Some("One"), Some("1000"), Some("f"), Some(ALBUM_1), Some(list_a.as_str())],
            &[Some(TRACK_2), Some("Two"), None, None, Some(ALBUM_A1), Some(list_b.as_str())],
            &[Some(TRACK_1), Some("One (remaster)"), None, Some("t"), Some(ALBUM_1), Some(list_a.as_str())],
        ],
    );
    assert_prediction_matches(&catalog, &tracks_resolver("prefer_incoming", "replace"), &tracks);

    let reordered = format!("{},{}", ARTIST_X, ARTIST_Y);
    let tracks_again = batch(
        EntityType::Track,
        TRACK_COLUMNS,
        &[&[Some(TRACK_1), Some("One"), Some("1500"), None, Some("spotify:album:3"), Some(reordered.as_str())]],
    );
    assert_prediction_matches(
        &catalog,
        &tracks_resolver("prefer_incoming", "replace"),
        &tracks_again,
    );
    assert_prediction_matches(
        &catalog,
        &tracks_resolver("prefer_non_null", "extend"),
        &tracks_again,
    );

    assert_eq!(catalog.store.count_rows_without_identifier().unwrap(), 0);
}
