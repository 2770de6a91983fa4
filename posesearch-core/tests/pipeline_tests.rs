//! End-to-end builds through the synthetic sampler.

mod common;

use common::*;
use posesearch_core::prelude::*;
use posesearch_core::storage::codec;
use posesearch_core::{
    build_search_index, AnimationClip, BuildOptions, CacheKey, CancellationToken, DataPreprocessor,
    KdTreeConfig, NormalizationSet,
};

fn key() -> CacheKey {
    CacheKey::from_bytes([0x5a; 32])
}

fn build(database: &std::sync::Arc<Database>) -> Result<SearchIndex> {
    build_search_index(
        database,
        &key(),
        &WaveFactory::new(),
        &CancellationToken::new(),
        &BuildOptions::default().with_tree_validation(1e-5),
    )
}

#[test]
fn test_builds_are_bit_identical() {
    let clips = [clip("walk", 1.0), clip("run", 2.0)];
    for mode in [SearchMode::Raw, SearchMode::PcaKdTree, SearchMode::VpTree] {
        let db = database("db", DatabaseSettings::default().with_search_mode(mode), &clips);
        let a = build(&db).unwrap();
        let b = build(&db).unwrap();
        assert_eq!(a, b, "{:?}", mode);
        assert_eq!(codec::encode(&a).unwrap(), codec::encode(&b).unwrap());
        assert!(a.compare(&b, db.read().schema.as_ref().unwrap().read().channels()).is_empty());
    }
}

#[test]
fn test_values_layout() {
    let db = database("db", DatabaseSettings::default(), &[clip("walk", 1.0), clip("run", 2.0)]);
    let index = build(&db).unwrap();
    assert_eq!(index.num_poses(), 90);
    assert_eq!(index.num_dimensions(), CARDINALITY);
    assert_eq!(index.base.values.len(), 90 * CARDINALITY);
    assert_eq!(index.base.pose_metadata.len(), 90);

    let assets = &index.base.assets;
    assert_eq!(assets[0].first_pose_idx, 0);
    assert_eq!(assets[1].first_pose_idx, assets[0].num_poses());
    assert_eq!(assets.iter().map(|a| a.num_poses()).sum::<usize>(), index.num_poses());
}

#[test]
fn test_pca_round_trip_with_full_rank() {
    let settings = DatabaseSettings::default()
        .with_search_mode(SearchMode::PcaKdTree)
        .with_principal_components(CARDINALITY);
    let db = database("db", settings, &[clip("walk", 1.0), clip("run", 2.0)]);
    let index = build(&db).unwrap();
    assert_eq!(index.num_principal_components, CARDINALITY);
    assert!((index.pca_explained_variance - 1.0).abs() < 1e-4);

    for pose in 0..index.num_poses() {
        let original = index.pose_values(pose).unwrap();
        let rebuilt = index.reconstructed_pose_values(pose).unwrap();
        for (o, r) in original.iter().zip(&rebuilt) {
            assert!((o - r).abs() <= 1e-3 * o.abs().max(1.0), "pose {}: {} vs {}", pose, o, r);
        }
    }
}

#[test]
fn test_kd_tree_finds_every_pose() {
    let settings = DatabaseSettings::default().with_principal_components(CARDINALITY);
    let db = database("db", settings, &[clip("walk", 1.0), clip("run", 2.0)]);
    let index = build(&db).unwrap();
    assert_eq!(index.kd_tree.len(), index.num_poses());

    for pose in [0, 17, 45, 89] {
        let query = index.pose_values(pose).unwrap().to_vec();
        let hits = index.search_kd_tree(&query, 1);
        assert!(index.pca_vector_poses(hits[0].index).contains(&pose));
        assert!(hits[0].distance < 1e-3);
    }
}

#[test]
fn test_vp_tree_finds_every_pose() {
    let settings = DatabaseSettings::default()
        .with_search_mode(SearchMode::VpTree)
        .with_vp_tree_seed(11);
    let db = database("db", settings, &[clip("walk", 1.0), clip("run", 2.0)]);
    let index = build(&db).unwrap();
    assert_eq!(index.vp_tree.len(), index.num_poses());

    for pose in [3, 30, 62] {
        let query = index.pose_values(pose).unwrap().to_vec();
        let hits = index.search_vp_tree(&query, 3);
        assert_eq!(hits.len(), 3);
        assert!(index.value_vector_poses(hits[0].index).contains(&pose));
    }
}

#[test]
fn test_duplicate_clips_are_pruned() {
    let settings = DatabaseSettings::default().with_pruning(1e-4, 0.0);
    let db = database("db", settings, &[clip("walk", 1.0), clip("walk_copy", 1.0)]);
    let index = build(&db).unwrap();

    assert_eq!(index.num_poses(), 60);
    assert!(index.is_values_pruned());
    assert_eq!(index.base.values.len(), 30 * CARDINALITY);
    let mut poses = index.value_vector_poses(0);
    poses.sort_unstable();
    assert_eq!(poses, vec![0, 30]);
    assert_eq!(index.pose_values(30), index.pose_values(0));
}

#[test]
fn test_block_transition_poses_leave_kd_tree() {
    let blocked = Asset::new("blocked", AnimationClip::new(1.0).with_block_transition(0.0, 2.0));
    let db = database("db", DatabaseSettings::default(), &[blocked, clip("free", 0.5)]);
    let index = build(&db).unwrap();

    assert!(index.base.any_block_transition);
    assert!(index.base.pose_metadata[..30].iter().all(|m| m.block_transition));
    assert_eq!(index.kd_tree.len(), index.num_poses() - 30);
    for vector in 0..index.kd_tree.len() {
        assert!(index.pca_vector_poses(vector).iter().all(|&p| p >= 30));
    }
}

#[test]
fn test_single_neighbor_kd_tree_drops_values() {
    let settings = DatabaseSettings::default()
        .with_principal_components(CARDINALITY)
        .with_kd_tree(KdTreeConfig::default().with_query_num_neighbors(1));
    let db = database("db", settings, &[clip("walk", 1.0)]);
    let index = build(&db).unwrap();
    assert!(index.values_dropped());
    assert!(index.pose_values(4).is_none());
    assert_eq!(index.pose_values_or_reconstructed(4).unwrap().len(), CARDINALITY);
}

#[test]
fn test_exclusion_windows_split_assets() {
    let clip = Asset::new("walk", AnimationClip::new(1.0).with_exclusion(0.4, 0.2));
    let db = database("db", DatabaseSettings::default(), &[clip]);
    let index = build(&db).unwrap();
    assert_eq!(index.base.assets.len(), 2);
    assert!(index.num_poses() < 30);
    assert_eq!(index.base.assets[1].first_pose_idx, index.base.assets[0].num_poses());
}

#[test]
fn test_normalization_set_shares_deviation() {
    let schema = schema();
    let main = database_with_schema("main", schema.clone(), DatabaseSettings::default(), &[clip("walk", 1.0)]);
    let other = database_with_schema("other", schema, DatabaseSettings::default(), &[clip("sprint", 3.0)]);
    let alone = build(&main).unwrap();

    let set = Asset::new("set", NormalizationSet::new(&[&main, &other]));
    main.write().normalization_set = Some(set);
    let shared = build(&main).unwrap();

    // the set only changes normalization, never the primary's poses
    assert_eq!(shared.num_poses(), alone.num_poses());
    assert_eq!(shared.base.values, alone.base.values);
    assert_ne!(shared.deviation, alone.deviation);
}

#[test]
fn test_dependent_without_schema_is_skipped() {
    let main = database("main", DatabaseSettings::default(), &[clip("walk", 1.0)]);
    let broken = Database::new("broken", DatabaseData::default());
    let alone = build(&main).unwrap();

    let set = Asset::new("set", NormalizationSet::new(&[&main, &broken]));
    main.write().normalization_set = Some(set);
    let with_broken = build(&main).unwrap();
    assert_eq!(with_broken.deviation, alone.deviation);
}

#[test]
fn test_no_preprocessor_keeps_raw_weights() {
    let schema = Asset::new(
        "schema",
        schema().read().clone().with_data_preprocessor(DataPreprocessor::None),
    );
    let db = database_with_schema("db", schema, DatabaseSettings::default(), &[clip("walk", 1.0)]);
    let index = build(&db).unwrap();
    assert!(index.deviation.iter().all(|&d| d == 1.0));
    // position weight 1, velocity weight 0.5
    assert!((index.weights_sqrt[0] - 1.0).abs() < 1e-6);
    assert!((index.weights_sqrt[3] - 0.5f32.sqrt()).abs() < 1e-6);
}

#[test]
fn test_cancellation_discards_work() {
    let token = CancellationToken::new();
    let factory = WaveFactory::cancelling(token.clone(), 5);
    let db = database("db", DatabaseSettings::default(), &[clip("walk", 1.0), clip("run", 2.0)]);
    let result = build_search_index(&db, &key(), &factory, &token, &BuildOptions::default());
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(factory.samples() >= 5);
    assert!(db.search_index().is_none());
}

#[test]
fn test_empty_schema_is_rejected() {
    let skeleton = skeleton();
    let empty = Asset::new("empty", Schema::new(30, skeleton, Vec::new()));
    let db = database_with_schema("db", empty, DatabaseSettings::default(), &[clip("walk", 1.0)]);
    assert!(matches!(build(&db), Err(Error::SchemaInvalid(_))));
}
