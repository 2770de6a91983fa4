//! Quick start example for PoseSearch.
//!
//! Builds a small locomotion database with a synthetic sampler, caches the
//! index on disk and looks up the pose closest to a query.

use posesearch::prelude::*;
use posesearch::{run_cache_job, BlendParameters, BuildOptions, BuildSource, CancellationToken, ClipRef, KeyBuilder,
    PartialKeyMode, RootOrigin};

/// Stands in for a real skeleton evaluator: the foot swings at a rate
/// derived from the clip length, the phase wraps once per second.
struct GaitSampler {
    stride: f32,
}

impl AssetSampler for GaitSampler {
    fn sample_pose(&self, request: &PoseRequest<'_>, features: &mut [f32]) -> Result<PoseMotion> {
        let t = request.time;
        let swing = (t * self.stride).sin();
        features[0] = swing;
        features[1] = 0.1 * (t * self.stride * 2.0).cos().max(0.0);
        features[2] = self.stride * (t * self.stride).cos();
        features[3] = (t * std::f32::consts::TAU).sin();
        features[4] = (t * std::f32::consts::TAU).cos();
        Ok(PoseMotion {
            speed: self.stride,
            acceleration: 0.0,
        })
    }
}

struct GaitFactory;

impl SamplerFactory for GaitFactory {
    fn create_sampler(&self, clip: &ClipRef, _: &RootOrigin, _: &BlendParameters) -> Box<dyn AssetSampler> {
        Box::new(GaitSampler {
            stride: std::f32::consts::TAU / clip.read().play_length,
        })
    }
}

fn main() -> Result<()> {
    println!("🌟 PoseSearch Quick Start Example\n");

    let skeleton = Asset::new(
        "biped",
        Skeleton::new(vec![Bone::root("root"), Bone::child("pelvis", 0), Bone::child("foot_l", 1)]),
    );
    let schema = Asset::new(
        "locomotion_schema",
        Schema::new(
            30,
            skeleton,
            vec![
                FeatureChannel::new("foot_position", ChannelKind::Position, 2)
                    .with_bone("foot_l")
                    .into(),
                FeatureChannel::new("foot_velocity", ChannelKind::Velocity, 1)
                    .with_bone("foot_l")
                    .with_weight(0.5)
                    .into(),
                FeatureChannel::new("phase", ChannelKind::Phase, 2).into(),
            ],
        ),
    );

    let clips = [
        Asset::new("walk", AnimationClip::new(1.2)),
        Asset::new("jog", AnimationClip::new(0.8)),
        Asset::new("run_start", AnimationClip::new(1.5).with_block_transition(0.0, 0.3)),
    ];
    let database = Database::new(
        "locomotion",
        DatabaseData {
            schema: Some(schema),
            assets: clips.iter().cloned().map(DatabaseAnimationAsset::new).collect(),
            settings: DatabaseSettings::default().with_principal_components(3),
            ..Default::default()
        },
    );

    let cache_dir = std::env::temp_dir().join("posesearch_quickstart");
    let _ = std::fs::remove_dir_all(&cache_dir);
    let store = FileCache::open(&cache_dir)?;
    let key = KeyBuilder::build(database.clone(), None, PartialKeyMode::DoNotUse).finalize();
    println!("🔑 Cache key: {}\n", key);

    let cancel = CancellationToken::new();
    let options = BuildOptions::default().with_tree_validation(1e-5);
    for attempt in 1..=2 {
        let (index, source) = run_cache_job(&database, &key, &store, &GaitFactory, &cancel, &options)?;
        let origin = match source {
            BuildSource::Built => "built",
            BuildSource::Cache => "loaded from cache",
        };
        println!(
            "📦 Attempt {}: {} poses, {} dims -> {} principal components ({})",
            attempt,
            index.num_poses(),
            index.num_dimensions(),
            index.num_principal_components,
            origin
        );
    }
    println!();

    let (index, _) = run_cache_job(&database, &key, &store, &GaitFactory, &cancel, &options)?;
    let query = index.pose_values_or_reconstructed(12).unwrap_or_default();
    println!("🔍 Poses closest to pose 12:");
    for hit in index.search_kd_tree(&query, 3) {
        println!(
            "   vector {} -> poses {:?} (distance: {:.4})",
            hit.index,
            index.pca_vector_poses(hit.index),
            hit.distance
        );
    }

    let _ = std::fs::remove_dir_all(&cache_dir);
    println!("\n✨ Done!");
    Ok(())
}
