//! Background builds through the task registry.
//!
//! Run with: RUST_LOG=posesearch_core=info cargo run --example registry_demo

use std::sync::Arc;
use std::time::Duration;

use posesearch::prelude::*;
use posesearch::{BlendParameters, ClipRef, RootOrigin};
use tracing_subscriber::EnvFilter;

struct SlowSampler;

impl AssetSampler for SlowSampler {
    fn sample_pose(&self, request: &PoseRequest<'_>, features: &mut [f32]) -> Result<PoseMotion> {
        std::thread::sleep(Duration::from_micros(500));
        let angle = request.time * std::f32::consts::TAU;
        features[0] = angle.sin();
        features[1] = angle.cos();
        features[2] = request.time;
        Ok(PoseMotion::default())
    }
}

struct SlowFactory;

impl SamplerFactory for SlowFactory {
    fn create_sampler(&self, _: &ClipRef, _: &RootOrigin, _: &BlendParameters) -> Box<dyn AssetSampler> {
        Box::new(SlowSampler)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let skeleton = Asset::new("skeleton", Skeleton::new(vec![Bone::root("root")]));
    let schema = Asset::new(
        "schema",
        Schema::new(
            30,
            skeleton,
            vec![
                FeatureChannel::new("phase", ChannelKind::Phase, 2).into(),
                FeatureChannel::new("progress", ChannelKind::Curve, 1).into(),
            ],
        ),
    );
    let walk = Asset::new("walk", AnimationClip::new(4.0));
    let database = Database::new(
        "locomotion",
        DatabaseData {
            schema: Some(schema),
            assets: vec![DatabaseAnimationAsset::new(walk.clone())],
            ..Default::default()
        },
    );

    let registry = TaskRegistry::new(Arc::new(MemoryCache::new()), Arc::new(SlowFactory), RegistryConfig::default());

    println!("⏳ Requesting a background build...");
    registry.request_build(&database, BuildRequest::new_request());
    println!("   state: {:?}", registry.task_state(&database));

    println!("✂️  Editing the clip while the build runs...");
    registry.pre_modified_clip(&walk);
    walk.write().play_length = 2.0;
    registry.post_modified_clip(&walk);
    println!("   state: {:?}", registry.task_state(&database));
    registry.tick();
    println!("   tasks after tick: {}\n", registry.num_tasks());

    println!("⏳ Requesting again and ticking until done...");
    registry.request_build(&database, BuildRequest::new_request());
    while registry.task_state(&database) == Some(TaskState::Prestarted) {
        std::thread::sleep(Duration::from_millis(10));
        registry.tick();
    }

    match database.search_index() {
        Some(index) => println!("✅ Installed index with {} poses", index.num_poses()),
        None => println!("❌ No index installed ({:?})", registry.task_state(&database)),
    }
}
