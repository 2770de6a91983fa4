//! Async API demo using AsyncRegistry.
//!
//! Run with: cargo run --example async_demo --features async

#[cfg(feature = "async")]
use std::sync::Arc;

#[cfg(feature = "async")]
use posesearch::prelude::*;
#[cfg(feature = "async")]
use posesearch::{AsyncRegistry, BlendParameters, ClipRef, RootOrigin};

#[cfg(feature = "async")]
struct RampSampler;

#[cfg(feature = "async")]
impl AssetSampler for RampSampler {
    fn sample_pose(&self, request: &PoseRequest<'_>, features: &mut [f32]) -> Result<PoseMotion> {
        features[0] = request.time;
        Ok(PoseMotion::default())
    }
}

#[cfg(feature = "async")]
struct RampFactory;

#[cfg(feature = "async")]
impl SamplerFactory for RampFactory {
    fn create_sampler(&self, _: &ClipRef, _: &RootOrigin, _: &BlendParameters) -> Box<dyn AssetSampler> {
        Box::new(RampSampler)
    }
}

#[cfg(feature = "async")]
#[tokio::main]
async fn main() {
    println!("Async PoseSearch Demo\n");

    let skeleton = Asset::new("skeleton", Skeleton::new(vec![Bone::root("root")]));
    let schema = Asset::new(
        "schema",
        Schema::new(30, skeleton, vec![FeatureChannel::new("time", ChannelKind::Curve, 1).into()]),
    );
    let registry = AsyncRegistry::from_sync(TaskRegistry::new(
        Arc::new(MemoryCache::new()),
        Arc::new(RampFactory),
        RegistryConfig::default(),
    ));

    println!("⏳ Building 8 databases concurrently...");
    let start = std::time::Instant::now();
    let mut handles = vec![];
    for i in 0..8 {
        let registry = registry.clone();
        let database = Database::new(
            format!("db_{}", i),
            DatabaseData {
                schema: Some(schema.clone()),
                assets: vec![DatabaseAnimationAsset::new(Asset::new(
                    format!("clip_{}", i),
                    AnimationClip::new(1.0 + i as f32),
                ))],
                settings: DatabaseSettings::default().with_search_mode(SearchMode::Raw),
                ..Default::default()
            },
        );
        handles.push(tokio::spawn(async move {
            let status = registry.build(Arc::clone(&database)).await;
            (database, status)
        }));
    }

    for handle in handles {
        let (database, status) = handle.await.expect("build task panicked");
        let poses = database.search_index().map_or(0, |index| index.num_poses());
        println!("   {}: {:?} ({} poses)", database.name(), status, poses);
    }
    println!("   [OK] Finished in {:?}", start.elapsed());
}

#[cfg(not(feature = "async"))]
fn main() {
    println!("This example requires the 'async' feature.");
    println!("Run with: cargo run --example async_demo --features async");
}
