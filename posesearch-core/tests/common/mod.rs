//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use posesearch_core::prelude::*;
use posesearch_core::{BlendParameters, CancellationToken, ClipRef, RootOrigin};

/// Feature layout of [`schema`]: position (3), velocity (3), phase (2).
pub const CARDINALITY: usize = 8;

/// Deterministic sampler: every feature is a smooth function of the clip's
/// play length and the sample time. Mirrored poses negate the x components.
pub struct WaveSampler {
    frequency: f32,
    delay: Option<Duration>,
    cancel_after: Option<(CancellationToken, usize)>,
    sampled: Arc<AtomicUsize>,
}

impl AssetSampler for WaveSampler {
    fn sample_pose(&self, request: &PoseRequest<'_>, features: &mut [f32]) -> Result<PoseMotion> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let count = self.sampled.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((token, after)) = &self.cancel_after {
            if count >= *after {
                token.cancel();
            }
        }

        let t = request.time + request.permutation_time;
        let w = self.frequency;
        let sign = if request.mirror.is_some() { -1.0 } else { 1.0 };
        features[0] = sign * (t * w).sin();
        features[1] = 0.5 * t;
        features[2] = (t * w * 0.5).cos();
        features[3] = sign * w * (t * w).cos();
        features[4] = 0.5;
        features[5] = -0.5 * w * (t * w * 0.5).sin();
        features[6] = (t * std::f32::consts::TAU).sin();
        features[7] = (t * std::f32::consts::TAU).cos();
        Ok(PoseMotion {
            speed: (features[3] * features[3] + features[4] * features[4]).sqrt(),
            acceleration: w * w,
        })
    }
}

/// Factory for [`WaveSampler`] with optional per-pose delay and a token
/// cancelled after a number of samples.
#[derive(Default)]
pub struct WaveFactory {
    pub delay: Option<Duration>,
    pub cancel_after: Option<(CancellationToken, usize)>,
    pub sampled: Arc<AtomicUsize>,
}

impl WaveFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn cancelling(token: CancellationToken, after: usize) -> Self {
        Self {
            cancel_after: Some((token, after)),
            ..Default::default()
        }
    }

    pub fn samples(&self) -> usize {
        self.sampled.load(Ordering::SeqCst)
    }
}

impl SamplerFactory for WaveFactory {
    fn create_sampler(&self, clip: &ClipRef, _: &RootOrigin, params: &BlendParameters) -> Box<dyn AssetSampler> {
        Box::new(WaveSampler {
            frequency: 1.0 + clip.read().play_length + params[0],
            delay: self.delay,
            cancel_after: self.cancel_after.clone(),
            sampled: Arc::clone(&self.sampled),
        })
    }
}

pub fn skeleton() -> Arc<Asset<Skeleton>> {
    Asset::new(
        "skeleton",
        Skeleton::new(vec![Bone::root("root"), Bone::child("pelvis", 0), Bone::child("foot_l", 1)]),
    )
}

pub fn schema() -> Arc<Asset<Schema>> {
    Asset::new(
        "schema",
        Schema::new(
            30,
            skeleton(),
            vec![
                FeatureChannel::new("foot_position", ChannelKind::Position, 3)
                    .with_bone("foot_l")
                    .into(),
                FeatureChannel::new("foot_velocity", ChannelKind::Velocity, 3)
                    .with_bone("foot_l")
                    .with_weight(0.5)
                    .into(),
                FeatureChannel::new("phase", ChannelKind::Phase, 2).into(),
            ],
        ),
    )
}

pub fn clip(name: &str, play_length: f32) -> ClipRef {
    Asset::new(name, AnimationClip::new(play_length))
}

pub fn database(name: &str, settings: DatabaseSettings, clips: &[ClipRef]) -> Arc<Database> {
    database_with_schema(name, schema(), settings, clips)
}

pub fn database_with_schema(
    name: &str,
    schema: Arc<Asset<Schema>>,
    settings: DatabaseSettings,
    clips: &[ClipRef],
) -> Arc<Database> {
    Database::new(
        name,
        DatabaseData {
            schema: Some(schema),
            assets: clips.iter().cloned().map(DatabaseAnimationAsset::new).collect(),
            settings,
            ..Default::default()
        },
    )
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(prefix: &str) -> std::path::PathBuf {
    let id = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir()
        .join("posesearch_it")
        .join(format!("{}_{}_{}", prefix, std::process::id(), id))
}
