//! Interface to the external pose sampler.
//!
//! Samplers are created once per distinct (clip, root origin, blend
//! parameters) tuple, pre-processed in parallel, then shared read-only by
//! every indexer that samples that tuple.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::asset::ObjectId;
use crate::bones::{BoneContainer, MirrorDataCache};
use crate::cancel::CancellationToken;
use crate::clip::{BlendParameters, ClipRef};
use crate::database::{DatabaseData, RootOrigin};
use crate::error::Result;
use crate::range::FloatInterval;
use crate::schema::Schema;
use crate::search_index::IndexAsset;

/// One pose to sample for one role.
pub struct PoseRequest<'a> {
    pub role: &'a str,
    pub schema: &'a Schema,
    pub asset: &'a IndexAsset,
    pub pose_idx: usize,
    /// Sample time in seconds.
    pub time: f32,
    /// Time offset of the asset's permutation, in seconds.
    pub permutation_time: f32,
    /// Seconds the sampler may read; times outside must be clamped.
    pub extrapolation: FloatInterval,
    pub bones: &'a BoneContainer,
    /// Set for mirrored assets.
    pub mirror: Option<&'a MirrorDataCache>,
}

/// Root motion measured at a sampled pose.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseMotion {
    pub speed: f32,
    pub acceleration: f32,
}

/// Samples feature values of one clip.
pub trait AssetSampler: Send + Sync {
    /// Asset-level pre-processing (root motion extraction and similar).
    fn process(&mut self) -> Result<()> {
        Ok(())
    }

    /// Writes the channels of `request.role` into `features`, a
    /// schema-cardinality slice of the pose buffer.
    fn sample_pose(&self, request: &PoseRequest<'_>, features: &mut [f32]) -> Result<PoseMotion>;
}

/// Creates samplers for the indexer.
pub trait SamplerFactory: Send + Sync {
    fn create_sampler(
        &self,
        clip: &ClipRef,
        root_origin: &RootOrigin,
        blend_parameters: &BlendParameters,
    ) -> Box<dyn AssetSampler>;
}

/// Identity of a shared sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SamplerKey {
    clip: ObjectId,
    root_origin: [u32; 4],
    blend_parameters: [u32; 3],
}

impl SamplerKey {
    pub fn new(clip: &ClipRef, root_origin: &RootOrigin, blend_parameters: &BlendParameters) -> Self {
        Self {
            clip: clip.id(),
            root_origin: root_origin.bits(),
            blend_parameters: blend_parameters.map(f32::to_bits),
        }
    }
}

/// Deduplicated samplers for every role of every index asset.
#[derive(Default)]
pub struct SamplerSet {
    samplers: Vec<Box<dyn AssetSampler>>,
    by_key: BTreeMap<SamplerKey, usize>,
}

impl SamplerSet {
    pub fn build(factory: &dyn SamplerFactory, data: &DatabaseData, assets: &[IndexAsset]) -> Self {
        let mut set = Self::default();
        for index_asset in assets {
            let Some(entry) = data.assets.get(index_asset.source_asset_idx) else {
                continue;
            };
            for roled in &entry.roles {
                let key = SamplerKey::new(&roled.clip, &roled.root_origin, &index_asset.blend_parameters);
                if !set.by_key.contains_key(&key) {
                    set.by_key.insert(key, set.samplers.len());
                    set.samplers.push(factory.create_sampler(
                        &roled.clip,
                        &roled.root_origin,
                        &index_asset.blend_parameters,
                    ));
                }
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// Runs every sampler's pre-processing in parallel.
    pub fn process_all(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.samplers
            .par_iter_mut()
            .try_for_each(|sampler| sampler.process())?;
        cancel.check()
    }

    pub fn get(&self, key: &SamplerKey) -> Option<&dyn AssetSampler> {
        self.by_key.get(key).map(|&i| self.samplers[i].as_ref())
    }
}
