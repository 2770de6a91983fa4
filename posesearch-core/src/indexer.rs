//! Feature indexing: samples every pose of every index asset into the
//! shared value buffer.
//!
//! The value and metadata buffers are sized once, split into one disjoint
//! slice per index asset and filled in parallel.

use rayon::prelude::*;

use crate::bones::{BoneContainer, MirrorDataCache, RoledBones};
use crate::cancel::CancellationToken;
use crate::database::DatabaseData;
use crate::error::{Error, Result};
use crate::sampler::{AssetSampler, PoseRequest, SamplerFactory, SamplerKey, SamplerSet};
use crate::schema::Schema;
use crate::search_index::{EventData, IndexAsset, PoseMetadata, SearchIndexBase, SearchStats};

/// Per-asset accumulators merged into the base once every asset is done.
#[derive(Debug, Default)]
struct AssetOutput {
    events: EventData,
    accumulated_speed: f32,
    accumulated_acceleration: f32,
    max_speed: f32,
    max_acceleration: f32,
    num_samples: usize,
}

struct RoleSampling<'a> {
    role: &'a str,
    sampler: &'a dyn AssetSampler,
    bones: &'a BoneContainer,
    mirror: Option<&'a MirrorDataCache>,
}

struct IndexingContext<'a> {
    schema: &'a Schema,
    data: &'a DatabaseData,
    samplers: &'a SamplerSet,
    bones: &'a RoledBones,
}

impl IndexingContext<'_> {
    fn index_asset(
        &self,
        asset_idx: usize,
        asset: &IndexAsset,
        values: &mut [f32],
        metadata: &mut [PoseMetadata],
    ) -> Result<AssetOutput> {
        let entry = self.data.assets.get(asset.source_asset_idx).ok_or_else(|| {
            Error::IndexingFailure(format!("missing source asset {}", asset.source_asset_idx))
        })?;
        let settings = &self.data.settings;
        let cardinality = self.schema.cardinality();

        let mut roles = Vec::with_capacity(entry.roles.len());
        for roled in &entry.roles {
            let Some(bones) = self.bones.containers.get(&roled.role) else {
                continue;
            };
            let key = SamplerKey::new(&roled.clip, &roled.root_origin, &asset.blend_parameters);
            let sampler = self.samplers.get(&key).ok_or_else(|| {
                Error::IndexingFailure(format!("no sampler for clip '{}'", roled.clip.name()))
            })?;
            roles.push(RoleSampling {
                role: &roled.role,
                sampler,
                bones,
                mirror: if asset.mirrored {
                    self.bones.mirror_caches.get(&roled.role)
                } else {
                    None
                },
            });
        }

        let mut block_windows = Vec::new();
        let mut clip_events = Vec::new();
        for roled in &entry.roles {
            let clip = roled.clip.read();
            block_windows.extend(clip.block_transition_windows.iter().map(|w| w.range()));
            clip_events.extend(clip.events.iter().cloned());
        }
        let cost_addend = settings.base_cost_bias
            + entry.cost_bias
            + if asset.looping {
                settings.looping_cost_bias
            } else {
                0.0
            };
        let extrapolation = asset.extrapolation_interval(&settings.additional_extrapolation_time);
        let permutation_time = self.schema.permutation_time(asset.permutation_idx);

        let mut output = AssetOutput::default();
        for local in 0..asset.num_poses() {
            let pose_idx = asset.first_pose_idx + local;
            let time = asset.time_from_pose_index(pose_idx);
            let features = &mut values[local * cardinality..(local + 1) * cardinality];

            for (role_idx, role) in roles.iter().enumerate() {
                let request = PoseRequest {
                    role: role.role,
                    schema: self.schema,
                    asset,
                    pose_idx,
                    time,
                    permutation_time,
                    extrapolation,
                    bones: role.bones,
                    mirror: role.mirror,
                };
                let motion = role.sampler.sample_pose(&request, features).map_err(|e| {
                    Error::IndexingFailure(format!(
                        "sampling '{}' at {:.3}s failed: {}",
                        entry.roles[role_idx].clip.name(),
                        time,
                        e
                    ))
                })?;
                if role_idx == 0 {
                    output.accumulated_speed += motion.speed;
                    output.accumulated_acceleration += motion.acceleration;
                    output.max_speed = output.max_speed.max(motion.speed);
                    output.max_acceleration = output.max_acceleration.max(motion.acceleration);
                    output.num_samples += 1;
                }
            }

            metadata[local] = PoseMetadata {
                asset_idx: asset_idx as u32,
                cost_addend,
                block_transition: block_windows.iter().any(|w| w.contains(time)),
            };
        }

        let real_range = asset.real_range();
        for event in &clip_events {
            if real_range.contains(event.time) {
                if let Some(pose_idx) = asset.pose_index_from_time(event.time) {
                    output.events.add(&event.tag, pose_idx);
                }
            }
        }
        Ok(output)
    }
}

/// Samples every pose of `base.assets` (already planned) for the database
/// content `data` using `schema`.
pub fn index_database(
    base: &mut SearchIndexBase,
    data: &DatabaseData,
    schema: &Schema,
    factory: &dyn SamplerFactory,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut samplers = SamplerSet::build(factory, data, &base.assets);
    samplers.process_all(cancel)?;

    let bones = RoledBones::build(schema, data);
    let cardinality = schema.cardinality();
    let total_poses: usize = base.assets.iter().map(IndexAsset::num_poses).sum();
    base.allocate_data(cardinality, total_poses);
    cancel.check()?;

    let context = IndexingContext {
        schema,
        data,
        samplers: &samplers,
        bones: &bones,
    };

    let mut jobs = Vec::with_capacity(base.assets.len());
    let mut values_rest: &mut [f32] = &mut base.values;
    let mut metadata_rest: &mut [PoseMetadata] = &mut base.pose_metadata;
    for (asset_idx, asset) in base.assets.iter().enumerate() {
        let num_poses = asset.num_poses();
        let (values, values_tail) = std::mem::take(&mut values_rest).split_at_mut(num_poses * cardinality);
        let (metadata, metadata_tail) = std::mem::take(&mut metadata_rest).split_at_mut(num_poses);
        values_rest = values_tail;
        metadata_rest = metadata_tail;
        jobs.push((asset_idx, asset, values, metadata));
    }

    let outputs = jobs
        .into_par_iter()
        .map(|(asset_idx, asset, values, metadata)| {
            context.index_asset(asset_idx, asset, values, metadata)
        })
        .collect::<Result<Vec<_>>>()?;
    cancel.check()?;

    let mut events = EventData::default();
    let mut stats = SearchStats::default();
    let mut num_samples = 0usize;
    for output in outputs {
        events.merge(output.events);
        stats.average_speed += output.accumulated_speed;
        stats.average_acceleration += output.accumulated_acceleration;
        stats.max_speed = stats.max_speed.max(output.max_speed);
        stats.max_acceleration = stats.max_acceleration.max(output.max_acceleration);
        num_samples += output.num_samples;
    }
    if num_samples > 0 {
        let denom = 1.0 / num_samples as f32;
        stats.average_speed *= denom;
        stats.average_acceleration *= denom;
    }
    events.finalize();
    base.events = events;
    base.stats = stats;

    base.any_block_transition = base.pose_metadata.iter().any(|m| m.block_transition);
    base.min_cost_addend = base
        .pose_metadata
        .iter()
        .map(|m| m.cost_addend)
        .reduce(f32::min)
        .unwrap_or(0.0);

    cancel.check()
}
