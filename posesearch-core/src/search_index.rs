//! Search index data: sampled assets, pose vectors, metadata, PCA artifacts
//! and the spatial index built over them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clip::BlendParameters;
use crate::database::SearchMode;
use crate::dedup::VectorToPoseMap;
use crate::index::{KdTree, Neighbor, VpTree};
use crate::range::{FloatInterval, FloatRange};
use crate::schema::Channel;

/// One contiguous sampled unit of the pose buffer: a source asset sampled
/// over one valid range, for one mirror variant, permutation and blend
/// sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAsset {
    /// Index into the database asset list.
    pub source_asset_idx: usize,
    pub mirrored: bool,
    pub looping: bool,
    pub disable_reselection: bool,
    pub permutation_idx: u32,
    pub blend_parameters: BlendParameters,
    /// Sampled range in asset time (normalized time for blend spaces).
    pub sampling_range: FloatRange,
    pub sample_rate: u32,
    /// Converts asset time to seconds: play length for blend spaces, else 1.
    pub to_real_time_factor: f32,
    pub first_pose_idx: usize,
}

impl IndexAsset {
    /// Sampled range in seconds.
    pub fn real_range(&self) -> FloatRange {
        self.sampling_range.scaled(self.to_real_time_factor)
    }

    pub fn first_sample_idx(&self) -> i64 {
        self.real_range().first_sample_index(self.sample_rate as f32)
    }

    pub fn last_sample_idx(&self) -> i64 {
        self.real_range().last_sample_index(self.sample_rate as f32)
    }

    pub fn num_poses(&self) -> usize {
        (self.last_sample_idx() - self.first_sample_idx() + 1).max(0) as usize
    }

    /// One past the last pose of this asset.
    pub fn end_pose_idx(&self) -> usize {
        self.first_pose_idx + self.num_poses()
    }

    pub fn is_pose_in_range(&self, pose_idx: usize) -> bool {
        pose_idx >= self.first_pose_idx && pose_idx < self.end_pose_idx()
    }

    /// Sample time of `pose_idx` in seconds.
    pub fn time_from_pose_index(&self, pose_idx: usize) -> f32 {
        let sample = self.first_sample_idx() + (pose_idx as i64 - self.first_pose_idx as i64);
        sample as f32 / self.sample_rate as f32
    }

    /// Pose sampled closest to `real_time`, if it belongs to this asset.
    pub fn pose_index_from_time(&self, real_time: f32) -> Option<usize> {
        let sample = (real_time * self.sample_rate as f32).round() as i64;
        let first = self.first_sample_idx();
        if sample < first || sample > self.last_sample_idx() {
            return None;
        }
        Some(self.first_pose_idx + (sample - first) as usize)
    }

    /// Seconds the sampler may read around the sampled range.
    pub fn extrapolation_interval(&self, additional: &FloatInterval) -> FloatInterval {
        let rate = self.sample_rate as f32;
        FloatInterval::new(
            self.first_sample_idx() as f32 / rate - additional.min,
            self.last_sample_idx() as f32 / rate + additional.max,
        )
    }
}

/// Per-pose data stored next to the feature vectors.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseMetadata {
    /// Index into `SearchIndexBase::assets`.
    pub asset_idx: u32,
    /// Added to the matching cost of this pose.
    pub cost_addend: f32,
    /// Poses that cannot be transitioned into.
    pub block_transition: bool,
}

/// Aggregate motion statistics over every sampled pose.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchStats {
    pub average_speed: f32,
    pub max_speed: f32,
    pub average_acceleration: f32,
    pub max_acceleration: f32,
}

/// Tagged events, each with the sorted pose indices it occurs on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    tracks: BTreeMap<String, Vec<usize>>,
}

impl EventData {
    pub fn add(&mut self, tag: &str, pose_idx: usize) {
        self.tracks.entry(tag.to_string()).or_default().push(pose_idx);
    }

    pub fn merge(&mut self, other: EventData) {
        for (tag, poses) in other.tracks {
            self.tracks.entry(tag).or_default().extend(poses);
        }
    }

    /// Sorts and dedups every track so indexing order never shows.
    pub fn finalize(&mut self) {
        for poses in self.tracks.values_mut() {
            poses.sort_unstable();
            poses.dedup();
        }
    }

    pub fn poses(&self, tag: &str) -> &[usize] {
        self.tracks.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tracks.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Sampled poses of one database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexBase {
    pub assets: Vec<IndexAsset>,
    /// `num_vectors * num_dimensions` floats, unweighted.
    pub values: Vec<f32>,
    pub values_vector_to_poses: VectorToPoseMap,
    pub pose_metadata: Vec<PoseMetadata>,
    pub events: EventData,
    pub stats: SearchStats,
    pub any_block_transition: bool,
    pub min_cost_addend: f32,
    pub num_dimensions: usize,
}

impl SearchIndexBase {
    /// Sizes the buffers for `num_poses` poses of `num_dimensions` floats.
    pub fn allocate_data(&mut self, num_dimensions: usize, num_poses: usize) {
        self.num_dimensions = num_dimensions;
        self.values = vec![0.0; num_dimensions * num_poses];
        self.pose_metadata = vec![PoseMetadata::default(); num_poses];
        self.values_vector_to_poses = VectorToPoseMap::default();
    }

    pub fn num_poses(&self) -> usize {
        self.pose_metadata.len()
    }

    pub fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    pub fn is_empty(&self) -> bool {
        self.pose_metadata.is_empty()
    }

    pub fn is_values_pruned(&self) -> bool {
        !self.values_vector_to_poses.is_identity()
    }

    /// Stored raw vectors.
    pub fn num_value_vectors(&self) -> usize {
        if self.num_dimensions == 0 {
            0
        } else {
            self.values.len() / self.num_dimensions
        }
    }

    /// Feature vector of `pose_idx`, unless values were dropped.
    pub fn pose_values(&self, pose_idx: usize) -> Option<&[f32]> {
        let vector = self.values_vector_to_poses.vector_of(pose_idx)?;
        let start = vector * self.num_dimensions;
        self.values.get(start..start + self.num_dimensions)
    }

    /// Asset owning `pose_idx`.
    pub fn asset_for_pose(&self, pose_idx: usize) -> Option<&IndexAsset> {
        let meta = self.pose_metadata.get(pose_idx)?;
        self.assets.get(meta.asset_idx as usize)
    }

    /// Every pose vector in pose order, expanding pruned vectors.
    pub fn all_pose_values(&self) -> Vec<f32> {
        if !self.is_values_pruned() {
            return self.values.clone();
        }
        let mut out = Vec::with_capacity(self.num_poses() * self.num_dimensions);
        for pose in 0..self.num_poses() {
            if let Some(values) = self.pose_values(pose) {
                out.extend_from_slice(values);
            }
        }
        out
    }

    fn compare(&self, other: &SearchIndexBase, channels: &[Channel], report: &mut Vec<String>) {
        let dims = self.num_dimensions;
        if self.values.len() != other.values.len() {
            report.push("Values.Num mismatch".to_string());
        } else if dims > 0 && self.values.len() % dims != 0 {
            report.push("Values.Num is not a multiple of the schema cardinality".to_string());
        } else if dims > 0 {
            for (vector, (a, b)) in self
                .values
                .chunks(dims)
                .zip(other.values.chunks(dims))
                .enumerate()
            {
                if a != b {
                    report.push(format!("Values mismatch at vector {}", vector));
                    compare_channel_values(1, a, b, channels, report);
                }
            }
        }
        if self.values_vector_to_poses != other.values_vector_to_poses {
            report.push("ValuesVectorToPoseIndexes mismatch".to_string());
        }
        if self.pose_metadata != other.pose_metadata {
            report.push("PoseMetadata mismatch".to_string());
        }
        if self.any_block_transition != other.any_block_transition {
            report.push("AnyBlockTransition mismatch".to_string());
        }
        if self.assets != other.assets {
            report.push("Assets mismatch".to_string());
        }
        if self.min_cost_addend != other.min_cost_addend {
            report.push("MinCostAddend mismatch".to_string());
        }
        if self.stats != other.stats {
            report.push("Stats mismatch".to_string());
        }
        if self.events != other.events {
            report.push("EventData mismatch".to_string());
        }
    }
}

fn compare_channel_values(
    depth: usize,
    a: &[f32],
    b: &[f32],
    channels: &[Channel],
    report: &mut Vec<String>,
) {
    for channel in channels {
        let offset = channel.data_offset();
        for i in 0..channel.cardinality() {
            let (va, vb) = (a[offset + i], b[offset + i]);
            if va != vb {
                report.push(format!(
                    "{}{} - {} ({}, {})",
                    "    ".repeat(depth),
                    channel.name(),
                    i,
                    va,
                    vb
                ));
            }
        }
        compare_channel_values(depth + 1, a, b, channel.sub_channels(), report);
    }
}

/// A finished search index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchIndex {
    pub base: SearchIndexBase,
    pub search_mode: SearchMode,
    /// Per-dimension square-rooted weights.
    pub weights_sqrt: Vec<f32>,
    /// Per-dimension deviation used to build `weights_sqrt`.
    pub deviation: Vec<f32>,
    /// Weighted mean of every pose, `num_dimensions` long.
    pub mean: Vec<f32>,
    /// `num_dimensions x num_principal_components`, row-major.
    pub pca_projection_matrix: Vec<f32>,
    pub num_principal_components: usize,
    pub pca_explained_variance: f32,
    /// `num_pca_vectors x num_principal_components`.
    pub pca_values: Vec<f32>,
    pub pca_values_vector_to_poses: VectorToPoseMap,
    pub kd_tree: KdTree,
    pub vp_tree: VpTree,
}

impl SearchIndex {
    pub fn num_dimensions(&self) -> usize {
        self.base.num_dimensions()
    }

    pub fn num_poses(&self) -> usize {
        self.base.num_poses()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn is_values_pruned(&self) -> bool {
        self.base.is_values_pruned()
    }

    pub fn is_pca_values_pruned(&self) -> bool {
        !self.pca_values_vector_to_poses.is_identity()
    }

    pub fn num_pca_vectors(&self) -> usize {
        if self.num_principal_components == 0 {
            0
        } else {
            self.pca_values.len() / self.num_principal_components
        }
    }

    /// Raw feature vector of `pose_idx`, if values are stored.
    pub fn pose_values(&self, pose_idx: usize) -> Option<&[f32]> {
        self.base.pose_values(pose_idx)
    }

    /// PCA vector of `pose_idx`, if it was not pruned.
    pub fn pose_pca_values(&self, pose_idx: usize) -> Option<&[f32]> {
        let k = self.num_principal_components;
        let vector = self.pca_values_vector_to_poses.vector_of(pose_idx)?;
        self.pca_values.get(vector * k..(vector + 1) * k)
    }

    /// Rebuilds the unweighted feature vector of `pose_idx` from PCA space.
    pub fn reconstructed_pose_values(&self, pose_idx: usize) -> Option<Vec<f32>> {
        let pca = self.pose_pca_values(pose_idx)?;
        let dims = self.num_dimensions();
        let k = self.num_principal_components;
        if self.mean.len() != dims || self.pca_projection_matrix.len() != dims * k {
            return None;
        }
        let values = (0..dims)
            .map(|d| {
                let row = &self.pca_projection_matrix[d * k..(d + 1) * k];
                let weighted: f32 = row.iter().zip(pca).map(|(p, v)| p * v).sum::<f32>() + self.mean[d];
                let w = self.weights_sqrt[d];
                if w != 0.0 {
                    weighted / w
                } else {
                    0.0
                }
            })
            .collect();
        Some(values)
    }

    /// Feature vector of `pose_idx`, from storage or reconstructed from PCA.
    pub fn pose_values_or_reconstructed(&self, pose_idx: usize) -> Option<Vec<f32>> {
        match self.pose_values(pose_idx) {
            Some(values) => Some(values.to_vec()),
            None => self.reconstructed_pose_values(pose_idx),
        }
    }

    /// Projects an unweighted feature vector into PCA space.
    pub fn pca_project(&self, values: &[f32]) -> Vec<f32> {
        let dims = self.num_dimensions();
        let k = self.num_principal_components;
        let mut out = vec![0.0f32; k];
        if values.len() != dims || self.mean.len() != dims || self.pca_projection_matrix.len() != dims * k {
            return out;
        }
        for d in 0..dims {
            let centered = values[d] * self.weights_sqrt[d] - self.mean[d];
            let row = &self.pca_projection_matrix[d * k..(d + 1) * k];
            for (o, p) in out.iter_mut().zip(row) {
                *o += centered * p;
            }
        }
        out
    }

    /// `k` nearest PCA vectors to the projection of `query`; hit indices are
    /// PCA vector indices, see [`SearchIndex::pca_vector_poses`].
    pub fn search_kd_tree(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let projected = self.pca_project(query);
        self.kd_tree.search_knn(&self.pca_values, &projected, k)
    }

    /// `k` nearest raw vectors to `query` under the weighted metric; hit
    /// indices are value vector indices, see [`SearchIndex::value_vector_poses`].
    pub fn search_vp_tree(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        self.vp_tree
            .search_knn(&self.base.values, &self.weights_sqrt, query, k)
    }

    pub fn pca_vector_poses(&self, vector: usize) -> Vec<usize> {
        self.pca_values_vector_to_poses.poses_of(vector)
    }

    pub fn value_vector_poses(&self, vector: usize) -> Vec<usize> {
        self.base.values_vector_to_poses.poses_of(vector)
    }

    /// Drops the raw values; poses are reconstructed from PCA space instead.
    pub fn reset_values(&mut self) {
        self.base.values = Vec::new();
        self.base.values_vector_to_poses = VectorToPoseMap::default();
    }

    /// True when raw values were dropped after the KD-tree build.
    pub fn values_dropped(&self) -> bool {
        self.base.values.is_empty() && !self.base.is_empty()
    }

    /// Lists every field that differs from `other`, with per-channel value
    /// details. Empty when the two indexes are identical.
    pub fn compare(&self, other: &SearchIndex, channels: &[Channel]) -> Vec<String> {
        let mut report = Vec::new();
        self.base.compare(&other.base, channels, &mut report);
        if self.weights_sqrt != other.weights_sqrt {
            report.push("WeightsSqrt mismatch".to_string());
        }
        if self.pca_values != other.pca_values {
            report.push("PCAValues mismatch".to_string());
        }
        if self.pca_values_vector_to_poses != other.pca_values_vector_to_poses {
            report.push("PCAValuesVectorToPoseIndexes mismatch".to_string());
        }
        if self.pca_projection_matrix != other.pca_projection_matrix {
            report.push("PCAProjectionMatrix mismatch".to_string());
        }
        if self.mean != other.mean {
            report.push("Mean mismatch".to_string());
        }
        if self.kd_tree != other.kd_tree {
            report.push("KDTree mismatch".to_string());
        }
        if self.vp_tree != other.vp_tree {
            report.push("VPTree mismatch".to_string());
        }
        if self.pca_explained_variance != other.pca_explained_variance {
            report.push("PCAExplainedVariance mismatch".to_string());
        }
        report
    }
}
