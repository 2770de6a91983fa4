//! Near-duplicate vector pruning and the vector-to-pose remap it produces.
//!
//! A vector is dropped when an earlier kept vector lies within the
//! threshold (Euclidean distance). Candidates are bucketed on their first
//! coordinate with bucket width equal to the threshold, so only the two
//! neighbouring buckets have to be scanned.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::distance::euclidean_distance_squared;

const NO_VECTOR: u32 = u32::MAX;

/// Sparse multi-map between stored vectors and the poses sharing them.
///
/// An empty map is the identity: vector `i` is pose `i`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorToPoseMap {
    /// `poses[offsets[v]..offsets[v + 1]]` are the poses of vector `v`.
    offsets: Vec<u32>,
    poses: Vec<u32>,
    /// Inverse map; `NO_VECTOR` for poses whose vector was removed.
    pose_to_vector: Vec<u32>,
}

impl VectorToPoseMap {
    /// Builds a map from the pose list of every kept vector.
    pub fn from_groups(groups: &[Vec<usize>], num_poses: usize) -> Self {
        let mut map = Self {
            offsets: Vec::with_capacity(groups.len() + 1),
            poses: Vec::with_capacity(num_poses),
            pose_to_vector: vec![NO_VECTOR; num_poses],
        };
        map.offsets.push(0);
        for (vector, group) in groups.iter().enumerate() {
            for &pose in group {
                map.poses.push(pose as u32);
                map.pose_to_vector[pose] = vector as u32;
            }
            map.offsets.push(map.poses.len() as u32);
        }
        map
    }

    pub fn is_identity(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Number of vectors, `None` for the identity map.
    pub fn num_vectors(&self) -> Option<usize> {
        if self.is_identity() {
            None
        } else {
            Some(self.offsets.len() - 1)
        }
    }

    /// Vector storing `pose`, if it was not removed.
    pub fn vector_of(&self, pose: usize) -> Option<usize> {
        if self.is_identity() {
            return Some(pose);
        }
        match self.pose_to_vector.get(pose) {
            Some(&v) if v != NO_VECTOR => Some(v as usize),
            _ => None,
        }
    }

    /// Poses sharing `vector`.
    pub fn poses_of(&self, vector: usize) -> Vec<usize> {
        if self.is_identity() {
            return vec![vector];
        }
        match (self.offsets.get(vector), self.offsets.get(vector + 1)) {
            (Some(&start), Some(&end)) => self.poses[start as usize..end as usize]
                .iter()
                .map(|&p| p as usize)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn groups(&self, num_vectors: usize) -> Vec<Vec<usize>> {
        (0..num_vectors).map(|v| self.poses_of(v)).collect()
    }
}

/// Vectors left after pruning plus their remap.
#[derive(Debug, Clone, PartialEq)]
pub struct Pruned {
    pub values: Vec<f32>,
    pub map: VectorToPoseMap,
}

/// Merges vectors within `threshold` of an earlier kept vector.
///
/// Returns `None` when the threshold is not positive or nothing was merged;
/// the input then stays as is with an identity map.
pub fn prune_duplicates(values: &[f32], dims: usize, threshold: f32) -> Option<Pruned> {
    if threshold <= 0.0 || dims == 0 {
        return None;
    }
    let count = values.len() / dims;
    let threshold_squared = threshold * threshold;

    let mut buckets: HashMap<i64, Vec<usize>> = HashMap::new();
    let mut kept: Vec<usize> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for index in 0..count {
        let vector = &values[index * dims..(index + 1) * dims];
        let bucket = (vector[0] / threshold).floor() as i64;

        let mut matched: Option<usize> = None;
        for b in [bucket.saturating_sub(1), bucket, bucket.saturating_add(1)] {
            let Some(candidates) = buckets.get(&b) else {
                continue;
            };
            for &slot in candidates {
                if matched.is_some_and(|m| m <= slot) {
                    break;
                }
                let other = &values[kept[slot] * dims..(kept[slot] + 1) * dims];
                if euclidean_distance_squared(vector, other) <= threshold_squared {
                    matched = Some(slot);
                    break;
                }
            }
        }

        match matched {
            Some(slot) => groups[slot].push(index),
            None => {
                buckets.entry(bucket).or_default().push(kept.len());
                kept.push(index);
                groups.push(vec![index]);
            }
        }
    }

    if kept.len() == count {
        return None;
    }

    let mut pruned = Vec::with_capacity(kept.len() * dims);
    for &index in &kept {
        pruned.extend_from_slice(&values[index * dims..(index + 1) * dims]);
    }
    Some(Pruned {
        values: pruned,
        map: VectorToPoseMap::from_groups(&groups, count),
    })
}

/// Keeps the vectors whose pose list satisfies `keep`.
///
/// Returns `None` when every vector is kept.
pub fn retain_vectors(
    values: &[f32],
    dims: usize,
    map: &VectorToPoseMap,
    num_poses: usize,
    keep: impl Fn(&[usize]) -> bool,
) -> Option<Pruned> {
    if dims == 0 {
        return None;
    }
    let count = values.len() / dims;
    let groups = map.groups(count);

    let mut retained = Vec::with_capacity(values.len());
    let mut retained_groups = Vec::with_capacity(count);
    for (vector, group) in groups.into_iter().enumerate() {
        if keep(&group) {
            retained.extend_from_slice(&values[vector * dims..(vector + 1) * dims]);
            retained_groups.push(group);
        }
    }
    if retained_groups.len() == count {
        return None;
    }
    Some(Pruned {
        values: retained,
        map: VectorToPoseMap::from_groups(&retained_groups, num_poses),
    })
}
