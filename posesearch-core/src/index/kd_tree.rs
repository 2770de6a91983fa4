//! KD-tree over PCA-projected pose vectors.
//!
//! Nodes split on the dimension with the widest spread at the midpoint of
//! its extent. Partitioning is stable, so the tree depends only on the input
//! values, never on memory layout or thread scheduling.

use serde::{Deserialize, Serialize};

use super::{sort_neighbors, KnnHeap, Neighbor, ValidationReport};
use crate::distance::euclidean_distance_squared;

/// Configuration for KD-tree construction and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdTreeConfig {
    /// Leaves hold at most this many vectors unless they cannot be split.
    pub max_leaf_size: usize,
    /// Neighbors requested by run-time queries. With one or fewer, the raw
    /// values buffer is dropped and poses are reconstructed from PCA space.
    pub query_num_neighbors: usize,
}

impl Default for KdTreeConfig {
    fn default() -> Self {
        Self {
            max_leaf_size: 16,
            query_num_neighbors: 200,
        }
    }
}

impl KdTreeConfig {
    pub fn with_max_leaf_size(mut self, size: usize) -> Self {
        self.max_leaf_size = size.max(1);
        self
    }

    pub fn with_query_num_neighbors(mut self, count: usize) -> Self {
        self.query_num_neighbors = count;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KdNode {
    /// `indices[start..end]`
    Leaf { start: u32, end: u32 },
    /// Vectors with `v[dim] < value` go left.
    Split {
        dim: u32,
        value: f32,
        left: u32,
        right: u32,
    },
}

/// Static KD-tree. Searches take the same buffer the tree was built from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KdTree {
    dims: usize,
    nodes: Vec<KdNode>,
    indices: Vec<u32>,
}

impl KdTree {
    /// Builds a tree over `data.len() / dims` vectors.
    pub fn build(data: &[f32], dims: usize, config: &KdTreeConfig) -> Self {
        let mut tree = Self {
            dims,
            nodes: Vec::new(),
            indices: Vec::new(),
        };
        if dims == 0 || data.len() < dims {
            return tree;
        }
        let count = data.len() / dims;
        tree.indices = (0..count as u32).collect();
        let leaf_size = config.max_leaf_size.max(1);
        tree.build_node(data, 0, count, leaf_size);
        tree
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn vector<'a>(&self, data: &'a [f32], index: u32) -> &'a [f32] {
        let start = index as usize * self.dims;
        &data[start..start + self.dims]
    }

    fn build_node(&mut self, data: &[f32], start: usize, end: usize, leaf_size: usize) -> u32 {
        let node_index = self.nodes.len() as u32;
        self.nodes.push(KdNode::Leaf {
            start: start as u32,
            end: end as u32,
        });
        if end - start <= leaf_size {
            return node_index;
        }

        // widest dimension
        let mut best_dim = 0;
        let mut best_spread = 0.0f32;
        let mut best_range = (0.0f32, 0.0f32);
        for dim in 0..self.dims {
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for &i in &self.indices[start..end] {
                let v = data[i as usize * self.dims + dim];
                lo = lo.min(v);
                hi = hi.max(v);
            }
            if hi - lo > best_spread {
                best_spread = hi - lo;
                best_dim = dim;
                best_range = (lo, hi);
            }
        }
        if best_spread <= 0.0 {
            return node_index;
        }

        let split = best_range.0 + (best_range.1 - best_range.0) * 0.5;
        let (left, right): (Vec<u32>, Vec<u32>) = self.indices[start..end]
            .iter()
            .partition(|&&i| data[i as usize * self.dims + best_dim] < split);
        if left.is_empty() || right.is_empty() {
            return node_index;
        }

        let mid = start + left.len();
        self.indices[start..mid].copy_from_slice(&left);
        self.indices[mid..end].copy_from_slice(&right);

        let left_node = self.build_node(data, start, mid, leaf_size);
        let right_node = self.build_node(data, mid, end, leaf_size);
        self.nodes[node_index as usize] = KdNode::Split {
            dim: best_dim as u32,
            value: split,
            left: left_node,
            right: right_node,
        };
        node_index
    }

    /// The `k` nearest vectors, closest first.
    pub fn search_knn(&self, data: &[f32], query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut heap = KnnHeap::new(k);
        if !self.nodes.is_empty() && query.len() == self.dims {
            self.knn_node(data, query, 0, &mut heap);
        }
        heap.into_sorted()
    }

    fn knn_node(&self, data: &[f32], query: &[f32], node: u32, heap: &mut KnnHeap) {
        match &self.nodes[node as usize] {
            KdNode::Leaf { start, end } => {
                for &i in &self.indices[*start as usize..*end as usize] {
                    let d = euclidean_distance_squared(query, self.vector(data, i));
                    heap.push(i as usize, d);
                }
            }
            KdNode::Split {
                dim,
                value,
                left,
                right,
            } => {
                let diff = query[*dim as usize] - value;
                let (near, far) = if diff < 0.0 {
                    (*left, *right)
                } else {
                    (*right, *left)
                };
                self.knn_node(data, query, near, heap);
                if diff * diff <= heap.worst() {
                    self.knn_node(data, query, far, heap);
                }
            }
        }
    }

    /// Every vector within `radius` of `query`, closest first.
    pub fn search_radius(&self, data: &[f32], query: &[f32], radius: f32) -> Vec<Neighbor> {
        let mut hits = Vec::new();
        if !self.nodes.is_empty() && query.len() == self.dims {
            self.radius_node(data, query, 0, radius * radius, &mut hits);
        }
        sort_neighbors(&mut hits);
        hits
    }

    fn radius_node(
        &self,
        data: &[f32],
        query: &[f32],
        node: u32,
        radius_squared: f32,
        hits: &mut Vec<Neighbor>,
    ) {
        match &self.nodes[node as usize] {
            KdNode::Leaf { start, end } => {
                for &i in &self.indices[*start as usize..*end as usize] {
                    let d = euclidean_distance_squared(query, self.vector(data, i));
                    if d <= radius_squared {
                        hits.push(Neighbor {
                            index: i as usize,
                            distance: d.sqrt(),
                        });
                    }
                }
            }
            KdNode::Split {
                dim,
                value,
                left,
                right,
            } => {
                let diff = query[*dim as usize] - value;
                if diff < 0.0 || diff * diff <= radius_squared {
                    self.radius_node(data, query, *left, radius_squared, hits);
                }
                if diff >= 0.0 || diff * diff <= radius_squared {
                    self.radius_node(data, query, *right, radius_squared, hits);
                }
            }
        }
    }

    /// Checks every indexed vector finds itself within `epsilon`.
    pub fn validate(&self, data: &[f32], epsilon: f32) -> ValidationReport {
        let mut report = ValidationReport::default();
        for i in 0..self.len() {
            let query = self.vector(data, i as u32);
            let hits = self.search_radius(data, query, epsilon);
            match hits.iter().position(|h| h.index == i) {
                Some(rank) => report.max_rank = report.max_rank.max(rank),
                None => report.missing.push(i),
            }
        }
        report
    }
}
