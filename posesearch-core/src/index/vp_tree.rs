//! Vantage-point tree over weighted raw pose vectors.
//!
//! Each node picks a vantage point at random (from a seeded ChaCha stream,
//! so builds are reproducible across platforms), sorts the remaining
//! vectors by their weighted distance to it and splits them at the median.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::{sort_neighbors, KnnHeap, Neighbor, ValidationReport};
use crate::distance::{weighted_distance, weighted_distance_squared};

const NO_CHILD: u32 = u32::MAX;

/// VP-tree construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VpTreeConfig {
    /// Seed of the vantage-point selection stream.
    pub seed: u64,
}

impl VpTreeConfig {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpNode {
    /// Index of the vantage vector.
    pub point: u32,
    /// Median distance: children closer than this are `inside`.
    pub radius: f32,
    pub inside: u32,
    pub outside: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpTree {
    dims: usize,
    nodes: Vec<VpNode>,
}

impl VpTree {
    /// Builds a tree over `data.len() / dims` vectors using the weighted
    /// metric defined by `weights_sqrt`.
    pub fn build(data: &[f32], dims: usize, weights_sqrt: &[f32], config: &VpTreeConfig) -> Self {
        let mut tree = Self {
            dims,
            nodes: Vec::new(),
        };
        if dims == 0 || data.len() < dims || weights_sqrt.len() != dims {
            return tree;
        }
        let count = data.len() / dims;
        tree.nodes.reserve(count);
        let mut items: Vec<u32> = (0..count as u32).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        tree.build_node(data, weights_sqrt, &mut items, &mut rng);
        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    fn vector<'a>(&self, data: &'a [f32], index: u32) -> &'a [f32] {
        let start = index as usize * self.dims;
        &data[start..start + self.dims]
    }

    fn build_node(
        &mut self,
        data: &[f32],
        weights_sqrt: &[f32],
        items: &mut [u32],
        rng: &mut ChaCha8Rng,
    ) -> u32 {
        if items.is_empty() {
            return NO_CHILD;
        }

        let pick = rng.gen_range(0..items.len());
        items.swap(0, pick);
        let point = items[0];
        let node_index = self.nodes.len() as u32;
        self.nodes.push(VpNode {
            point,
            radius: 0.0,
            inside: NO_CHILD,
            outside: NO_CHILD,
        });

        let rest = &mut items[1..];
        if rest.is_empty() {
            return node_index;
        }

        let vantage = self.vector(data, point);
        let mut keyed: Vec<(f32, u32)> = rest
            .iter()
            .map(|&i| (weighted_distance(vantage, self.vector(data, i), weights_sqrt), i))
            .collect();
        keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        for (slot, (_, i)) in rest.iter_mut().zip(&keyed) {
            *slot = *i;
        }

        let median = rest.len() / 2;
        let radius = keyed[median].0;
        let (inside_items, outside_items) = rest.split_at_mut(median);

        let inside = self.build_node(data, weights_sqrt, inside_items, rng);
        let outside = self.build_node(data, weights_sqrt, outside_items, rng);
        let node = &mut self.nodes[node_index as usize];
        node.radius = radius;
        node.inside = inside;
        node.outside = outside;
        node_index
    }

    /// The `k` nearest vectors under the weighted metric, closest first.
    pub fn search_knn(
        &self,
        data: &[f32],
        weights_sqrt: &[f32],
        query: &[f32],
        k: usize,
    ) -> Vec<Neighbor> {
        let mut heap = KnnHeap::new(k);
        if !self.nodes.is_empty() && query.len() == self.dims {
            self.knn_node(data, weights_sqrt, query, 0, &mut heap);
        }
        heap.into_sorted()
    }

    fn knn_node(
        &self,
        data: &[f32],
        weights_sqrt: &[f32],
        query: &[f32],
        node: u32,
        heap: &mut KnnHeap,
    ) {
        if node == NO_CHILD {
            return;
        }
        let n = &self.nodes[node as usize];
        let d2 = weighted_distance_squared(query, self.vector(data, n.point), weights_sqrt);
        heap.push(n.point as usize, d2);
        let d = d2.sqrt();

        // inside holds distances <= radius, outside >= radius
        if d < n.radius {
            self.knn_node(data, weights_sqrt, query, n.inside, heap);
            if d + heap.worst().sqrt() >= n.radius {
                self.knn_node(data, weights_sqrt, query, n.outside, heap);
            }
        } else {
            self.knn_node(data, weights_sqrt, query, n.outside, heap);
            if d - heap.worst().sqrt() <= n.radius {
                self.knn_node(data, weights_sqrt, query, n.inside, heap);
            }
        }
    }

    /// Every vector within `radius` of `query`, closest first.
    pub fn search_radius(
        &self,
        data: &[f32],
        weights_sqrt: &[f32],
        query: &[f32],
        radius: f32,
    ) -> Vec<Neighbor> {
        let mut hits = Vec::new();
        if self.nodes.is_empty() || query.len() != self.dims {
            return hits;
        }
        let mut stack = vec![0u32];
        while let Some(node) = stack.pop() {
            if node == NO_CHILD {
                continue;
            }
            let n = &self.nodes[node as usize];
            let d = weighted_distance(query, self.vector(data, n.point), weights_sqrt);
            if d <= radius {
                hits.push(Neighbor {
                    index: n.point as usize,
                    distance: d,
                });
            }
            if d - radius <= n.radius {
                stack.push(n.inside);
            }
            if d + radius >= n.radius {
                stack.push(n.outside);
            }
        }
        sort_neighbors(&mut hits);
        hits
    }

    /// Checks every indexed vector finds itself within `epsilon`.
    pub fn validate(&self, data: &[f32], weights_sqrt: &[f32], epsilon: f32) -> ValidationReport {
        let mut report = ValidationReport::default();
        let count = if self.dims == 0 { 0 } else { data.len() / self.dims };
        for i in 0..count {
            let query = self.vector(data, i as u32);
            let hits = self.search_radius(data, weights_sqrt, query, epsilon);
            match hits.iter().position(|h| h.index == i) {
                Some(rank) => report.max_rank = report.max_rank.max(rank),
                None => report.missing.push(i),
            }
        }
        report
    }
}
