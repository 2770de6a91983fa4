//! Spatial indexes over pose vectors.
//!
//! Neither tree owns the vectors it indexes: searches take the flat value
//! buffer (`num_vectors * dims` floats) the tree was built from. Both trees
//! are plain data, compare with `==` and serialize with serde, so two builds
//! from identical inputs can be checked for byte-for-byte equality.

pub mod kd_tree;
pub mod vp_tree;

use std::cmp::Ordering;

pub use kd_tree::{KdTree, KdTreeConfig};
pub use vp_tree::{VpTree, VpTreeConfig};

/// A search hit: vector index and Euclidean distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

/// Outcome of a self-lookup validation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    /// Vectors that could not find themselves within the tolerance.
    pub missing: Vec<usize>,
    /// Worst rank at which a vector found itself among equally-close hits.
    /// A query needs at least `max_rank + 1` neighbors to always see the
    /// queried vector.
    pub max_rank: usize,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Heap entry ordered by squared distance, then index (max-heap: worst first).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub index: usize,
    pub distance_squared: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance_squared
            .partial_cmp(&other.distance_squared)
            .unwrap_or(Ordering::Equal)
            .then(self.index.cmp(&other.index))
    }
}

/// Bounded best-k collector.
pub(crate) struct KnnHeap {
    k: usize,
    heap: std::collections::BinaryHeap<Candidate>,
}

impl KnnHeap {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: std::collections::BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn push(&mut self, index: usize, distance_squared: f32) {
        if self.k == 0 {
            return;
        }
        let candidate = Candidate {
            index,
            distance_squared,
        };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek() {
            if candidate < *worst {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    /// Squared distance any new hit must beat; infinite until full.
    pub fn worst(&self) -> f32 {
        if self.heap.len() < self.k {
            f32::INFINITY
        } else {
            self.heap
                .peek()
                .map(|c| c.distance_squared)
                .unwrap_or(f32::INFINITY)
        }
    }

    pub fn into_sorted(self) -> Vec<Neighbor> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor {
                index: c.index,
                distance: c.distance_squared.sqrt(),
            })
            .collect()
    }
}

/// Sorts hits by distance, then index.
pub(crate) fn sort_neighbors(hits: &mut [Neighbor]) {
    hits.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_knn_heap_keeps_best() {
        let mut heap = KnnHeap::new(2);
        heap.push(0, 9.0);
        heap.push(1, 1.0);
        assert_eq!(heap.worst(), 9.0);
        heap.push(2, 4.0);
        heap.push(3, 16.0);
        let hits = heap.into_sorted();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 1);
        assert_eq!(hits[1].index, 2);
        assert!((hits[1].distance - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_knn_heap_ties_prefer_lower_index() {
        let mut heap = KnnHeap::new(1);
        heap.push(5, 1.0);
        heap.push(2, 1.0);
        assert_eq!(heap.into_sorted()[0].index, 2);
    }

    #[test]
    fn test_zero_k_collects_nothing() {
        let mut heap = KnnHeap::new(0);
        heap.push(0, 0.0);
        assert!(heap.into_sorted().is_empty());
    }
}
