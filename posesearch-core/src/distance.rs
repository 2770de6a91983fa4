//! Distance kernels shared by deduplication and the spatial indexes.
//!
//! Pose values are stored unweighted; the VP-tree and run-time queries apply
//! `WeightsSqrt` per dimension so that a squared distance weights each
//! dimension linearly.

/// Computes Euclidean (L2) distance between two vectors.
///
/// Formula: sqrt(sum((a[i] - b[i])^2))
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    euclidean_distance_squared(a, b).sqrt()
}

/// Computes squared Euclidean distance (avoids sqrt for comparisons).
#[inline]
pub fn euclidean_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Computes squared Euclidean distance with a per-dimension `sqrt(weight)`.
///
/// Formula: sum(((a[i] - b[i]) * w[i])^2)
#[inline]
pub fn weighted_distance_squared(a: &[f32], b: &[f32], weights_sqrt: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");
    debug_assert_eq!(a.len(), weights_sqrt.len(), "Weights must match dimensions");
    a.iter()
        .zip(b.iter())
        .zip(weights_sqrt.iter())
        .map(|((x, y), w)| {
            let diff = (x - y) * w;
            diff * diff
        })
        .sum()
}

/// Weighted Euclidean distance, see [`weighted_distance_squared`].
#[inline]
pub fn weighted_distance(a: &[f32], b: &[f32], weights_sqrt: &[f32]) -> f32 {
    weighted_distance_squared(a, b, weights_sqrt).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert!((euclidean_distance(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_same_vector() {
        let a = [1.0, 2.0, 3.0];
        assert!(euclidean_distance(&a, &a) < 1e-10);
    }

    #[test]
    fn test_weighted_distance_unit_weights() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 6.0, 3.0];
        let w = [1.0, 1.0, 1.0];
        assert!(
            (weighted_distance_squared(&a, &b, &w) - euclidean_distance_squared(&a, &b)).abs()
                < 1e-6
        );
    }

    #[test]
    fn test_weighted_distance_scales_dimensions() {
        let a = [0.0, 0.0];
        let b = [1.0, 1.0];
        // sqrt weights of 2 and 0 -> 4 * 1 + 0
        let w = [2.0, 0.0];
        assert!((weighted_distance_squared(&a, &b, &w) - 4.0).abs() < 1e-6);
        assert!((weighted_distance(&a, &b, &w) - 2.0).abs() < 1e-6);
    }
}
