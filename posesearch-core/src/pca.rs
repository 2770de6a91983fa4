//! Principal component analysis of the weighted pose values.
//!
//! The covariance is accumulated in f64 and decomposed with nalgebra's
//! symmetric eigen solver. Components are ordered by descending eigenvalue;
//! equal eigenvalues keep the solver's order so the basis is reproducible.

use nalgebra::{DMatrix, SymmetricEigen};

use crate::database::SearchMode;
use crate::dedup::VectorToPoseMap;
use crate::error::{Error, PcaFailureKind, Result};
use crate::search_index::SearchIndex;

const MAX_EIGEN_ITERATIONS: usize = 10_000;
const SMALL_VARIANCE: f64 = 1e-4;

/// Basis and projected data produced by [`compute_pca`].
#[derive(Debug, Clone, PartialEq)]
pub struct PcaOutput {
    /// Column mean of the weighted values.
    pub mean: Vec<f32>,
    /// `dims x components`, row-major; column `c` is the `c`-th component.
    pub projection: Vec<f32>,
    /// `num_rows x components` centered values projected on the basis.
    pub values: Vec<f32>,
    /// Kept eigenvalues over the sum of every eigenvalue.
    pub explained_variance: f32,
}

/// Runs PCA over `values`, `num_rows x dims` unweighted rows.
///
/// Rows are multiplied by `weights_sqrt` before centering.
pub fn compute_pca(values: &[f32], dims: usize, weights_sqrt: &[f32], components: usize) -> Result<PcaOutput> {
    if dims == 0 || components == 0 || components > dims || weights_sqrt.len() != dims {
        return Err(Error::PcaFailure(PcaFailureKind::InvalidInput));
    }
    let rows = values.len() / dims;
    if rows == 0 || values.len() % dims != 0 {
        return Err(Error::PcaFailure(PcaFailureKind::InvalidInput));
    }

    let weighted = DMatrix::<f64>::from_fn(rows, dims, |r, c| {
        values[r * dims + c] as f64 * weights_sqrt[c] as f64
    });
    if weighted.iter().any(|v| !v.is_finite()) {
        return Err(Error::PcaFailure(PcaFailureKind::NumericalIssue));
    }

    let mean = weighted.row_mean();
    let centered = DMatrix::<f64>::from_fn(rows, dims, |r, c| weighted[(r, c)] - mean[c]);

    let divisor = rows.saturating_sub(1).max(1) as f64;
    let covariance = centered.transpose() * &centered / divisor;

    let eigen = SymmetricEigen::try_new(covariance, f64::EPSILON, MAX_EIGEN_ITERATIONS)
        .ok_or(Error::PcaFailure(PcaFailureKind::NoConvergence))?;
    if eigen.eigenvalues.iter().any(|v| !v.is_finite())
        || eigen.eigenvectors.iter().any(|v| !v.is_finite())
    {
        return Err(Error::PcaFailure(PcaFailureKind::NumericalIssue));
    }

    let mut order: Vec<usize> = (0..dims).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let kept = &order[..components];

    let basis = DMatrix::<f64>::from_fn(dims, components, |d, c| eigen.eigenvectors[(d, kept[c])]);
    let projected = &centered * &basis;

    let total: f64 = eigen.eigenvalues.iter().sum();
    let accumulated: f64 = kept.iter().map(|&i| eigen.eigenvalues[i]).sum();
    let explained_variance = if total > SMALL_VARIANCE {
        (accumulated / total) as f32
    } else {
        0.0
    };

    Ok(PcaOutput {
        mean: mean.iter().map(|&v| v as f32).collect(),
        projection: row_major(&basis),
        values: row_major(&projected),
        explained_variance,
    })
}

fn row_major(matrix: &DMatrix<f64>) -> Vec<f32> {
    let mut out = Vec::with_capacity(matrix.len());
    for row in matrix.row_iter() {
        out.extend(row.iter().map(|&v| v as f32));
    }
    out
}

/// Fills the PCA fields of `index` from its pose values.
///
/// Does nothing but clear them unless the index searches a KD-tree and has
/// poses, dimensions and components.
pub fn preprocess_pca(index: &mut SearchIndex, components: usize) -> Result<()> {
    index.pca_values.clear();
    index.mean.clear();
    index.pca_projection_matrix.clear();
    index.pca_values_vector_to_poses = VectorToPoseMap::default();
    index.pca_explained_variance = 0.0;
    index.num_principal_components = 0;

    let dims = index.num_dimensions();
    if index.search_mode != SearchMode::PcaKdTree || dims == 0 || index.num_poses() == 0 || components == 0 {
        return Ok(());
    }

    // one row per pose, so pca vector i is pose i until pruned
    let values = index.base.all_pose_values();
    let output = compute_pca(&values, dims, &index.weights_sqrt, components)?;
    index.mean = output.mean;
    index.pca_projection_matrix = output.projection;
    index.pca_values = output.values;
    index.pca_explained_variance = output.explained_variance;
    index.num_principal_components = components;
    Ok(())
}
