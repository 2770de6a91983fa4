//! Error types for PoseSearch index builds.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using PoseSearch's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure class reported by the symmetric eigen solver during PCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PcaFailureKind {
    /// The input contained NaN/inf or the decomposition lost precision.
    NumericalIssue,
    /// The iterative solver ran out of sweeps.
    NoConvergence,
    /// The covariance matrix was empty or not square.
    InvalidInput,
    /// Anything else.
    Unknown,
}

impl PcaFailureKind {
    /// Human-readable reason, as printed in build logs.
    pub fn reason(&self) -> &'static str {
        match self {
            PcaFailureKind::NumericalIssue => "Numerical Issues",
            PcaFailureKind::NoConvergence => "No Convergence",
            PcaFailureKind::InvalidInput => "Invalid Input",
            PcaFailureKind::Unknown => "Unknown Reasons",
        }
    }
}

impl fmt::Display for PcaFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Errors that can occur while planning, indexing or caching a search index.
#[derive(Debug, Error)]
pub enum Error {
    /// Schema is missing or has zero cardinality.
    #[error("invalid schema: {0}")]
    SchemaInvalid(String),

    /// A dependency is not fully loaded yet. The request is deferred.
    #[error("asset not ready: {0}")]
    AssetNotReady(String),

    /// Unsupported/duplicate role, or a mirrored request without mirror tables.
    #[error("invalid role or mirror configuration: {0}")]
    RoleOrMirrorConfigInvalid(String),

    /// A per-asset indexer reported a sampling failure.
    #[error("indexing failed: {0}")]
    IndexingFailure(String),

    /// The eigen solver did not succeed.
    #[error("PCA failed because of '{0}'")]
    PcaFailure(PcaFailureKind),

    /// The cancellation token was observed set at a checkpoint.
    #[error("build cancelled")]
    Cancelled,

    /// A cached blob failed framing, decoding or validation.
    #[error("cache corrupted: {0}")]
    CacheCorrupted(String),

    /// Vector dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// IO error in a cache backend.
    #[error("io error: {0}")]
    IoError(String),

    /// Encoding a search index failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Task registry error (a background worker could not be joined).
    #[error("registry error: {0}")]
    RegistryError(String),
}

impl Error {
    /// Returns true for outcomes that are control flow rather than failures:
    /// cancellation, cache corruption (silently rebuilt) and deferred loads.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::CacheCorrupted(_) | Error::AssetNotReady(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DimensionMismatch {
            expected: 24,
            got: 12,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 24, got 12");
    }

    #[test]
    fn test_pca_failure_reason() {
        let err = Error::PcaFailure(PcaFailureKind::NoConvergence);
        assert_eq!(err.to_string(), "PCA failed because of 'No Convergence'");
        assert_eq!(PcaFailureKind::Unknown.reason(), "Unknown Reasons");
    }

    #[test]
    fn test_routine_errors() {
        assert!(Error::Cancelled.is_routine());
        assert!(Error::CacheCorrupted("bad magic".into()).is_routine());
        assert!(Error::AssetNotReady("clip".into()).is_routine());
        assert!(!Error::IndexingFailure("walk".into()).is_routine());
        assert!(!Error::SchemaInvalid("empty".into()).is_routine());
    }
}
