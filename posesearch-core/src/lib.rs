//! # PoseSearch Core
//!
//! Core library for PoseSearch, a motion-matching search index builder.
//!
//! Given a database of animation clips and a feature schema, the crate
//! samples every valid pose, normalizes the feature vectors, optionally
//! compresses them with PCA, prunes near duplicates and builds a spatial
//! index for nearest-neighbour lookup. Builds are cached by a content hash
//! of every input and run in the background, cancellable at any checkpoint.
//!
//! ## Crate Features
//!
//! - `async` - Enables [`AsyncRegistry`] for tokio-compatible async builds
//!
//! ## Core Types
//!
//! ### Inputs
//!
//! - [`Database`] - Clips, settings and the schema to index them with
//! - [`Schema`] - Feature channel layout of one pose vector
//! - [`AnimationClip`] - Exclusion windows, block-transition windows, events
//!
//! ### Pipeline
//!
//! - [`build_search_index`] - Runs planning, sampling, normalization, PCA,
//!   pruning and the tree builds
//! - [`run_cache_job`] - The same pipeline behind a [`CacheStore`] lookup
//! - [`SearchIndex`] - The finished, serializable index
//!
//! ### Orchestration
//!
//! - [`TaskRegistry`] - Owns one [`AsyncCacheTask`] per database
//! - [`KeyBuilder`] - Content-hash cache keys with memoized partial hashes
//!
//! ### Extension points
//!
//! - [`SamplerFactory`] / [`AssetSampler`] - Pose feature extraction
//! - [`CacheStore`] - [`MemoryCache`], [`FileCache`] or your own backend

pub mod asset;
pub mod bones;
pub mod builder;
pub mod cancel;
pub mod clip;
pub mod database;
pub mod dedup;
pub mod deviation;
pub mod distance;
pub mod error;
pub mod index;
pub mod indexer;
pub mod key;
pub mod pca;
pub mod planner;
pub mod range;
pub mod registry;
pub mod sampler;
pub mod schema;
pub mod search_index;
pub mod storage;
pub mod task;
pub mod weights;

// Re-exports for convenient access
pub use asset::{as_dependency, Asset, AssetData, ContentHasher, Dependency, ObjectId};
pub use builder::{build_search_index, run_cache_job, validate_against_database, BuildOptions, BuildSource};
pub use cancel::CancellationToken;
pub use clip::{AnimationClip, BlendAxis, BlendParameters, BlendSpace, ClipRef};
pub use database::{
    Database, DatabaseAnimationAsset, DatabaseData, DatabaseSettings, MirrorOption, NormalizationSet,
    RootOrigin, SearchMode,
};
pub use error::{Error, PcaFailureKind, Result};
pub use index::{KdTree, KdTreeConfig, Neighbor, VpTree, VpTreeConfig};
pub use key::{CacheKey, KeyBuilder, PartialKeyHashes, PartialKeyMode};
pub use range::{FloatInterval, FloatRange};
#[cfg(feature = "async")]
pub use registry::AsyncRegistry;
pub use registry::{BuildRequest, BuildStatus, RegistryConfig, RequestKind, TaskRegistry};
pub use sampler::{AssetSampler, PoseMotion, PoseRequest, SamplerFactory};
pub use schema::{
    Bone, Channel, ChannelKind, DataPreprocessor, FeatureChannel, GroupChannel, MirrorTable, Schema, Skeleton,
};
pub use search_index::{IndexAsset, SearchIndex, SearchIndexBase};
pub use storage::{CacheStore, FileCache, MemoryCache};
pub use task::{AsyncCacheTask, BuildServices, TaskState};

/// Re-export commonly used types for convenience.
///
/// # Example
///
/// ```rust
/// use posesearch_core::prelude::*;
///
/// let skeleton = Asset::new("skeleton", Skeleton::new(vec![Bone::root("root")]));
/// let schema = Schema::new(
///     30,
///     skeleton,
///     vec![FeatureChannel::new("velocity", ChannelKind::Velocity, 3).into()],
/// );
/// assert_eq!(schema.cardinality(), 3);
/// ```
pub mod prelude {
    pub use crate::{
        AnimationClip, Asset, AssetSampler, Bone, BuildRequest, BuildStatus, CacheKey, CacheStore, ChannelKind,
        Database, DatabaseAnimationAsset, DatabaseData, DatabaseSettings, Error, FeatureChannel, FileCache,
        MemoryCache, PoseMotion, PoseRequest, RegistryConfig, Result, SamplerFactory, Schema, SearchIndex,
        SearchMode, Skeleton, TaskRegistry, TaskState,
    };
}
