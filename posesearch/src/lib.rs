//! # PoseSearch
//!
//! **Builds motion-matching search indexes from animation clips.**
//!
//! A motion-matching runtime picks the next pose to play by searching a
//! database of pre-sampled poses for the one whose features (foot
//! positions, velocities, trajectory, phase) best match the query. This
//! crate builds that database offline:
//!
//! - **Planning** - valid sampling ranges per clip, minus exclusion windows
//! - **Sampling** - one feature vector per pose through your [`SamplerFactory`]
//! - **Normalization** - per-channel mean deviation, shared across a
//!   [`NormalizationSet`] when configured
//! - **Compression** - PCA down to `number_of_principal_components`
//! - **Pruning** - near-duplicate poses collapse onto one stored vector
//! - **Indexing** - a [`KdTree`] over PCA space or a [`VpTree`] over raw values
//!
//! ## Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **Content-hash cache** | Builds are keyed by a BLAKE3 hash of every input |
//! | **Background builds** | [`TaskRegistry`] runs builds on the rayon pool |
//! | **Cancellation** | Modifying an input cancels every build depending on it |
//! | **Deterministic** | Identical inputs give bit-identical indexes |
//! | **Async API** | Tokio-compatible async builds (feature flag) |
//!
//! ## Quick Start
//!
//! ```rust
//! use posesearch::prelude::*;
//! use posesearch::{build_search_index, BlendParameters, BuildOptions, CancellationToken, ClipRef, KeyBuilder,
//!     PartialKeyMode, RootOrigin};
//!
//! // Writes a phase feature; a real sampler evaluates the clip's bones.
//! struct PhaseSampler;
//!
//! impl AssetSampler for PhaseSampler {
//!     fn sample_pose(&self, request: &PoseRequest<'_>, features: &mut [f32]) -> Result<PoseMotion> {
//!         let angle = request.time * std::f32::consts::TAU;
//!         features[0] = angle.sin();
//!         features[1] = angle.cos();
//!         Ok(PoseMotion::default())
//!     }
//! }
//!
//! struct Phases;
//!
//! impl SamplerFactory for Phases {
//!     fn create_sampler(&self, _: &ClipRef, _: &RootOrigin, _: &BlendParameters) -> Box<dyn AssetSampler> {
//!         Box::new(PhaseSampler)
//!     }
//! }
//!
//! let skeleton = Asset::new("skeleton", Skeleton::new(vec![Bone::root("root")]));
//! let schema = Asset::new(
//!     "schema",
//!     Schema::new(30, skeleton, vec![FeatureChannel::new("phase", ChannelKind::Phase, 2).into()]),
//! );
//! let walk = Asset::new("walk", AnimationClip::new(1.0));
//! let database = Database::new(
//!     "locomotion",
//!     DatabaseData {
//!         schema: Some(schema),
//!         assets: vec![DatabaseAnimationAsset::new(walk)],
//!         settings: DatabaseSettings::default().with_search_mode(SearchMode::VpTree),
//!         ..Default::default()
//!     },
//! );
//!
//! let key = KeyBuilder::build(database.clone(), None, PartialKeyMode::DoNotUse).finalize();
//! let index = build_search_index(
//!     &database,
//!     &key,
//!     &Phases,
//!     &CancellationToken::new(),
//!     &BuildOptions::default(),
//! )?;
//! assert_eq!(index.num_poses(), 30);
//! assert_eq!(index.num_dimensions(), 2);
//! # Ok::<(), posesearch::Error>(())
//! ```
//!
//! ### Background Builds
//!
//! In an editor or asset pipeline, hand databases to a [`TaskRegistry`]
//! and tick it. Report modifications so stale builds get cancelled:
//!
//! ```no_run
//! use std::sync::Arc;
//! use posesearch::prelude::*;
//!
//! fn rebuild(registry: &TaskRegistry, database: &Arc<Database>, clip: &Arc<Asset<AnimationClip>>) {
//!     registry.pre_modified_clip(clip);
//!     clip.write().play_length = 2.0;
//!     registry.post_modified_clip(clip);
//!
//!     match registry.request_build(database, BuildRequest::new_request().waiting()) {
//!         BuildStatus::Success => println!("{} poses", database.search_index().map_or(0, |i| i.num_poses())),
//!         BuildStatus::Failed => eprintln!("build failed"),
//!         BuildStatus::InProgress => {}
//!     }
//! }
//! ```
//!
//! ## Crate Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `async` | Enables `AsyncRegistry` for tokio compatibility |
//!
//! Enable features in `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! posesearch = { version = "0.1", features = ["async"] }
//! ```
//!
//! ## Architecture
//!
//! PoseSearch is organized into two crates:
//!
//! - **`posesearch-core`** - Core library with no async runtime dependency
//! - **`posesearch`** - Main crate that re-exports everything
//!
//! ### Core Components
//!
//! - [`Database`] - Clips, settings and the schema they are indexed with
//! - [`SearchIndex`] - The finished index, serializable through [`CacheStore`]
//! - [`TaskRegistry`] - One cancellable background build per database
//! - [`KeyBuilder`] - Cache keys over the whole dependency graph
//! - [`FileCache`] - CRC-checked on-disk cache entries
//!
//! ## Logging
//!
//! Build progress is reported through `tracing` (`BeginCache`,
//! `BuildIndex From Cache`, `BuildIndex Succeeded`, `Cancelled`). Install
//! any subscriber to see it.
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`](crate::Result), which uses
//! the [`Error`] enum for error types.
//!
//! ## Thread Safety
//!
//! - [`Database`] and every [`Asset`] guard their data with a `RwLock`
//! - [`TaskRegistry`] serializes task mutations behind one lock
//! - [`SearchIndex`] is immutable once installed and shared as `Arc`

// Re-export everything from core
pub use posesearch_core::*;
