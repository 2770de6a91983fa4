//! The build pipeline and the cache job run by every async cache task.
//!
//! [`build_search_index`] runs every stage from planning to the spatial
//! trees; [`run_cache_job`] wraps it with the cache lookup, the cache-hit
//! validation and the final put.

use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::cancel::CancellationToken;
use crate::database::{Database, DatabaseData, SearchMode};
use crate::dedup::{prune_duplicates, retain_vectors};
use crate::deviation::calculate_mean_deviation;
use crate::error::{Error, Result};
use crate::index::{KdTree, VpTree, VpTreeConfig};
use crate::indexer::index_database;
use crate::key::CacheKey;
use crate::pca::preprocess_pca;
use crate::planner::{init_index_assets, validate_mirroring};
use crate::sampler::SamplerFactory;
use crate::schema::{DataPreprocessor, Schema};
use crate::search_index::{SearchIndex, SearchIndexBase};
use crate::storage::{codec, CacheStore};
use crate::weights::preprocess_weights;

/// Knobs of one cache job.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BuildOptions {
    /// Ignore cache hits and always run the pipeline.
    pub force_rebuild: bool,
    /// When set, built trees are checked for self-lookup within this
    /// distance and mismatches are logged.
    pub tree_validation_epsilon: Option<f32>,
}

impl BuildOptions {
    pub fn with_force_rebuild(mut self, force: bool) -> Self {
        self.force_rebuild = force;
        self
    }

    pub fn with_tree_validation(mut self, epsilon: f32) -> Self {
        self.tree_validation_epsilon = Some(epsilon);
        self
    }
}

/// Where the index of a finished cache job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSource {
    Cache,
    Built,
}

/// Indexes one database of the normalization set.
fn build_index_base(
    data: &DatabaseData,
    schema: &Schema,
    factory: &dyn SamplerFactory,
    cancel: &CancellationToken,
) -> Result<SearchIndexBase> {
    schema.validate()?;
    validate_mirroring(schema, data)?;
    cancel.check()?;

    let mut base = SearchIndexBase {
        assets: init_index_assets(data, schema)?,
        ..Default::default()
    };
    cancel.check()?;

    index_database(&mut base, data, schema, factory, cancel)?;
    let expected = base.num_poses() * schema.cardinality();
    if base.values.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            got: base.values.len(),
        });
    }
    Ok(base)
}

/// Runs the whole pipeline for `database`.
///
/// `key` only labels log lines and seeds the VP-tree when the database has
/// no explicit seed. Any cancellation observed at a checkpoint returns
/// `Error::Cancelled`; the caller never sees a partial index.
pub fn build_search_index(
    database: &Arc<Database>,
    key: &CacheKey,
    factory: &dyn SamplerFactory,
    cancel: &CancellationToken,
    options: &BuildOptions,
) -> Result<SearchIndex> {
    let name = database.name().to_string();
    let main_data = database.read().clone();
    let main_schema = match &main_data.schema {
        Some(schema) => schema.read().clone(),
        None => return Err(Error::SchemaInvalid("database has no schema".into())),
    };
    if main_schema.cardinality() == 0 {
        return Err(Error::SchemaInvalid("schema cardinality is zero".into()));
    }
    let common_schema = main_schema.data_preprocessor == DataPreprocessor::NormalizeWithCommonSchema;

    let mut schemas: Vec<Schema> = Vec::new();
    let mut bases: Vec<SearchIndexBase> = Vec::new();
    for (position, dependent) in database.index_base_databases().iter().enumerate() {
        let data = if position == 0 {
            main_data.clone()
        } else {
            dependent.read().clone()
        };
        let schema = if common_schema || position == 0 {
            Some(main_schema.clone())
        } else {
            data.schema.as_ref().map(|s| s.read().clone())
        };

        let result = match &schema {
            Some(schema) => build_index_base(&data, schema, factory, cancel),
            None => Err(Error::SchemaInvalid(format!(
                "dependent database '{}' has no schema",
                dependent.name()
            ))),
        };
        match result {
            Ok(base) => {
                schemas.push(schema.unwrap_or_else(|| main_schema.clone()));
                bases.push(base);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) if position == 0 => return Err(err),
            Err(err) => {
                tracing::warn!(
                    key = %key,
                    database = %name,
                    dependent = %dependent.name(),
                    %err,
                    "dependent database skipped for normalization"
                );
            }
        }
    }

    let Some(primary) = bases.first() else {
        return Err(Error::SchemaInvalid(format!("database '{}' was not indexed", name)));
    };
    let dims = main_schema.cardinality();
    let settings = &main_data.settings;
    let mut index = SearchIndex {
        base: primary.clone(),
        search_mode: settings.search_mode,
        ..Default::default()
    };

    if let Some(pruned) = prune_duplicates(&index.base.values, dims, settings.pose_pruning_similarity_threshold) {
        tracing::debug!(
            database = %name,
            poses = index.num_poses(),
            vectors = pruned.values.len() / dims,
            "pruned duplicate pose values"
        );
        index.base.values = pruned.values;
        index.base.values_vector_to_poses = pruned.map;
    }

    let sources: Vec<(&Schema, &SearchIndexBase)> = schemas.iter().zip(bases.iter()).collect();
    let deviation = calculate_mean_deviation(&sources);
    index.weights_sqrt = preprocess_weights(&main_schema, &deviation);
    index.deviation = deviation;
    cancel.check()?;

    let components = settings.number_of_principal_components.min(dims);
    preprocess_pca(&mut index, components)?;
    cancel.check()?;

    let is_kd_tree = settings.search_mode == SearchMode::PcaKdTree;
    if is_kd_tree && index.num_principal_components > 0 {
        let k = index.num_principal_components;
        if let Some(pruned) = prune_duplicates(
            &index.pca_values,
            k,
            settings.pca_values_pruning_similarity_threshold,
        ) {
            index.pca_values = pruned.values;
            index.pca_values_vector_to_poses = pruned.map;
        }
        cancel.check()?;

        if index.base.any_block_transition {
            let metadata = &index.base.pose_metadata;
            if let Some(retained) = retain_vectors(
                &index.pca_values,
                k,
                &index.pca_values_vector_to_poses,
                index.base.num_poses(),
                |poses| poses.iter().any(|&pose| !metadata[pose].block_transition),
            ) {
                index.pca_values = retained.values;
                index.pca_values_vector_to_poses = retained.map;
            }
        }

        index.kd_tree = KdTree::build(&index.pca_values, k, &settings.kd_tree);
        if let Some(epsilon) = options.tree_validation_epsilon {
            let report = index.kd_tree.validate(&index.pca_values, epsilon);
            if !report.is_valid() {
                tracing::warn!(
                    database = %name,
                    missing = report.missing.len(),
                    max_rank = report.max_rank,
                    "KD-tree self lookup failed"
                );
            }
        }
        cancel.check()?;

        if settings.kd_tree.query_num_neighbors <= 1 {
            index.reset_values();
        }
    }

    if settings.search_mode == SearchMode::VpTree {
        let seed = settings.vp_tree_seed.unwrap_or_else(|| key.seed());
        index.vp_tree = VpTree::build(&index.base.values, dims, &index.weights_sqrt, &VpTreeConfig::new(seed));
        if let Some(epsilon) = options.tree_validation_epsilon {
            let report = index.vp_tree.validate(&index.base.values, &index.weights_sqrt, epsilon);
            if !report.is_valid() {
                tracing::warn!(
                    database = %name,
                    missing = report.missing.len(),
                    max_rank = report.max_rank,
                    "VP-tree self lookup failed"
                );
            }
        }
        cancel.check()?;
    }

    tracing::info!(key = %key, database = %name, poses = index.num_poses(), "BuildIndex Succeeded");
    Ok(index)
}

/// Checks that a cached index still matches `database`: same
/// dimensionality, every referenced source asset exists, every enabled asset
/// is referenced and no disabled asset is.
pub fn validate_against_database(index: &SearchIndex, database: &Database) -> Result<()> {
    let data = database.read();
    let cardinality = data
        .schema
        .as_ref()
        .map(|s| s.read().cardinality())
        .unwrap_or(0);
    if index.num_dimensions() != cardinality {
        return Err(Error::CacheCorrupted(format!(
            "schema cardinality mismatch {} vs {}",
            index.num_dimensions(),
            cardinality
        )));
    }

    let mut referenced = RoaringBitmap::new();
    for asset in &index.base.assets {
        if asset.source_asset_idx >= data.assets.len() {
            return Err(Error::CacheCorrupted(format!(
                "assets reference missing asset with index {}",
                asset.source_asset_idx
            )));
        }
        referenced.insert(asset.source_asset_idx as u32);
    }

    for (asset_idx, entry) in data.assets.iter().enumerate() {
        let name = entry.primary().map(|r| r.clip.name().to_string()).unwrap_or_default();
        let is_referenced = referenced.contains(asset_idx as u32);
        if entry.enabled && !is_referenced {
            return Err(Error::CacheCorrupted(format!(
                "couldn't find references to enabled asset '{}'",
                name
            )));
        }
        if !entry.enabled && is_referenced {
            return Err(Error::CacheCorrupted(format!(
                "found references to disabled asset '{}'",
                name
            )));
        }
    }
    Ok(())
}

/// Looks `key` up in `store`, falling back to a full build on a miss, a
/// corrupted blob or a forced rebuild. Built indexes are put back.
pub fn run_cache_job(
    database: &Arc<Database>,
    key: &CacheKey,
    store: &dyn CacheStore,
    factory: &dyn SamplerFactory,
    cancel: &CancellationToken,
    options: &BuildOptions,
) -> Result<(SearchIndex, BuildSource)> {
    let name = database.name().to_string();

    if !options.force_rebuild {
        let cached = match store.get(key) {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(key = %key, database = %name, %err, "cache get failed");
                None
            }
        };
        if let Some(bytes) = cached {
            match codec::decode(&bytes).and_then(|index| {
                validate_against_database(&index, database)?;
                Ok(index)
            }) {
                Ok(index) => {
                    tracing::info!(key = %key, database = %name, "BuildIndex From Cache");
                    return Ok((index, BuildSource::Cache));
                }
                Err(err) => {
                    tracing::warn!(key = %key, database = %name, %err, "BuildIndex From Cache Corrupted");
                }
            }
        }
    }
    cancel.check()?;

    let index = match build_search_index(database, key, factory, cancel, options) {
        Ok(index) => index,
        Err(Error::Cancelled) => {
            tracing::info!(key = %key, database = %name, "BuildIndex Cancelled");
            return Err(Error::Cancelled);
        }
        Err(err) => {
            tracing::error!(key = %key, database = %name, %err, "BuildIndex Failed");
            return Err(err);
        }
    };

    // a cancelled owner may already be gone, so nothing is stored for it
    cancel.check()?;
    match codec::encode(&index).and_then(|blob| store.put(key, &blob)) {
        Ok(()) => tracing::debug!(key = %key, database = %name, "BuildIndex stored"),
        Err(err) => tracing::warn!(key = %key, database = %name, %err, "Failed to store"),
    }
    Ok((index, BuildSource::Built))
}
