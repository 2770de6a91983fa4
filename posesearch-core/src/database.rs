//! Databases: the asset list and settings indexed into one search index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::asset::{as_dependency, Asset, AssetData, ContentHasher, Dependency, ObjectId};
use crate::clip::{BlendParameters, ClipRef};
use crate::index::kd_tree::KdTreeConfig;
use crate::range::FloatInterval;
use crate::schema::{Role, SchemaRef, DEFAULT_ROLE};
use crate::search_index::SearchIndex;

/// Which mirror variants of an asset get indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MirrorOption {
    #[default]
    UnmirroredOnly,
    MirroredOnly,
    UnmirroredAndMirrored,
}

impl MirrorOption {
    pub fn includes_unmirrored(&self) -> bool {
        matches!(
            self,
            MirrorOption::UnmirroredOnly | MirrorOption::UnmirroredAndMirrored
        )
    }

    pub fn includes_mirrored(&self) -> bool {
        matches!(
            self,
            MirrorOption::MirroredOnly | MirrorOption::UnmirroredAndMirrored
        )
    }
}

/// Spatial index built for run-time queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SearchMode {
    /// No spatial index; queries scan every pose.
    Raw,
    /// KD-tree over PCA-projected weighted values.
    #[default]
    PcaKdTree,
    /// VP-tree over weighted raw values.
    VpTree,
}

/// Transform applied to the root of a clip sampled for one role.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RootOrigin {
    pub translation: [f32; 3],
    pub yaw: f32,
}

impl RootOrigin {
    pub(crate) fn bits(&self) -> [u32; 4] {
        [
            self.translation[0].to_bits(),
            self.translation[1].to_bits(),
            self.translation[2].to_bits(),
            self.yaw.to_bits(),
        ]
    }
}

/// A clip bound to a role.
#[derive(Clone)]
pub struct RoledClip {
    pub role: Role,
    pub clip: ClipRef,
    pub root_origin: RootOrigin,
}

/// One entry of a database's asset list.
#[derive(Clone)]
pub struct DatabaseAnimationAsset {
    /// Clips per role; the first entry drives play length and blend grid.
    pub roles: Vec<RoledClip>,
    pub enabled: bool,
    pub mirror_option: MirrorOption,
    pub looping: bool,
    pub disable_reselection: bool,
    /// Sub-range of the clip to sample, in seconds. `None` samples everything.
    pub sampling_range: Option<FloatInterval>,
    pub cost_bias: f32,
    /// Set on entries added by branch-in synchronization.
    pub synchronized_with: Option<ObjectId>,
}

impl DatabaseAnimationAsset {
    pub fn new(clip: ClipRef) -> Self {
        Self {
            roles: vec![RoledClip {
                role: DEFAULT_ROLE.to_string(),
                clip,
                root_origin: RootOrigin::default(),
            }],
            enabled: true,
            mirror_option: MirrorOption::default(),
            looping: false,
            disable_reselection: false,
            sampling_range: None,
            cost_bias: 0.0,
            synchronized_with: None,
        }
    }

    /// Adds a clip for another role.
    pub fn with_role(mut self, role: impl Into<Role>, clip: ClipRef, root_origin: RootOrigin) -> Self {
        self.roles.push(RoledClip {
            role: role.into(),
            clip,
            root_origin,
        });
        self
    }

    pub fn with_mirror_option(mut self, option: MirrorOption) -> Self {
        self.mirror_option = option;
        self
    }

    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_disable_reselection(mut self, disable: bool) -> Self {
        self.disable_reselection = disable;
        self
    }

    pub fn with_sampling_range(mut self, min: f32, max: f32) -> Self {
        self.sampling_range = Some(FloatInterval::new(min, max));
        self
    }

    pub fn with_cost_bias(mut self, bias: f32) -> Self {
        self.cost_bias = bias;
        self
    }

    pub fn primary(&self) -> Option<&RoledClip> {
        self.roles.first()
    }

    pub fn clip_for_role(&self, role: &str) -> Option<&RoledClip> {
        self.roles.iter().find(|r| r.role == role)
    }

    pub fn is_blend_space(&self) -> bool {
        self.primary()
            .map(|r| r.clip.read().is_blend_space())
            .unwrap_or(false)
    }

    pub fn play_length(&self, params: &BlendParameters) -> f32 {
        self.primary()
            .map(|r| r.clip.read().play_length_at(params))
            .unwrap_or(0.0)
    }

    pub fn sampling_parameters(&self) -> Vec<BlendParameters> {
        self.primary()
            .map(|r| r.clip.read().sampling_parameters())
            .unwrap_or_default()
    }

    /// Range to sample, in clip time: seconds for sequences, normalized
    /// `[0, 1]` time for blend spaces.
    pub fn effective_sampling_range(&self, params: &BlendParameters) -> FloatInterval {
        if self.is_blend_space() {
            return FloatInterval::new(0.0, 1.0);
        }
        let play_length = self.play_length(params);
        match self.sampling_range {
            Some(range) if range.is_valid() && range.max > 0.0 => FloatInterval::new(
                range.min.clamp(0.0, play_length),
                range.max.clamp(0.0, play_length),
            ),
            _ => FloatInterval::new(0.0, play_length),
        }
    }

    fn hash_content(&self, hasher: &mut ContentHasher) {
        hasher.write_usize(self.roles.len());
        for roled in &self.roles {
            hasher.write_str(&roled.role);
            for bits in roled.root_origin.bits() {
                hasher.write_u32(bits);
            }
        }
        hasher.write_bool(self.enabled);
        hasher.write_u32(match self.mirror_option {
            MirrorOption::UnmirroredOnly => 0,
            MirrorOption::MirroredOnly => 1,
            MirrorOption::UnmirroredAndMirrored => 2,
        });
        hasher.write_bool(self.looping);
        hasher.write_bool(self.disable_reselection);
        hasher.write_bool(self.sampling_range.is_some());
        if let Some(range) = self.sampling_range {
            hasher.write_f32(range.min);
            hasher.write_f32(range.max);
        }
        hasher.write_f32(self.cost_bias);
    }
}

/// Per-database build knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseSettings {
    pub search_mode: SearchMode,
    /// Raw pose vectors closer than this are merged. Zero disables pruning.
    pub pose_pruning_similarity_threshold: f32,
    /// PCA vectors closer than this are merged. Zero disables pruning.
    pub pca_values_pruning_similarity_threshold: f32,
    /// Requested PCA components, capped by the schema cardinality.
    pub number_of_principal_components: usize,
    pub kd_tree: KdTreeConfig,
    /// VP-tree pivot seed. `None` derives it from the cache key.
    pub vp_tree_seed: Option<u64>,
    /// Trims non-looping clips: `[min, play_length + max]` is kept.
    pub exclude_from_database: FloatInterval,
    /// Extra time the sampler may extrapolate before the first and after the
    /// last sample of every indexed range.
    pub additional_extrapolation_time: FloatInterval,
    pub base_cost_bias: f32,
    pub looping_cost_bias: f32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            search_mode: SearchMode::default(),
            pose_pruning_similarity_threshold: 0.0,
            pca_values_pruning_similarity_threshold: 0.0,
            number_of_principal_components: 4,
            kd_tree: KdTreeConfig::default(),
            vp_tree_seed: None,
            exclude_from_database: FloatInterval::new(0.0, 0.0),
            additional_extrapolation_time: FloatInterval::new(0.0, 0.0),
            base_cost_bias: 0.0,
            looping_cost_bias: 0.0,
        }
    }
}

impl DatabaseSettings {
    pub fn with_search_mode(mut self, mode: SearchMode) -> Self {
        self.search_mode = mode;
        self
    }

    pub fn with_pruning(mut self, pose_threshold: f32, pca_threshold: f32) -> Self {
        self.pose_pruning_similarity_threshold = pose_threshold;
        self.pca_values_pruning_similarity_threshold = pca_threshold;
        self
    }

    pub fn with_principal_components(mut self, count: usize) -> Self {
        self.number_of_principal_components = count;
        self
    }

    pub fn with_kd_tree(mut self, config: KdTreeConfig) -> Self {
        self.kd_tree = config;
        self
    }

    pub fn with_vp_tree_seed(mut self, seed: u64) -> Self {
        self.vp_tree_seed = Some(seed);
        self
    }

    pub fn with_exclude_from_database(mut self, min: f32, max: f32) -> Self {
        self.exclude_from_database = FloatInterval::new(min, max);
        self
    }

    pub fn with_cost_biases(mut self, base: f32, looping: f32) -> Self {
        self.base_cost_bias = base;
        self.looping_cost_bias = looping;
        self
    }

    fn hash_content(&self, hasher: &mut ContentHasher) {
        hasher.write_u32(match self.search_mode {
            SearchMode::Raw => 0,
            SearchMode::PcaKdTree => 1,
            SearchMode::VpTree => 2,
        });
        hasher.write_f32(self.pose_pruning_similarity_threshold);
        hasher.write_f32(self.pca_values_pruning_similarity_threshold);
        hasher.write_usize(self.number_of_principal_components);
        hasher.write_usize(self.kd_tree.max_leaf_size);
        hasher.write_usize(self.kd_tree.query_num_neighbors);
        hasher.write_bool(self.vp_tree_seed.is_some());
        hasher.write_u64(self.vp_tree_seed.unwrap_or(0));
        hasher.write_f32(self.exclude_from_database.min);
        hasher.write_f32(self.exclude_from_database.max);
        hasher.write_f32(self.additional_extrapolation_time.min);
        hasher.write_f32(self.additional_extrapolation_time.max);
        hasher.write_f32(self.base_cost_bias);
        hasher.write_f32(self.looping_cost_bias);
    }
}

/// Databases whose feature statistics are merged for cross-database
/// comparability.
#[derive(Default)]
pub struct NormalizationSet {
    pub databases: Vec<Weak<Database>>,
}

pub type NormalizationSetRef = Arc<Asset<NormalizationSet>>;

impl NormalizationSet {
    pub fn new(databases: &[&Arc<Database>]) -> Self {
        Self {
            databases: databases.iter().map(|db| Arc::downgrade(db)).collect(),
        }
    }

    pub fn live_databases(&self) -> Vec<Arc<Database>> {
        self.databases.iter().filter_map(Weak::upgrade).collect()
    }
}

impl AssetData for NormalizationSet {
    const KIND: &'static str = "normalization_set";

    fn hash_content(&self, hasher: &mut ContentHasher) {
        hasher.write_usize(self.live_databases().len());
    }

    fn dependencies(&self) -> Vec<Arc<dyn Dependency>> {
        self.live_databases()
            .into_iter()
            .map(|db| db as Arc<dyn Dependency>)
            .collect()
    }
}

/// Mutable database content.
#[derive(Clone, Default)]
pub struct DatabaseData {
    pub schema: Option<SchemaRef>,
    pub normalization_set: Option<NormalizationSetRef>,
    pub assets: Vec<DatabaseAnimationAsset>,
    pub settings: DatabaseSettings,
}

/// A database plus the search index currently installed for it.
pub struct Database {
    id: ObjectId,
    name: String,
    loaded: AtomicBool,
    data: RwLock<DatabaseData>,
    search_index: RwLock<Option<Arc<SearchIndex>>>,
}

impl Database {
    pub fn new(name: impl Into<String>, data: DatabaseData) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::next(),
            name: name.into(),
            loaded: AtomicBool::new(true),
            data: RwLock::new(data),
            search_index: RwLock::new(None),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Release);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DatabaseData> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, DatabaseData> {
        self.data.write()
    }

    /// The last successfully built index, if any.
    pub fn search_index(&self) -> Option<Arc<SearchIndex>> {
        self.search_index.read().clone()
    }

    pub(crate) fn set_search_index(&self, index: Arc<SearchIndex>) {
        *self.search_index.write() = Some(index);
    }

    /// Requested component count capped by the schema cardinality.
    pub fn number_of_principal_components(&self) -> usize {
        let data = self.data.read();
        let cardinality = data
            .schema
            .as_ref()
            .map(|s| s.read().cardinality())
            .unwrap_or(0);
        data.settings.number_of_principal_components.min(cardinality)
    }

    /// This database followed by the unique databases of its normalization
    /// set, in declaration order.
    pub fn index_base_databases(self: &Arc<Self>) -> Vec<Arc<Database>> {
        let mut out = vec![self.clone()];
        let set = self.data.read().normalization_set.clone();
        if let Some(set) = set {
            for db in set.read().live_databases() {
                if !out.iter().any(|d| Arc::ptr_eq(d, &db)) {
                    out.push(db);
                }
            }
        }
        out
    }

    /// Every database reachable through normalization sets, transitively,
    /// including this one.
    pub fn reachable_databases(self: &Arc<Self>) -> Vec<Arc<Database>> {
        let mut out: Vec<Arc<Database>> = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(db) = stack.pop() {
            if out.iter().any(|d| Arc::ptr_eq(d, &db)) {
                continue;
            }
            stack.extend(db.index_base_databases().into_iter().skip(1));
            out.push(db);
        }
        out
    }

    /// Adds entries for clips that branch into this database and removes
    /// synchronized entries whose clip no longer does. Returns true when the
    /// asset list changed.
    pub fn synchronize_with_external_dependencies(self: &Arc<Self>, clips: &[ClipRef]) -> bool {
        let mut data = self.data.write();
        let mut changed = false;
        for clip in clips {
            let branches_in = clip
                .read()
                .branch_in
                .iter()
                .filter_map(Weak::upgrade)
                .any(|db| Arc::ptr_eq(&db, self));
            let existing = data
                .assets
                .iter()
                .position(|a| a.synchronized_with == Some(clip.id()));
            match (branches_in, existing) {
                (true, None) => {
                    let mut entry = DatabaseAnimationAsset::new(clip.clone());
                    entry.synchronized_with = Some(clip.id());
                    data.assets.push(entry);
                    changed = true;
                }
                (false, Some(index)) => {
                    data.assets.remove(index);
                    changed = true;
                }
                _ => {}
            }
        }
        changed
    }
}

impl Dependency for Database {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn hash_content(&self, hasher: &mut ContentHasher) {
        let data = self.data.read();
        hasher.write_str("database");
        hasher.write_str(&self.name);
        hasher.write_bool(data.schema.is_some());
        hasher.write_bool(data.normalization_set.is_some());
        data.settings.hash_content(hasher);
        hasher.write_usize(data.assets.len());
        for asset in &data.assets {
            asset.hash_content(hasher);
        }
    }

    fn dependencies(&self) -> Vec<Arc<dyn Dependency>> {
        let data = self.data.read();
        let mut deps: Vec<Arc<dyn Dependency>> = Vec::new();
        if let Some(schema) = &data.schema {
            deps.push(as_dependency(schema));
        }
        if let Some(set) = &data.normalization_set {
            deps.push(as_dependency(set));
        }
        for asset in &data.assets {
            for roled in &asset.roles {
                deps.push(as_dependency(&roled.clip));
            }
        }
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{AnimationClip, BlendAxis, BlendSpace};
    use crate::schema::{Bone, ChannelKind, FeatureChannel, Schema, Skeleton};

    fn schema(cardinality: usize) -> SchemaRef {
        let skeleton = Asset::new("skel", Skeleton::new(vec![Bone::root("root")]));
        Asset::new(
            "schema",
            Schema::new(
                30,
                skeleton,
                vec![FeatureChannel::new("pos", ChannelKind::Position, cardinality).into()],
            ),
        )
    }

    #[test]
    fn test_mirror_option_flags() {
        assert!(MirrorOption::UnmirroredOnly.includes_unmirrored());
        assert!(!MirrorOption::UnmirroredOnly.includes_mirrored());
        assert!(MirrorOption::UnmirroredAndMirrored.includes_mirrored());
        assert!(!MirrorOption::MirroredOnly.includes_unmirrored());
    }

    #[test]
    fn test_effective_sampling_range() {
        let clip = Asset::new("walk", AnimationClip::new(2.0));
        let entry = DatabaseAnimationAsset::new(clip.clone());
        assert_eq!(entry.effective_sampling_range(&[0.0; 3]), FloatInterval::new(0.0, 2.0));

        let clamped = DatabaseAnimationAsset::new(clip).with_sampling_range(0.5, 10.0);
        assert_eq!(
            clamped.effective_sampling_range(&[0.0; 3]),
            FloatInterval::new(0.5, 2.0)
        );

        let bs = Asset::new(
            "locomotion",
            AnimationClip::new(1.5).with_blend_space(BlendSpace::new(BlendAxis::new(0.0, 1.0, 2))),
        );
        let entry = DatabaseAnimationAsset::new(bs);
        assert_eq!(entry.effective_sampling_range(&[0.0; 3]), FloatInterval::new(0.0, 1.0));
        assert_eq!(entry.sampling_parameters().len(), 2);
    }

    #[test]
    fn test_principal_components_capped_by_cardinality() {
        let db = Database::new(
            "db",
            DatabaseData {
                schema: Some(schema(3)),
                settings: DatabaseSettings::default().with_principal_components(8),
                ..Default::default()
            },
        );
        assert_eq!(db.number_of_principal_components(), 3);
    }

    #[test]
    fn test_index_base_databases_are_unique_and_primary_first() {
        let a = Database::new("a", DatabaseData::default());
        let b = Database::new("b", DatabaseData::default());
        let set = Asset::new("set", NormalizationSet::new(&[&b, &a, &b]));
        a.write().normalization_set = Some(set.clone());
        b.write().normalization_set = Some(set);

        let bases = a.index_base_databases();
        assert_eq!(bases.len(), 2);
        assert!(Arc::ptr_eq(&bases[0], &a));
        assert!(Arc::ptr_eq(&bases[1], &b));

        let reachable = b.reachable_databases();
        assert_eq!(reachable.len(), 2);
    }

    #[test]
    fn test_synchronize_with_external_dependencies() {
        let db = Database::new("db", DatabaseData::default());
        let clip = Asset::new("branch", AnimationClip::new(1.0).with_branch_in(&db));

        assert!(db.synchronize_with_external_dependencies(&[clip.clone()]));
        assert_eq!(db.read().assets.len(), 1);
        assert!(!db.synchronize_with_external_dependencies(&[clip.clone()]));

        clip.write().branch_in.clear();
        assert!(db.synchronize_with_external_dependencies(&[clip]));
        assert!(db.read().assets.is_empty());
    }
}
