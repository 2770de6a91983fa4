//! Schemas: the layout of a pose feature vector.
//!
//! A schema is an ordered list of channels. Leaf channels ([`FeatureChannel`])
//! own a contiguous slice of the vector; group channels ([`GroupChannel`])
//! own the concatenation of their children. Offsets and the total
//! cardinality are assigned once when the channel list is set.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::asset::{as_dependency, Asset, AssetData, ContentHasher, Dependency};
use crate::error::{Error, Result};

/// Name of the character a channel or clip belongs to in multi-character
/// (multi-role) setups.
pub type Role = String;

/// Role used by single-character schemas.
pub const DEFAULT_ROLE: &str = "Default";

/// A bone of a [`Skeleton`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    /// Index of the parent bone. Parents always precede their children.
    pub parent: Option<usize>,
}

impl Bone {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    pub fn child(name: impl Into<String>, parent: usize) -> Self {
        Self {
            name: name.into(),
            parent: Some(parent),
        }
    }
}

/// Reference skeleton.
#[derive(Debug, Clone, Default)]
pub struct Skeleton {
    pub bones: Vec<Bone>,
}

pub type SkeletonRef = Arc<Asset<Skeleton>>;

impl Skeleton {
    pub fn new(bones: Vec<Bone>) -> Self {
        Self { bones }
    }

    pub fn num_bones(&self) -> usize {
        self.bones.len()
    }

    pub fn bone_index(&self, name: &str) -> Option<usize> {
        self.bones.iter().position(|b| b.name == name)
    }

    pub fn parent(&self, bone: usize) -> Option<usize> {
        self.bones.get(bone).and_then(|b| b.parent)
    }
}

impl AssetData for Skeleton {
    const KIND: &'static str = "skeleton";

    fn hash_content(&self, hasher: &mut ContentHasher) {
        hasher.write_usize(self.bones.len());
        for bone in &self.bones {
            hasher.write_str(&bone.name);
            hasher.write_u64(bone.parent.map_or(u64::MAX, |p| p as u64));
        }
    }
}

/// Left/right bone pairs used to sample mirrored poses.
#[derive(Debug, Clone, Default)]
pub struct MirrorTable {
    /// Skeleton the pairs refer to. A table without one is a configuration error.
    pub skeleton: Option<SkeletonRef>,
    pub pairs: Vec<(String, String)>,
}

pub type MirrorTableRef = Arc<Asset<MirrorTable>>;

impl MirrorTable {
    pub fn new(skeleton: SkeletonRef, pairs: Vec<(String, String)>) -> Self {
        Self {
            skeleton: Some(skeleton),
            pairs,
        }
    }

    /// Mirror bone of every skeleton bone; unpaired bones mirror onto themselves.
    pub fn bone_to_mirror(&self) -> Option<Vec<usize>> {
        let skeleton = self.skeleton.as_ref()?;
        let skeleton = skeleton.read();
        let mut map: Vec<usize> = (0..skeleton.num_bones()).collect();
        for (a, b) in &self.pairs {
            if let (Some(ia), Some(ib)) = (skeleton.bone_index(a), skeleton.bone_index(b)) {
                map[ia] = ib;
                map[ib] = ia;
            }
        }
        Some(map)
    }
}

impl AssetData for MirrorTable {
    const KIND: &'static str = "mirror_table";

    fn hash_content(&self, hasher: &mut ContentHasher) {
        hasher.write_bool(self.skeleton.is_some());
        hasher.write_usize(self.pairs.len());
        for (a, b) in &self.pairs {
            hasher.write_str(a);
            hasher.write_str(b);
        }
    }

    fn dependencies(&self) -> Vec<Arc<dyn Dependency>> {
        self.skeleton.iter().map(as_dependency).collect()
    }
}

/// What a leaf channel measures. Two channels are only normalized together
/// when they measure the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Position,
    Velocity,
    Heading,
    Trajectory,
    Phase,
    Curve,
    Custom(String),
}

impl ChannelKind {
    fn tag(&self) -> &str {
        match self {
            ChannelKind::Position => "position",
            ChannelKind::Velocity => "velocity",
            ChannelKind::Heading => "heading",
            ChannelKind::Trajectory => "trajectory",
            ChannelKind::Phase => "phase",
            ChannelKind::Curve => "curve",
            ChannelKind::Custom(name) => name,
        }
    }
}

/// A leaf slice of the feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub role: Role,
    /// Bone sampled by this channel, if any.
    pub bone: Option<String>,
    pub cardinality: usize,
    pub weight: f32,
    data_offset: usize,
}

impl FeatureChannel {
    pub fn new(name: impl Into<String>, kind: ChannelKind, cardinality: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            role: DEFAULT_ROLE.to_string(),
            bone: None,
            cardinality,
            weight: 1.0,
            data_offset: 0,
        }
    }

    pub fn with_bone(mut self, bone: impl Into<String>) -> Self {
        self.bone = Some(bone.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<Role>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }
}

/// A composite channel; its slice is the concatenation of its children.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupChannel {
    pub name: String,
    pub weight: f32,
    pub children: Vec<Channel>,
    data_offset: usize,
    cardinality: usize,
}

impl GroupChannel {
    pub fn new(name: impl Into<String>, children: Vec<Channel>) -> Self {
        Self {
            name: name.into(),
            weight: 1.0,
            children,
            data_offset: 0,
            cardinality: 0,
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }
}

/// Leaf or composite channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Channel {
    Feature(FeatureChannel),
    Group(GroupChannel),
}

impl From<FeatureChannel> for Channel {
    fn from(channel: FeatureChannel) -> Self {
        Channel::Feature(channel)
    }
}

impl From<GroupChannel> for Channel {
    fn from(channel: GroupChannel) -> Self {
        Channel::Group(channel)
    }
}

impl Channel {
    pub fn name(&self) -> &str {
        match self {
            Channel::Feature(c) => &c.name,
            Channel::Group(g) => &g.name,
        }
    }

    pub fn cardinality(&self) -> usize {
        match self {
            Channel::Feature(c) => c.cardinality,
            Channel::Group(g) => g.cardinality,
        }
    }

    pub fn data_offset(&self) -> usize {
        match self {
            Channel::Feature(c) => c.data_offset,
            Channel::Group(g) => g.data_offset,
        }
    }

    pub fn sub_channels(&self) -> &[Channel] {
        match self {
            Channel::Feature(_) => &[],
            Channel::Group(g) => &g.children,
        }
    }

    /// Writes this channel's weights into `weights[offset..offset + cardinality]`.
    pub fn fill_weights(&self, weights: &mut [f32]) {
        self.fill_weights_scaled(weights, 1.0);
    }

    fn fill_weights_scaled(&self, weights: &mut [f32], scale: f32) {
        match self {
            Channel::Feature(c) => {
                let end = c.data_offset + c.cardinality;
                for w in &mut weights[c.data_offset..end] {
                    *w = c.weight * scale;
                }
            }
            Channel::Group(g) => {
                for child in &g.children {
                    child.fill_weights_scaled(weights, scale * g.weight);
                }
            }
        }
    }

    /// Leaf channels with the same meaning, cardinality and bone share one
    /// deviation. Groups are never compared directly.
    pub fn can_be_normalized_with(&self, other: &Channel) -> bool {
        match (self, other) {
            (Channel::Feature(a), Channel::Feature(b)) => {
                a.kind == b.kind && a.cardinality == b.cardinality && a.bone == b.bone
            }
            _ => false,
        }
    }

    /// Visits every leaf channel in layout order.
    pub fn for_each_feature<'a>(&'a self, f: &mut dyn FnMut(&'a FeatureChannel)) {
        match self {
            Channel::Feature(c) => f(c),
            Channel::Group(g) => {
                for child in &g.children {
                    child.for_each_feature(f);
                }
            }
        }
    }

    fn assign_offsets(&mut self, offset: usize) -> usize {
        match self {
            Channel::Feature(c) => {
                c.data_offset = offset;
                c.cardinality
            }
            Channel::Group(g) => {
                g.data_offset = offset;
                let mut cursor = offset;
                for child in &mut g.children {
                    cursor += child.assign_offsets(cursor);
                }
                g.cardinality = cursor - offset;
                g.cardinality
            }
        }
    }

    fn hash_content(&self, hasher: &mut ContentHasher) {
        match self {
            Channel::Feature(c) => {
                hasher.write_str("feature");
                hasher.write_str(&c.name);
                hasher.write_str(c.kind.tag());
                hasher.write_str(&c.role);
                hasher.write_str(c.bone.as_deref().unwrap_or(""));
                hasher.write_usize(c.cardinality);
                hasher.write_f32(c.weight);
            }
            Channel::Group(g) => {
                hasher.write_str("group");
                hasher.write_str(&g.name);
                hasher.write_f32(g.weight);
                hasher.write_usize(g.children.len());
                for child in &g.children {
                    child.hash_content(hasher);
                }
            }
        }
    }
}

/// How feature weights and deviations are combined into `WeightsSqrt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataPreprocessor {
    /// Raw user weights.
    None,
    /// Weights renormalized to sum to one, then divided by deviation.
    #[default]
    Normalize,
    /// User weights divided by deviation.
    NormalizeOnlyByDeviation,
    /// Like `Normalize`, and every database of the normalization set is
    /// indexed with the primary database's schema.
    NormalizeWithCommonSchema,
}

impl DataPreprocessor {
    pub fn normalizes_weights(&self) -> bool {
        matches!(
            self,
            DataPreprocessor::Normalize | DataPreprocessor::NormalizeWithCommonSchema
        )
    }

    pub fn uses_deviation(&self) -> bool {
        !matches!(self, DataPreprocessor::None)
    }

    fn tag(&self) -> u32 {
        match self {
            DataPreprocessor::None => 0,
            DataPreprocessor::Normalize => 1,
            DataPreprocessor::NormalizeOnlyByDeviation => 2,
            DataPreprocessor::NormalizeWithCommonSchema => 3,
        }
    }
}

/// Skeleton (and optional mirror table) used to sample one role.
#[derive(Clone)]
pub struct RoledSkeleton {
    pub role: Role,
    pub skeleton: SkeletonRef,
    pub mirror_table: Option<MirrorTableRef>,
}

/// Pose feature layout plus sampling parameters.
#[derive(Clone)]
pub struct Schema {
    /// Poses sampled per second.
    pub sample_rate: u32,
    pub number_of_permutations: u32,
    pub permutations_sample_rate: u32,
    pub permutations_time_offset: f32,
    pub data_preprocessor: DataPreprocessor,
    roled_skeletons: Vec<RoledSkeleton>,
    channels: Vec<Channel>,
    cardinality: usize,
}

pub type SchemaRef = Arc<Asset<Schema>>;

impl Schema {
    /// Single-role schema for `skeleton`.
    pub fn new(sample_rate: u32, skeleton: SkeletonRef, channels: Vec<Channel>) -> Self {
        let mut schema = Self {
            sample_rate,
            number_of_permutations: 1,
            permutations_sample_rate: sample_rate,
            permutations_time_offset: 0.0,
            data_preprocessor: DataPreprocessor::default(),
            roled_skeletons: vec![RoledSkeleton {
                role: DEFAULT_ROLE.to_string(),
                skeleton,
                mirror_table: None,
            }],
            channels: Vec::new(),
            cardinality: 0,
        };
        schema.set_channels(channels);
        schema
    }

    pub fn with_data_preprocessor(mut self, preprocessor: DataPreprocessor) -> Self {
        self.data_preprocessor = preprocessor;
        self
    }

    pub fn with_permutations(mut self, count: u32, sample_rate: u32, time_offset: f32) -> Self {
        self.number_of_permutations = count;
        self.permutations_sample_rate = sample_rate;
        self.permutations_time_offset = time_offset;
        self
    }

    /// Sets the mirror table of an existing role.
    pub fn with_mirror_table(mut self, role: &str, table: MirrorTableRef) -> Self {
        if let Some(roled) = self.roled_skeletons.iter_mut().find(|r| r.role == role) {
            roled.mirror_table = Some(table);
        }
        self
    }

    /// Adds (or replaces) the skeleton for `role`.
    pub fn with_roled_skeleton(
        mut self,
        role: impl Into<Role>,
        skeleton: SkeletonRef,
        mirror_table: Option<MirrorTableRef>,
    ) -> Self {
        let role = role.into();
        self.roled_skeletons.retain(|r| r.role != role);
        self.roled_skeletons.push(RoledSkeleton {
            role,
            skeleton,
            mirror_table,
        });
        self
    }

    /// Replaces the channel list and reassigns data offsets.
    pub fn set_channels(&mut self, mut channels: Vec<Channel>) {
        let mut cursor = 0;
        for channel in &mut channels {
            cursor += channel.assign_offsets(cursor);
        }
        self.channels = channels;
        self.cardinality = cursor;
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Sum of the top-level channel cardinalities.
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    pub fn roled_skeletons(&self) -> &[RoledSkeleton] {
        &self.roled_skeletons
    }

    pub fn roled_skeleton(&self, role: &str) -> Option<&RoledSkeleton> {
        self.roled_skeletons.iter().find(|r| r.role == role)
    }

    /// First declared role.
    pub fn default_role(&self) -> &str {
        self.roled_skeletons
            .first()
            .map(|r| r.role.as_str())
            .unwrap_or(DEFAULT_ROLE)
    }

    pub fn mirror_table(&self, role: &str) -> Option<&MirrorTableRef> {
        self.roled_skeleton(role).and_then(|r| r.mirror_table.as_ref())
    }

    /// Bones sampled by channels of `role`, in first-use order.
    pub fn bone_references(&self, role: &str) -> Vec<String> {
        let mut bones: Vec<String> = Vec::new();
        for channel in &self.channels {
            channel.for_each_feature(&mut |feature| {
                if feature.role == role {
                    if let Some(bone) = &feature.bone {
                        if !bones.contains(bone) {
                            bones.push(bone.clone());
                        }
                    }
                }
            });
        }
        bones
    }

    /// Fills a `cardinality()`-long vector with the user channel weights.
    pub fn fill_weights(&self, weights: &mut [f32]) {
        for channel in &self.channels {
            channel.fill_weights(weights);
        }
    }

    /// Time offset of permutation `index`, in seconds.
    pub fn permutation_time(&self, index: u32) -> f32 {
        if self.permutations_sample_rate == 0 {
            return self.permutations_time_offset;
        }
        self.permutations_time_offset + index as f32 / self.permutations_sample_rate as f32
    }

    /// Fails with `SchemaInvalid` when nothing can be indexed with this schema.
    pub fn validate(&self) -> Result<()> {
        if self.cardinality == 0 {
            return Err(Error::SchemaInvalid("schema cardinality is zero".into()));
        }
        if self.sample_rate == 0 {
            return Err(Error::SchemaInvalid("schema sample rate is zero".into()));
        }
        if self.roled_skeletons.is_empty() {
            return Err(Error::SchemaInvalid("schema has no skeletons".into()));
        }
        Ok(())
    }
}

impl AssetData for Schema {
    const KIND: &'static str = "schema";

    fn hash_content(&self, hasher: &mut ContentHasher) {
        hasher.write_u32(self.sample_rate);
        hasher.write_u32(self.number_of_permutations);
        hasher.write_u32(self.permutations_sample_rate);
        hasher.write_f32(self.permutations_time_offset);
        hasher.write_u32(self.data_preprocessor.tag());
        hasher.write_usize(self.roled_skeletons.len());
        for roled in &self.roled_skeletons {
            hasher.write_str(&roled.role);
            hasher.write_bool(roled.mirror_table.is_some());
        }
        hasher.write_usize(self.channels.len());
        for channel in &self.channels {
            channel.hash_content(hasher);
        }
    }

    fn dependencies(&self) -> Vec<Arc<dyn Dependency>> {
        let mut deps: Vec<Arc<dyn Dependency>> = Vec::new();
        for roled in &self.roled_skeletons {
            deps.push(as_dependency(&roled.skeleton));
            if let Some(table) = &roled.mirror_table {
                deps.push(as_dependency(table));
            }
        }
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skeleton() -> SkeletonRef {
        Asset::new(
            "skel",
            Skeleton::new(vec![
                Bone::root("root"),
                Bone::child("pelvis", 0),
                Bone::child("foot_l", 1),
                Bone::child("foot_r", 1),
            ]),
        )
    }

    fn layout() -> Vec<Channel> {
        vec![
            FeatureChannel::new("root_vel", ChannelKind::Velocity, 3).into(),
            GroupChannel::new(
                "feet",
                vec![
                    FeatureChannel::new("foot_l", ChannelKind::Position, 3)
                        .with_bone("foot_l")
                        .with_weight(2.0)
                        .into(),
                    FeatureChannel::new("foot_r", ChannelKind::Position, 3)
                        .with_bone("foot_r")
                        .into(),
                ],
            )
            .with_weight(0.5)
            .into(),
        ]
    }

    #[test]
    fn test_offsets_and_cardinality() {
        let schema = Schema::new(30, skeleton(), layout());
        assert_eq!(schema.cardinality(), 9);
        let group = &schema.channels()[1];
        assert_eq!(group.data_offset(), 3);
        assert_eq!(group.cardinality(), 6);
        assert_eq!(group.sub_channels()[1].data_offset(), 6);
    }

    #[test]
    fn test_fill_weights_multiplies_group_weight() {
        let schema = Schema::new(30, skeleton(), layout());
        let mut weights = vec![0.0; schema.cardinality()];
        schema.fill_weights(&mut weights);
        assert_eq!(
            weights,
            vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.5, 0.5, 0.5]
        );
    }

    #[test]
    fn test_can_be_normalized_with() {
        let a: Channel = FeatureChannel::new("a", ChannelKind::Position, 3)
            .with_bone("foot_l")
            .into();
        let b: Channel = FeatureChannel::new("b", ChannelKind::Position, 3)
            .with_bone("foot_l")
            .with_weight(4.0)
            .into();
        let c: Channel = FeatureChannel::new("c", ChannelKind::Velocity, 3)
            .with_bone("foot_l")
            .into();
        assert!(a.can_be_normalized_with(&b));
        assert!(!a.can_be_normalized_with(&c));
        let group: Channel = GroupChannel::new("g", vec![a.clone()]).into();
        assert!(!group.can_be_normalized_with(&a));
    }

    #[test]
    fn test_bone_references_per_role() {
        let schema = Schema::new(30, skeleton(), layout());
        assert_eq!(schema.bone_references(DEFAULT_ROLE), vec!["foot_l", "foot_r"]);
        assert!(schema.bone_references("Partner").is_empty());
    }

    #[test]
    fn test_validate_rejects_empty_schema() {
        let schema = Schema::new(30, skeleton(), Vec::new());
        assert!(matches!(schema.validate(), Err(Error::SchemaInvalid(_))));
        assert!(Schema::new(30, skeleton(), layout()).validate().is_ok());
    }

    #[test]
    fn test_mirror_table_map() {
        let skel = skeleton();
        let table = MirrorTable::new(skel, vec![("foot_l".into(), "foot_r".into())]);
        assert_eq!(table.bone_to_mirror(), Some(vec![0, 1, 3, 2]));
        assert_eq!(MirrorTable::default().bone_to_mirror(), None);
    }

    #[test]
    fn test_permutation_time() {
        let schema = Schema::new(30, skeleton(), layout()).with_permutations(3, 10, 0.5);
        assert!((schema.permutation_time(2) - 0.7).abs() < 1e-6);
    }
}
