//! Per-role bone sets and mirror lookups handed to pose samplers.

use std::collections::BTreeMap;

use crate::database::DatabaseData;
use crate::schema::{Role, Schema, Skeleton};

/// Sorted skeleton bone indices a sampler has to evaluate for one role,
/// closed under parents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoneContainer {
    bone_indices: Vec<usize>,
}

impl BoneContainer {
    /// Collects `required` bones (plus their mirror bones when a mirror map
    /// is given), sorts them and adds missing ancestors.
    pub fn new(skeleton: &Skeleton, required: &[String], bone_to_mirror: Option<&[usize]>) -> Self {
        let mut indices: Vec<usize> = Vec::with_capacity(required.len() * 2);
        for name in required {
            let Some(index) = skeleton.bone_index(name) else {
                tracing::warn!(bone = %name, "bone not found in skeleton");
                continue;
            };
            indices.push(index);
            if let Some(mirror) = bone_to_mirror.and_then(|map| map.get(index)) {
                indices.push(*mirror);
            }
        }

        let mut closed = indices.clone();
        for &index in &indices {
            let mut parent = skeleton.parent(index);
            while let Some(p) = parent {
                closed.push(p);
                parent = skeleton.parent(p);
            }
        }
        closed.sort_unstable();
        closed.dedup();
        Self {
            bone_indices: closed,
        }
    }

    pub fn bone_indices(&self) -> &[usize] {
        &self.bone_indices
    }

    pub fn len(&self) -> usize {
        self.bone_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bone_indices.is_empty()
    }

    pub fn contains(&self, skeleton_index: usize) -> bool {
        self.bone_indices.binary_search(&skeleton_index).is_ok()
    }

    /// Position of a skeleton bone inside this container.
    pub fn compact_index(&self, skeleton_index: usize) -> Option<usize> {
        self.bone_indices.binary_search(&skeleton_index).ok()
    }
}

/// Mirror bone of every bone in a [`BoneContainer`], in compact indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorDataCache {
    compact_to_mirror: Vec<usize>,
}

impl MirrorDataCache {
    /// `bone_to_mirror` maps skeleton bones, see [`crate::schema::MirrorTable::bone_to_mirror`].
    pub fn new(bone_to_mirror: Option<&[usize]>, bones: &BoneContainer) -> Self {
        let Some(map) = bone_to_mirror else {
            return Self::default();
        };
        let compact_to_mirror = bones
            .bone_indices()
            .iter()
            .enumerate()
            .map(|(compact, &bone)| {
                map.get(bone)
                    .and_then(|&mirror| bones.compact_index(mirror))
                    .unwrap_or(compact)
            })
            .collect();
        Self { compact_to_mirror }
    }

    /// False when the role has no usable mirror table.
    pub fn is_valid(&self) -> bool {
        !self.compact_to_mirror.is_empty()
    }

    pub fn mirror_bone(&self, compact_index: usize) -> usize {
        self.compact_to_mirror
            .get(compact_index)
            .copied()
            .unwrap_or(compact_index)
    }
}

/// Bone container and mirror cache per schema role.
#[derive(Debug, Clone, Default)]
pub struct RoledBones {
    pub containers: BTreeMap<Role, BoneContainer>,
    pub mirror_caches: BTreeMap<Role, MirrorDataCache>,
}

impl RoledBones {
    /// Bones referenced by the schema channels and by sampling-attribute
    /// annotations on the enabled clips of `data`, per schema role.
    pub fn build(schema: &Schema, data: &DatabaseData) -> Self {
        let mut roled = Self::default();
        for roled_skeleton in schema.roled_skeletons() {
            let role = &roled_skeleton.role;
            let mut required = schema.bone_references(role);
            for asset in data.assets.iter().filter(|a| a.enabled) {
                if let Some(roled_clip) = asset.clip_for_role(role) {
                    for bone in &roled_clip.clip.read().sampling_attribute_bones {
                        if !required.contains(bone) {
                            required.push(bone.clone());
                        }
                    }
                }
            }

            let mirror_map = roled_skeleton
                .mirror_table
                .as_ref()
                .and_then(|t| t.read().bone_to_mirror());
            let container = BoneContainer::new(
                &roled_skeleton.skeleton.read(),
                &required,
                mirror_map.as_deref(),
            );
            let cache = MirrorDataCache::new(mirror_map.as_deref(), &container);

            roled.containers.insert(role.clone(), container);
            roled.mirror_caches.insert(role.clone(), cache);
        }
        roled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::schema::{Bone, MirrorTable};

    fn skeleton() -> Skeleton {
        Skeleton::new(vec![
            Bone::root("root"),
            Bone::child("pelvis", 0),
            Bone::child("thigh_l", 1),
            Bone::child("foot_l", 2),
            Bone::child("thigh_r", 1),
            Bone::child("foot_r", 4),
        ])
    }

    #[test]
    fn test_container_adds_parents_sorted() {
        let container = BoneContainer::new(&skeleton(), &["foot_l".to_string()], None);
        assert_eq!(container.bone_indices(), &[0, 1, 2, 3]);
        assert_eq!(container.compact_index(3), Some(3));
        assert!(!container.contains(5));
    }

    #[test]
    fn test_container_adds_mirror_bones() {
        let skeleton = Asset::new("skel", skeleton());
        let table = MirrorTable::new(
            skeleton.clone(),
            vec![
                ("thigh_l".into(), "thigh_r".into()),
                ("foot_l".into(), "foot_r".into()),
            ],
        );
        let map = table.bone_to_mirror().unwrap();
        let container = BoneContainer::new(&skeleton.read(), &["foot_l".to_string()], Some(map.as_slice()));
        assert_eq!(container.bone_indices(), &[0, 1, 2, 3, 4, 5]);

        let cache = MirrorDataCache::new(Some(map.as_slice()), &container);
        assert!(cache.is_valid());
        assert_eq!(cache.mirror_bone(3), 5);
        assert_eq!(cache.mirror_bone(0), 0);
    }

    #[test]
    fn test_unknown_bones_are_skipped() {
        let container = BoneContainer::new(&skeleton(), &["tail".to_string()], None);
        assert!(container.is_empty());
        assert!(!MirrorDataCache::new(None, &container).is_valid());
    }
}
