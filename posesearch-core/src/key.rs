//! Content-hash cache keys.
//!
//! A key hashes the database and everything it transitively depends on.
//! Each object contributes a partial hash of its own fields; partial hashes
//! are memoized per [`ObjectId`] across builds and dropped whenever the
//! registry hears that the object is about to change.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::asset::{ContentHasher, Dependency, ObjectId};

/// Bumped whenever the layout of a built index or the meaning of a key
/// changes, so stale blobs stop matching.
pub const KEY_FORMAT_VERSION: u32 = 3;

/// 32-byte blake3 digest identifying one set of build inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, 64 characters.
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Seed derived from the key, used when no VP-tree seed is configured.
    pub fn seed(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(head)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// How the key builder uses memoized partial hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartialKeyMode {
    /// Reuse memoized hashes and record new ones.
    #[default]
    Use,
    /// Always rehash every object.
    DoNotUse,
    /// Rehash every object and report memoized hashes that went stale.
    Validate,
}

/// Memoized per-object content hashes.
#[derive(Debug, Clone, Default)]
pub struct PartialKeyHashes {
    hashes: HashMap<ObjectId, [u8; 32]>,
}

impl PartialKeyHashes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ObjectId) -> Option<[u8; 32]> {
        self.hashes.get(&id).copied()
    }

    pub fn insert(&mut self, id: ObjectId, hash: [u8; 32]) {
        self.hashes.insert(id, hash);
    }

    /// Forgets `id`; called before the object is mutated.
    pub fn remove(&mut self, id: ObjectId) {
        self.hashes.remove(&id);
    }

    pub fn clear(&mut self) {
        self.hashes.clear();
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Walks a dependency graph and accumulates the cache key.
///
/// Objects are visited depth first in the order their owners list them;
/// each object is hashed once even when the graph has cycles.
pub struct KeyBuilder<'a> {
    hasher: ContentHasher,
    partial: Option<&'a mut PartialKeyHashes>,
    mode: PartialKeyMode,
    visited: HashSet<ObjectId>,
    dependencies: Vec<ObjectId>,
    any_not_loaded: bool,
    stale_partials: Vec<ObjectId>,
}

impl<'a> KeyBuilder<'a> {
    pub fn new(partial: Option<&'a mut PartialKeyHashes>, mode: PartialKeyMode) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.write_u32(KEY_FORMAT_VERSION);
        Self {
            hasher,
            partial,
            mode,
            visited: HashSet::new(),
            dependencies: Vec::new(),
            any_not_loaded: false,
            stale_partials: Vec::new(),
        }
    }

    /// Builds the key of `root` and everything it depends on.
    pub fn build(root: Arc<dyn Dependency>, partial: Option<&'a mut PartialKeyHashes>, mode: PartialKeyMode) -> Self {
        let mut builder = Self::new(partial, mode);
        builder.add(root);
        builder
    }

    pub fn add(&mut self, root: Arc<dyn Dependency>) {
        let mut stack = vec![root];
        while let Some(object) = stack.pop() {
            let id = object.object_id();
            if !self.visited.insert(id) {
                continue;
            }
            self.dependencies.push(id);

            if !object.is_loaded() {
                self.any_not_loaded = true;
                continue;
            }

            let partial = self.partial_hash(object.as_ref());
            self.hasher.write_bytes(&partial);

            // reversed so the first listed dependency is visited first
            let mut children = object.dependencies();
            children.reverse();
            stack.extend(children);
        }
    }

    fn partial_hash(&mut self, object: &dyn Dependency) -> [u8; 32] {
        let id = object.object_id();
        if self.mode == PartialKeyMode::Use {
            if let Some(hash) = self.partial.as_ref().and_then(|p| p.get(id)) {
                return hash;
            }
        }

        let mut hasher = ContentHasher::new();
        object.hash_content(&mut hasher);
        let hash = hasher.finalize();

        match self.mode {
            PartialKeyMode::Use => {
                if let Some(partial) = self.partial.as_mut() {
                    partial.insert(id, hash);
                }
            }
            PartialKeyMode::Validate => {
                if let Some(partial) = self.partial.as_mut() {
                    if partial.get(id).is_some_and(|memo| memo != hash) {
                        tracing::error!(object = %object.name(), id = %id, "memoized partial key hash is stale");
                        self.stale_partials.push(id);
                    }
                    partial.insert(id, hash);
                }
            }
            PartialKeyMode::DoNotUse => {}
        }
        hash
    }

    /// True when some visited object is still loading; the key is not usable.
    pub fn any_not_loaded(&self) -> bool {
        self.any_not_loaded
    }

    /// Every visited object, in visit order.
    pub fn dependencies(&self) -> &[ObjectId] {
        &self.dependencies
    }

    /// Objects whose memoized hash disagreed with their content
    /// (`PartialKeyMode::Validate` only).
    pub fn stale_partials(&self) -> &[ObjectId] {
        &self.stale_partials
    }

    pub fn finalize(&self) -> CacheKey {
        CacheKey(self.hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{as_dependency, Asset, AssetData};
    use crate::clip::AnimationClip;
    use crate::database::{Database, DatabaseAnimationAsset, DatabaseData};

    struct Note(String, Vec<Arc<dyn Dependency>>);

    impl AssetData for Note {
        const KIND: &'static str = "note";

        fn hash_content(&self, hasher: &mut ContentHasher) {
            hasher.write_str(&self.0);
        }

        fn dependencies(&self) -> Vec<Arc<dyn Dependency>> {
            self.1.clone()
        }
    }

    fn key_of(root: Arc<dyn Dependency>) -> CacheKey {
        KeyBuilder::build(root, None, PartialKeyMode::DoNotUse).finalize()
    }

    #[test]
    fn test_key_hex_roundtrip_shape() {
        let key = key_of(as_dependency(&Asset::new("a", Note("x".into(), vec![]))));
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(format!("{}", key), hex);
    }

    #[test]
    fn test_key_follows_dependency_content() {
        let leaf = Asset::new("leaf", Note("v1".into(), vec![]));
        let root = Asset::new("root", Note("r".into(), vec![as_dependency(&leaf)]));
        let before = key_of(as_dependency(&root));
        assert_eq!(before, key_of(as_dependency(&root)));

        leaf.write().0 = "v2".into();
        assert_ne!(before, key_of(as_dependency(&root)));
    }

    #[test]
    fn test_cycles_are_visited_once() {
        let a = Database::new("a", DatabaseData::default());
        let set = Asset::new("set", crate::database::NormalizationSet::new(&[&a]));
        a.write().normalization_set = Some(set.clone());
        let builder = KeyBuilder::build(a.clone(), None, PartialKeyMode::Use);
        assert_eq!(builder.dependencies(), &[a.id(), set.id()]);
    }

    #[test]
    fn test_not_loaded_dependency_is_reported() {
        let clip = Asset::new_unloaded("walk", AnimationClip::new(1.0));
        let db = Database::new(
            "db",
            DatabaseData {
                assets: vec![DatabaseAnimationAsset::new(clip.clone())],
                ..Default::default()
            },
        );
        let builder = KeyBuilder::build(db.clone(), None, PartialKeyMode::Use);
        assert!(builder.any_not_loaded());
        assert!(builder.dependencies().contains(&clip.id()));
    }

    #[test]
    fn test_memoized_hashes_are_reused_until_removed() {
        let leaf = Asset::new("leaf", Note("v1".into(), vec![]));
        let mut partial = PartialKeyHashes::new();
        let first = KeyBuilder::build(as_dependency(&leaf), Some(&mut partial), PartialKeyMode::Use).finalize();
        assert_eq!(partial.len(), 1);

        // mutation without notification: the memoized hash wins
        leaf.write().0 = "v2".into();
        let stale = KeyBuilder::build(as_dependency(&leaf), Some(&mut partial), PartialKeyMode::Use).finalize();
        assert_eq!(first, stale);

        let validated = {
            let validate = KeyBuilder::build(as_dependency(&leaf), Some(&mut partial), PartialKeyMode::Validate);
            assert_eq!(validate.stale_partials(), &[leaf.id()]);
            validate.finalize()
        };
        assert_ne!(validated, first);

        partial.remove(leaf.id());
        let fresh = KeyBuilder::build(as_dependency(&leaf), Some(&mut partial), PartialKeyMode::Use).finalize();
        assert_eq!(fresh, validated);
    }

    #[test]
    fn test_seed_is_stable() {
        let key = CacheKey::from_bytes([7u8; 32]);
        assert_eq!(key.seed(), u64::from_le_bytes([7u8; 8]));
    }
}
