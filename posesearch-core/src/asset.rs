//! Shared asset handles, object identity and content hashing.
//!
//! Every object a search index depends on (skeletons, mirror tables, schemas,
//! clips, normalization sets, databases) is reachable as an
//! `Arc<dyn Dependency>`. The key builder walks that graph and hashes each
//! object's content; mutation notifications name objects by [`ObjectId`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an asset. Never part of any content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocates a fresh id.
    pub fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Streaming hasher for object content.
///
/// Floats are hashed by bit pattern and strings are length-prefixed so two
/// different field sequences can never collide by concatenation.
pub struct ContentHasher {
    inner: blake3::Hasher,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.inner.update(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.inner.update(&v.to_le_bytes());
    }

    pub fn write_usize(&mut self, v: usize) {
        self.write_u64(v as u64);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.inner.update(&[v as u8]);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_u32(v.to_bits());
    }

    pub fn write_f32s(&mut self, values: &[f32]) {
        self.write_usize(values.len());
        for v in values {
            self.write_f32(*v);
        }
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_usize(s.len());
        self.inner.update(s.as_bytes());
    }

    pub fn finalize(&self) -> [u8; 32] {
        *self.inner.finalize().as_bytes()
    }
}

/// An object whose content participates in a cache key.
pub trait Dependency: Send + Sync {
    fn object_id(&self) -> ObjectId;

    fn name(&self) -> &str;

    /// False while the object is still streaming in; keys cannot be built yet.
    fn is_loaded(&self) -> bool;

    /// Hashes this object's own fields, not its dependencies.
    fn hash_content(&self, hasher: &mut ContentHasher);

    /// Objects this one references, in a stable order.
    fn dependencies(&self) -> Vec<Arc<dyn Dependency>>;
}

/// Payload of an [`Asset`].
pub trait AssetData: Send + Sync + 'static {
    /// Short type tag mixed into the content hash.
    const KIND: &'static str;

    fn hash_content(&self, hasher: &mut ContentHasher);

    fn dependencies(&self) -> Vec<Arc<dyn Dependency>> {
        Vec::new()
    }
}

/// A named, loadable, mutable asset.
///
/// Writers must bracket mutations with the registry's `pre_modified` and
/// `post_modified` notifications so in-flight builds are cancelled.
pub struct Asset<T> {
    id: ObjectId,
    name: String,
    loaded: AtomicBool,
    data: RwLock<T>,
}

impl<T> Asset<T> {
    /// Creates a loaded asset.
    pub fn new(name: impl Into<String>, data: T) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::next(),
            name: name.into(),
            loaded: AtomicBool::new(true),
            data: RwLock::new(data),
        })
    }

    /// Creates an asset that is not loaded yet.
    pub fn new_unloaded(name: impl Into<String>, data: T) -> Arc<Self> {
        let asset = Self::new(name, data);
        asset.set_loaded(false);
        asset
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Release);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.data.write()
    }
}

impl<T> fmt::Debug for Asset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl<T: AssetData> Dependency for Asset<T> {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_loaded(&self) -> bool {
        Asset::is_loaded(self)
    }

    fn hash_content(&self, hasher: &mut ContentHasher) {
        hasher.write_str(T::KIND);
        hasher.write_str(&self.name);
        self.data.read().hash_content(hasher);
    }

    fn dependencies(&self) -> Vec<Arc<dyn Dependency>> {
        self.data.read().dependencies()
    }
}

/// Upcasts a typed asset handle for the dependency walker.
pub fn as_dependency<T: AssetData>(asset: &Arc<Asset<T>>) -> Arc<dyn Dependency> {
    asset.clone()
}
