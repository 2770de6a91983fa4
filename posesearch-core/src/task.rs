//! One in-flight index build for one database.
//!
//! A task composes the cache key on the orchestrating thread, then hands the
//! cache lookup and the build to the rayon pool. Only the orchestrating
//! thread moves the task between states; the background job writes nothing
//! but its own result slot.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::asset::{Dependency, ObjectId};
use crate::builder::{run_cache_job, BuildOptions, BuildSource};
use crate::cancel::CancellationToken;
use crate::database::Database;
use crate::error::Result;
use crate::key::{CacheKey, KeyBuilder, PartialKeyHashes, PartialKeyMode};
use crate::sampler::SamplerFactory;
use crate::search_index::SearchIndex;
use crate::storage::CacheStore;

/// Lifecycle of an [`AsyncCacheTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Some dependency is not loaded yet; retried on the next update.
    Notstarted,
    /// Key composed and the cache job launched.
    Prestarted,
    /// A dependency is about to change; the job was told to stop.
    PreCancelled,
    /// Cancellation finalized. The registry drops or restarts the task.
    Cancelled,
    /// The index was installed on the database.
    Ended,
    /// The job finished without a usable index.
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Notstarted => "Notstarted",
            TaskState::Prestarted => "Prestarted",
            TaskState::PreCancelled => "PreCancelled",
            TaskState::Cancelled => "Cancelled",
            TaskState::Ended => "Ended",
            TaskState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

type Slot<T> = Arc<(Mutex<Option<T>>, Condvar)>;

/// Result slot of a job running on the rayon pool.
pub struct BuildHandle<T> {
    slot: Slot<T>,
}

impl<T: Send + 'static> BuildHandle<T> {
    pub fn spawn<F>(job: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let slot: Slot<T> = Arc::new((Mutex::new(None), Condvar::new()));
        let worker_slot = Arc::clone(&slot);
        rayon::spawn(move || {
            let result = job();
            let (lock, done) = &*worker_slot;
            *lock.lock() = Some(result);
            done.notify_all();
        });
        Self { slot }
    }

    /// True once the job has stored its result.
    pub fn poll(&self) -> bool {
        self.slot.0.lock().is_some()
    }

    /// Blocks until the job is done and takes its result.
    pub fn wait(self) -> T {
        let (lock, done) = &*self.slot;
        let mut guard = lock.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            done.wait(&mut guard);
        }
    }
}

/// Shared collaborators of every cache job.
#[derive(Clone)]
pub struct BuildServices {
    pub store: Arc<dyn CacheStore>,
    pub factory: Arc<dyn SamplerFactory>,
    pub options: BuildOptions,
}

impl BuildServices {
    pub fn new(store: Arc<dyn CacheStore>, factory: Arc<dyn SamplerFactory>) -> Self {
        Self {
            store,
            factory,
            options: BuildOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }
}

type JobOutput = Result<(SearchIndex, BuildSource)>;

/// Async cache task of one database.
pub struct AsyncCacheTask {
    database: Weak<Database>,
    database_id: ObjectId,
    name: String,
    key: Option<CacheKey>,
    dependencies: HashSet<ObjectId>,
    state: TaskState,
    cancel: CancellationToken,
    handle: Option<BuildHandle<JobOutput>>,
}

impl AsyncCacheTask {
    /// Creates the task and immediately tries to start a request.
    pub fn new(
        database: &Arc<Database>,
        services: &BuildServices,
        partial: &mut PartialKeyHashes,
        mode: PartialKeyMode,
    ) -> Self {
        let mut task = Self {
            database: Arc::downgrade(database),
            database_id: database.id(),
            name: database.name().to_string(),
            key: None,
            dependencies: HashSet::new(),
            state: TaskState::Notstarted,
            cancel: CancellationToken::new(),
            handle: None,
        };
        task.start_new_request_if_needed(services, partial, mode);
        task
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Key of the current request; `None` until one started.
    pub fn key(&self) -> Option<CacheKey> {
        self.key
    }

    pub fn database(&self) -> Option<Arc<Database>> {
        self.database.upgrade()
    }

    pub fn database_id(&self) -> ObjectId {
        self.database_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the database was dropped.
    pub fn is_valid(&self) -> bool {
        self.database.strong_count() > 0
    }

    pub fn depends_on(&self, id: ObjectId) -> bool {
        self.dependencies.contains(&id)
    }

    fn key_label(&self) -> String {
        self.key.map(|k| k.to_hex()).unwrap_or_else(|| "0".repeat(64))
    }

    /// Stops the running job, if any, and waits for it to return. Its
    /// result is discarded.
    fn cancel_owner(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.wait();
            // the job for this key never finished, so the same key must relaunch
            self.key = None;
        }
    }

    /// Recomposes the key and launches a cache job when it changed.
    pub fn start_new_request_if_needed(
        &mut self,
        services: &BuildServices,
        partial: &mut PartialKeyHashes,
        mode: PartialKeyMode,
    ) {
        self.cancel_owner();

        let Some(database) = self.database.upgrade() else {
            self.key = None;
            self.state = TaskState::Failed;
            return;
        };

        let builder = KeyBuilder::build(database.clone() as Arc<dyn Dependency>, Some(partial), mode);
        if builder.any_not_loaded() {
            self.key = None;
            self.state = TaskState::Notstarted;
            tracing::info!(database = %self.name, "delaying build until dependencies are fully loaded");
            return;
        }

        let key = builder.finalize();
        if self.key == Some(key) {
            return;
        }

        self.key = Some(key);
        self.dependencies = builder.dependencies().iter().copied().collect();
        self.state = TaskState::Prestarted;
        tracing::info!(key = %key, database = %self.name, "BeginCache");

        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();
        let store = Arc::clone(&services.store);
        let factory = Arc::clone(&services.factory);
        let options = services.options;
        self.handle = Some(BuildHandle::spawn(move || {
            run_cache_job(&database, &key, store.as_ref(), factory.as_ref(), &cancel, &options)
        }));
    }

    /// Stops the job if the task depends on `id`; the task then waits in
    /// `PreCancelled` for [`AsyncCacheTask::cancel`].
    pub fn pre_cancel_if_depends_on(&mut self, id: ObjectId) -> bool {
        if !self.depends_on(id) {
            return false;
        }
        let name = if self.is_valid() { self.name.as_str() } else { "dropped database" };
        tracing::info!(key = %self.key_label(), database = %name, object = %id, "PreCancelled");
        self.cancel.cancel();
        self.state = TaskState::PreCancelled;
        true
    }

    /// Stops and joins the job, forgets the key and finalizes `Cancelled`.
    pub fn cancel(&mut self) {
        let name = if self.is_valid() { self.name.as_str() } else { "dropped database" };
        tracing::info!(key = %self.key_label(), database = %name, "Cancelled");
        self.cancel_owner();
        self.key = None;
        self.state = TaskState::Cancelled;
    }

    /// True when the job is done executing.
    pub fn poll(&self) -> bool {
        self.handle.as_ref().map_or(true, BuildHandle::poll)
    }

    /// Blocks on the job and moves a `Prestarted` task to `Ended` (index
    /// installed on the database) or `Failed`.
    pub fn wait(&mut self) {
        if self.state != TaskState::Prestarted {
            return;
        }
        let outcome = self.handle.take().map(BuildHandle::wait);
        let database = self.database.upgrade();

        let installed = match (outcome, database) {
            (Some(Ok((index, _))), Some(database)) if !index.is_empty() => {
                let cardinality = database
                    .read()
                    .schema
                    .as_ref()
                    .map(|s| s.read().cardinality())
                    .unwrap_or(0);
                if index.num_dimensions() == cardinality {
                    database.set_search_index(Arc::new(index));
                    true
                } else {
                    tracing::error!(
                        database = %self.name,
                        expected = cardinality,
                        got = index.num_dimensions(),
                        "built index does not match the schema"
                    );
                    false
                }
            }
            _ => false,
        };

        self.state = if installed { TaskState::Ended } else { TaskState::Failed };
        if installed {
            tracing::debug!(key = %self.key_label(), database = %self.name, "search index installed");
        }
    }

    /// Orchestrator step: retry a deferred start, and finalize a finished
    /// job.
    pub fn update(&mut self, services: &BuildServices, partial: &mut PartialKeyHashes, mode: PartialKeyMode) {
        debug_assert_ne!(self.state, TaskState::Cancelled);
        if self.state == TaskState::Notstarted {
            self.start_new_request_if_needed(services, partial, mode);
        }
        if self.state == TaskState::Prestarted && self.poll() {
            self.wait();
        }
    }
}

impl Drop for AsyncCacheTask {
    fn drop(&mut self) {
        self.cancel_owner();
    }
}

impl fmt::Debug for AsyncCacheTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCacheTask")
            .field("database", &self.name)
            .field("key", &self.key_label())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::clip::{AnimationClip, BlendParameters, ClipRef};
    use crate::database::{DatabaseAnimationAsset, DatabaseData, RootOrigin};
    use crate::sampler::{AssetSampler, PoseMotion, PoseRequest};
    use crate::schema::{Bone, ChannelKind, FeatureChannel, Schema, Skeleton};
    use crate::storage::MemoryCache;

    struct Ramp;

    impl AssetSampler for Ramp {
        fn sample_pose(&self, request: &PoseRequest<'_>, features: &mut [f32]) -> Result<PoseMotion> {
            features[0] = request.time;
            features[1] = request.time * request.time;
            Ok(PoseMotion::default())
        }
    }

    struct RampFactory;

    impl SamplerFactory for RampFactory {
        fn create_sampler(&self, _: &ClipRef, _: &RootOrigin, _: &BlendParameters) -> Box<dyn AssetSampler> {
            Box::new(Ramp)
        }
    }

    fn services() -> BuildServices {
        BuildServices::new(Arc::new(MemoryCache::new()), Arc::new(RampFactory))
    }

    fn database(clip: ClipRef) -> Arc<Database> {
        let skeleton = Asset::new("skel", Skeleton::new(vec![Bone::root("root")]));
        let schema = Asset::new(
            "schema",
            Schema::new(10, skeleton, vec![FeatureChannel::new("curve", ChannelKind::Curve, 2).into()]),
        );
        Database::new(
            "db",
            DatabaseData {
                schema: Some(schema),
                assets: vec![DatabaseAnimationAsset::new(clip)],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_handle_wait_returns_result() {
        let handle = BuildHandle::spawn(|| 7);
        assert_eq!(handle.wait(), 7);
    }

    #[test]
    fn test_task_builds_and_installs() {
        let db = database(Asset::new("walk", AnimationClip::new(1.0)));
        let services = services();
        let mut partial = PartialKeyHashes::new();
        let mut task = AsyncCacheTask::new(&db, &services, &mut partial, PartialKeyMode::Use);
        assert_eq!(task.state(), TaskState::Prestarted);
        assert!(task.key().is_some());
        assert!(task.depends_on(db.id()));

        task.wait();
        assert_eq!(task.state(), TaskState::Ended);
        assert_eq!(db.search_index().unwrap().num_poses(), 10);
    }

    #[test]
    fn test_unloaded_dependency_defers_start() {
        let clip = Asset::new_unloaded("walk", AnimationClip::new(1.0));
        let db = database(clip.clone());
        let services = services();
        let mut partial = PartialKeyHashes::new();
        let mut task = AsyncCacheTask::new(&db, &services, &mut partial, PartialKeyMode::Use);
        assert_eq!(task.state(), TaskState::Notstarted);
        assert!(task.key().is_none());

        clip.set_loaded(true);
        task.update(&services, &mut partial, PartialKeyMode::Use);
        assert_ne!(task.state(), TaskState::Notstarted);
        task.wait();
        assert_eq!(task.state(), TaskState::Ended);
    }

    #[test]
    fn test_pre_cancel_then_cancel() {
        let clip = Asset::new("walk", AnimationClip::new(1.0));
        let db = database(clip.clone());
        let services = services();
        let mut partial = PartialKeyHashes::new();
        let mut task = AsyncCacheTask::new(&db, &services, &mut partial, PartialKeyMode::Use);

        assert!(!task.pre_cancel_if_depends_on(ObjectId::next()));
        assert!(task.pre_cancel_if_depends_on(clip.id()));
        assert_eq!(task.state(), TaskState::PreCancelled);

        task.cancel();
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(task.key().is_none());
        assert!(task.poll());
    }

    #[test]
    fn test_dropped_database_fails_wait() {
        let db = database(Asset::new("walk", AnimationClip::new(1.0)));
        let services = services();
        let mut partial = PartialKeyHashes::new();
        let mut task = AsyncCacheTask::new(&db, &services, &mut partial, PartialKeyMode::Use);
        drop(db);
        task.wait();
        assert!(!task.is_valid());
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[test]
    fn test_empty_database_fails() {
        let db = database(Asset::new("walk", AnimationClip::new(1.0)));
        db.write().assets.clear();
        let services = services();
        let mut partial = PartialKeyHashes::new();
        let mut task = AsyncCacheTask::new(&db, &services, &mut partial, PartialKeyMode::Use);
        task.wait();
        assert_eq!(task.state(), TaskState::Failed);
        assert!(db.search_index().is_none());
    }
}
