//! Registry of async cache tasks.
//!
//! The registry is the single orchestrator: callers request builds, report
//! object modifications and tick it periodically. Every task mutation
//! happens under the registry lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::asset::ObjectId;
use crate::builder::BuildOptions;
use crate::clip::ClipRef;
use crate::database::Database;
use crate::key::{PartialKeyHashes, PartialKeyMode};
use crate::sampler::SamplerFactory;
use crate::storage::CacheStore;
use crate::task::{AsyncCacheTask, BuildServices, TaskState};

/// Registry configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryConfig {
    /// Restart cancelled tasks on the next tick instead of dropping them.
    pub reindex_cancelled_databases: bool,
    /// Continue requests for every database reachable through
    /// normalization sets whenever one of them is requested.
    pub reindex_referenced_databases: bool,
    pub partial_key_mode: PartialKeyMode,
    /// Self-lookup check of built trees, see [`BuildOptions`].
    pub tree_validation_epsilon: Option<f32>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reindex_cancelled_databases: false,
            reindex_referenced_databases: true,
            partial_key_mode: PartialKeyMode::Use,
            tree_validation_epsilon: None,
        }
    }
}

impl RegistryConfig {
    pub fn with_reindex_cancelled(mut self, enabled: bool) -> Self {
        self.reindex_cancelled_databases = enabled;
        self
    }

    pub fn with_reindex_referenced(mut self, enabled: bool) -> Self {
        self.reindex_referenced_databases = enabled;
        self
    }

    pub fn with_partial_key_mode(mut self, mode: PartialKeyMode) -> Self {
        self.partial_key_mode = mode;
        self
    }

    pub fn with_tree_validation(mut self, epsilon: f32) -> Self {
        self.tree_validation_epsilon = Some(epsilon);
        self
    }
}

/// Whether a request restarts the task or only checks on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Recompose the key and restart the build if it changed.
    NewRequest,
    /// Create the task if missing, otherwise report its state.
    ContinueRequest,
}

/// A build request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildRequest {
    pub kind: RequestKind,
    /// Block until the build finishes.
    pub wait_for_completion: bool,
}

impl BuildRequest {
    pub fn new_request() -> Self {
        Self {
            kind: RequestKind::NewRequest,
            wait_for_completion: false,
        }
    }

    pub fn continue_request() -> Self {
        Self {
            kind: RequestKind::ContinueRequest,
            wait_for_completion: false,
        }
    }

    pub fn waiting(mut self) -> Self {
        self.wait_for_completion = true;
        self
    }
}

/// Outcome reported to a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Failed,
    InProgress,
}

struct PendingSync {
    database: Weak<Database>,
    clips: Vec<ClipRef>,
}

#[derive(Default)]
struct RegistryInner {
    tasks: Vec<AsyncCacheTask>,
    partial: PartialKeyHashes,
    to_synchronize: HashMap<ObjectId, PendingSync>,
}

impl RegistryInner {
    fn position(&self, database: &Arc<Database>) -> Option<usize> {
        self.tasks.iter().position(|t| t.database_id() == database.id())
    }

    /// Records the databases `clip` branches into, so they can pick up or
    /// drop the clip once the modification is over.
    fn collect_databases_to_synchronize(&mut self, clip: &ClipRef) {
        let targets: Vec<Arc<Database>> = clip.read().branch_in.iter().filter_map(Weak::upgrade).collect();
        for database in targets {
            let pending = self.to_synchronize.entry(database.id()).or_insert_with(|| PendingSync {
                database: Arc::downgrade(&database),
                clips: Vec::new(),
            });
            if !pending.clips.iter().any(|c| Arc::ptr_eq(c, clip)) {
                pending.clips.push(clip.clone());
            }
        }
    }

    /// Returns the databases whose asset list changed.
    fn synchronize_databases(&mut self) -> Vec<Arc<Database>> {
        let mut changed = Vec::new();
        for (_, pending) in self.to_synchronize.drain() {
            if let Some(database) = pending.database.upgrade() {
                if database.synchronize_with_external_dependencies(&pending.clips) {
                    tracing::info!(database = %database.name(), "synchronized branch-in assets");
                    changed.push(database);
                }
            }
        }
        changed
    }

    fn pre_cancel_dependents(&mut self, id: ObjectId) {
        self.partial.remove(id);
        for task in self.tasks.iter_mut().rev() {
            task.pre_cancel_if_depends_on(id);
        }
    }

    fn clear_pre_cancelled(&mut self) {
        for task in self.tasks.iter_mut().rev() {
            if task.state() == TaskState::PreCancelled {
                task.cancel();
            }
        }
    }
}

/// Owner of every async cache task.
pub struct TaskRegistry {
    config: RegistryConfig,
    services: BuildServices,
    inner: Mutex<RegistryInner>,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn CacheStore>, factory: Arc<dyn SamplerFactory>, config: RegistryConfig) -> Self {
        let options = BuildOptions {
            force_rebuild: false,
            tree_validation_epsilon: config.tree_validation_epsilon,
        };
        Self {
            config,
            services: BuildServices::new(store, factory).with_options(options),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Requests (or checks on) the index build of `database`.
    ///
    /// With `reindex_referenced_databases`, every other database reachable
    /// through normalization sets first gets a continue request.
    pub fn request_build(&self, database: &Arc<Database>, request: BuildRequest) -> BuildStatus {
        let mut inner = self.inner.lock();
        if self.config.reindex_referenced_databases {
            for other in database.reachable_databases() {
                if !Arc::ptr_eq(&other, database) {
                    self.request_internal(&mut inner, &other, BuildRequest::continue_request());
                }
            }
        }
        self.request_internal(&mut inner, database, request)
    }

    fn request_internal(&self, inner: &mut RegistryInner, database: &Arc<Database>, request: BuildRequest) -> BuildStatus {
        let mode = self.config.partial_key_mode;
        let RegistryInner { tasks, partial, .. } = inner;

        let index = match tasks.iter().position(|t| t.database_id() == database.id()) {
            Some(index) => {
                if request.kind == RequestKind::NewRequest {
                    let task = &mut tasks[index];
                    if task.state() == TaskState::Prestarted {
                        task.cancel();
                    }
                    task.start_new_request_if_needed(&self.services, partial, mode);
                }
                index
            }
            None => {
                tasks.push(AsyncCacheTask::new(database, &self.services, partial, mode));
                tasks.len() - 1
            }
        };

        let task = &mut tasks[index];
        if request.wait_for_completion && task.state() == TaskState::Prestarted {
            task.wait();
        }

        match task.state() {
            TaskState::Ended => BuildStatus::Success,
            TaskState::Failed => BuildStatus::Failed,
            _ => BuildStatus::InProgress,
        }
    }

    /// Orchestrator step. Drops tasks of dropped databases, drops (or
    /// restarts) cancelled tasks and advances the rest.
    pub fn tick(&self) {
        let mut inner = self.inner.lock();
        let mode = self.config.partial_key_mode;
        let RegistryInner { tasks, partial, .. } = &mut *inner;

        for index in (0..tasks.len()).rev() {
            if !tasks[index].is_valid() {
                tasks.swap_remove(index);
            } else if tasks[index].state() == TaskState::Cancelled {
                if self.config.reindex_cancelled_databases {
                    tasks[index].start_new_request_if_needed(&self.services, partial, mode);
                } else {
                    tasks.swap_remove(index);
                }
            } else {
                tasks[index].update(&self.services, partial, mode);
            }
        }
    }

    /// Must be called before `id` is mutated: forgets its memoized key hash
    /// and stops every task depending on it.
    pub fn pre_modified(&self, id: ObjectId) {
        self.inner.lock().pre_cancel_dependents(id);
    }

    /// Must be called after `id` was mutated: finalizes the cancellations
    /// started by [`TaskRegistry::pre_modified`].
    pub fn post_modified(&self, _id: ObjectId) {
        let mut inner = self.inner.lock();
        inner.clear_pre_cancelled();
    }

    /// [`TaskRegistry::pre_modified`] for a clip, also recording the
    /// databases it currently branches into.
    pub fn pre_modified_clip(&self, clip: &ClipRef) {
        let mut inner = self.inner.lock();
        inner.pre_cancel_dependents(clip.id());
        inner.collect_databases_to_synchronize(clip);
    }

    /// [`TaskRegistry::post_modified`] for a clip: databases it branched
    /// into before or after the change pick up or drop it.
    pub fn post_modified_clip(&self, clip: &ClipRef) {
        let mut inner = self.inner.lock();
        inner.collect_databases_to_synchronize(clip);
        for database in inner.synchronize_databases() {
            // the database itself changed, so its dependents must rebuild
            inner.pre_cancel_dependents(database.id());
        }
        inner.clear_pre_cancelled();
    }

    /// Cancels and drops every task (package reload). Returns once every
    /// running job has stopped.
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock();
        for task in &inner.tasks {
            tracing::info!(database = %task.name(), "Cancelled because of reset");
        }
        inner.tasks.clear();
    }

    /// Drops every task and memoized hash. Running jobs are cancelled and
    /// joined, so none of them writes to the cache afterwards.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.tasks.clear();
        inner.partial.clear();
        inner.to_synchronize.clear();
    }

    pub fn num_tasks(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn task_state(&self, database: &Arc<Database>) -> Option<TaskState> {
        let inner = self.inner.lock();
        inner.position(database).map(|i| inner.tasks[i].state())
    }

    pub fn num_partial_hashes(&self) -> usize {
        self.inner.lock().partial.len()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.inner.get_mut().tasks.clear();
    }
}

// Async API when tokio feature is enabled
#[cfg(feature = "async")]
mod async_api {
    use super::*;
    use crate::error::{Error, Result};

    /// Async wrapper for [`TaskRegistry`].
    ///
    /// Blocking requests run on tokio's blocking pool through
    /// `spawn_blocking`.
    #[derive(Clone)]
    pub struct AsyncRegistry {
        inner: Arc<TaskRegistry>,
    }

    impl AsyncRegistry {
        pub fn from_sync(registry: TaskRegistry) -> Self {
            Self {
                inner: Arc::new(registry),
            }
        }

        /// Requests a build and waits for it without blocking the runtime.
        pub async fn build(&self, database: Arc<Database>) -> Result<BuildStatus> {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.request_build(&database, BuildRequest::new_request().waiting()))
                .await
                .map_err(|e| Error::RegistryError(format!("spawn_blocking failed: {}", e)))
        }

        pub fn request_build(&self, database: &Arc<Database>, request: BuildRequest) -> BuildStatus {
            self.inner.request_build(database, request)
        }

        pub fn tick(&self) {
            self.inner.tick();
        }

        pub fn inner(&self) -> &TaskRegistry {
            &self.inner
        }
    }
}

#[cfg(feature = "async")]
pub use async_api::AsyncRegistry;
