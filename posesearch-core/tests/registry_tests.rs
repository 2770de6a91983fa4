//! Task registry state machine under builds, modifications and ticks.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use posesearch_core::prelude::*;

fn registry(factory: WaveFactory, config: RegistryConfig) -> TaskRegistry {
    TaskRegistry::new(Arc::new(MemoryCache::new()), Arc::new(factory), config)
}

/// Ticks until the task leaves `Prestarted` or the deadline passes.
fn tick_until_settled(registry: &TaskRegistry, database: &Arc<Database>) -> Option<TaskState> {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        registry.tick();
        let state = registry.task_state(database);
        if state != Some(TaskState::Prestarted) || Instant::now() > deadline {
            return state;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_ticks_drive_a_build_to_completion() {
    let registry = registry(WaveFactory::new(), RegistryConfig::default());
    let db = database("db", DatabaseSettings::default(), &[clip("walk", 1.0)]);

    assert_eq!(registry.request_build(&db, BuildRequest::new_request()), BuildStatus::InProgress);
    assert_eq!(tick_until_settled(&registry, &db), Some(TaskState::Ended));
    assert_eq!(
        registry.request_build(&db, BuildRequest::continue_request()),
        BuildStatus::Success
    );
    assert_eq!(db.search_index().unwrap().num_poses(), 30);
}

#[test]
fn test_unloaded_clip_defers_until_loaded() {
    let registry = registry(WaveFactory::new(), RegistryConfig::default());
    let walk = Asset::new_unloaded("walk", AnimationClip::new(1.0));
    let db = database("db", DatabaseSettings::default(), &[walk.clone()]);

    assert_eq!(registry.request_build(&db, BuildRequest::new_request().waiting()), BuildStatus::InProgress);
    registry.tick();
    assert_eq!(registry.task_state(&db), Some(TaskState::Notstarted));

    walk.set_loaded(true);
    assert_eq!(tick_until_settled(&registry, &db), Some(TaskState::Ended));
}

#[test]
fn test_cancelled_build_is_never_installed() {
    let registry = registry(WaveFactory::slow(Duration::from_millis(2)), RegistryConfig::default());
    let walk = clip("walk", 2.0);
    let db = database("db", DatabaseSettings::default(), &[walk.clone()]);

    assert_eq!(registry.request_build(&db, BuildRequest::new_request()), BuildStatus::InProgress);
    registry.pre_modified(walk.id());
    assert_eq!(registry.task_state(&db), Some(TaskState::PreCancelled));
    walk.write().play_length = 1.0;
    registry.post_modified(walk.id());

    assert_eq!(registry.task_state(&db), Some(TaskState::Cancelled));
    assert!(db.search_index().is_none());

    registry.tick();
    assert_eq!(registry.num_tasks(), 0);
    assert!(db.search_index().is_none());
}

#[test]
fn test_cancelled_rebuild_keeps_installed_index() {
    let registry = registry(WaveFactory::slow(Duration::from_millis(2)), RegistryConfig::default());
    let walk = clip("walk", 1.0);
    let db = database("db", DatabaseSettings::default(), &[walk.clone()]);
    assert_eq!(registry.request_build(&db, BuildRequest::new_request().waiting()), BuildStatus::Success);
    let installed = db.search_index().unwrap();

    registry.pre_modified(walk.id());
    walk.write().play_length = 2.0;
    registry.post_modified(walk.id());
    assert_eq!(registry.task_state(&db), Some(TaskState::Cancelled));

    // the rebuild for the new content is cancelled while it runs
    assert_eq!(registry.request_build(&db, BuildRequest::new_request()), BuildStatus::InProgress);
    registry.pre_modified(walk.id());
    walk.write().play_length = 3.0;
    registry.post_modified(walk.id());
    registry.tick();

    assert!(Arc::ptr_eq(&db.search_index().unwrap(), &installed));
    assert_eq!(installed.num_poses(), 30);
}

#[test]
fn test_no_task_stays_cancelled_after_tick() {
    for reindex in [false, true] {
        let config = RegistryConfig::default().with_reindex_cancelled(reindex);
        let registry = registry(WaveFactory::new(), config);
        let walk = clip("walk", 1.0);
        let dbs: Vec<Arc<Database>> = (0..3)
            .map(|i| database(&format!("db{}", i), DatabaseSettings::default(), &[walk.clone()]))
            .collect();
        for db in &dbs {
            registry.request_build(db, BuildRequest::new_request().waiting());
        }

        registry.pre_modified(walk.id());
        registry.post_modified(walk.id());
        registry.tick();

        for db in &dbs {
            assert_ne!(registry.task_state(db), Some(TaskState::Cancelled));
        }
        let expected = if reindex { 3 } else { 0 };
        assert_eq!(registry.num_tasks(), expected);
    }
}

#[test]
fn test_unrelated_modification_keeps_tasks() {
    let registry = registry(WaveFactory::new(), RegistryConfig::default());
    let db = database("db", DatabaseSettings::default(), &[clip("walk", 1.0)]);
    registry.request_build(&db, BuildRequest::new_request().waiting());

    let unrelated = clip("idle", 3.0);
    registry.pre_modified(unrelated.id());
    registry.post_modified(unrelated.id());
    registry.tick();
    assert_eq!(registry.task_state(&db), Some(TaskState::Ended));
}

#[test]
fn test_schema_change_restarts_with_new_key() {
    let registry = registry(WaveFactory::new(), RegistryConfig::default());
    let schema = schema();
    let db = database_with_schema("db", schema.clone(), DatabaseSettings::default(), &[clip("walk", 1.0)]);
    registry.request_build(&db, BuildRequest::new_request().waiting());
    let first = db.search_index().unwrap();

    registry.pre_modified(schema.id());
    {
        let mut schema = schema.write();
        schema.sample_rate = 60;
        schema.permutations_sample_rate = 60;
    }
    registry.post_modified(schema.id());
    registry.tick();

    assert_eq!(registry.request_build(&db, BuildRequest::new_request().waiting()), BuildStatus::Success);
    let second = db.search_index().unwrap();
    assert_eq!(first.num_poses(), 30);
    assert_eq!(second.num_poses(), 60);
}

#[test]
fn test_failed_build_reports_failed() {
    let registry = registry(WaveFactory::new(), RegistryConfig::default());
    let empty = database("empty", DatabaseSettings::default(), &[]);
    assert_eq!(registry.request_build(&empty, BuildRequest::new_request().waiting()), BuildStatus::Failed);
    assert_eq!(registry.task_state(&empty), Some(TaskState::Failed));
    registry.tick();
    assert_eq!(registry.task_state(&empty), Some(TaskState::Failed));
}

#[test]
fn test_dropped_database_leaves_registry() {
    let registry = registry(WaveFactory::new(), RegistryConfig::default());
    let db = database("db", DatabaseSettings::default(), &[clip("walk", 1.0)]);
    registry.request_build(&db, BuildRequest::new_request().waiting());
    assert_eq!(registry.num_tasks(), 1);
    drop(db);
    registry.tick();
    assert_eq!(registry.num_tasks(), 0);
}

#[test]
fn test_shutdown_stops_jobs_before_returning() {
    let store = Arc::new(MemoryCache::new());
    let registry = TaskRegistry::new(
        store.clone(),
        Arc::new(WaveFactory::slow(Duration::from_millis(2))),
        RegistryConfig::default(),
    );
    let db = database("db", DatabaseSettings::default(), &[clip("walk", 2.0)]);
    assert_eq!(registry.request_build(&db, BuildRequest::new_request()), BuildStatus::InProgress);

    registry.shutdown();
    assert_eq!(registry.num_tasks(), 0);
    let stored = store.len();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(store.len(), stored);
    assert!(store.is_empty());
    assert!(db.search_index().is_none());
}

#[test]
fn test_reset_all_stops_jobs_before_returning() {
    let store = Arc::new(MemoryCache::new());
    let registry = TaskRegistry::new(
        store.clone(),
        Arc::new(WaveFactory::slow(Duration::from_millis(2))),
        RegistryConfig::default(),
    );
    let db = database("db", DatabaseSettings::default(), &[clip("walk", 2.0)]);
    registry.request_build(&db, BuildRequest::new_request());

    registry.reset_all();
    std::thread::sleep(Duration::from_millis(200));
    assert!(store.is_empty());
}

#[cfg(feature = "async")]
#[tokio::test(flavor = "multi_thread")]
async fn test_async_registry_builds() {
    use posesearch_core::AsyncRegistry;

    let registry = AsyncRegistry::from_sync(registry(WaveFactory::new(), RegistryConfig::default()));
    let db = database("db", DatabaseSettings::default(), &[clip("walk", 1.0)]);
    let status = registry.build(Arc::clone(&db)).await.unwrap();
    assert_eq!(status, BuildStatus::Success);
    assert_eq!(registry.inner().task_state(&db), Some(TaskState::Ended));
    assert_eq!(db.search_index().unwrap().num_poses(), 30);
}
