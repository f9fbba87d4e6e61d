/// Migration engine integration tests
/// Run with: cargo test --test engine_tests

mod common;

use changebee::storage::SnapshotManager;
use changebee::{
    ChangeUnit, Document, DocumentStore, DurabilityMode, EngineState, ErrorKind, IndexSpec,
    InMemoryStorage, LockStore, MigrationConfig, MigrationEngine, MigrationError, RunStatus,
};
use common::InstrumentedStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Barrier, Notify};

const LOCK_COLLECTION: &str = "mongobeelock";
const CHANGELOG_COLLECTION: &str = "dbchangelog";

fn engine_for(store: &InMemoryStorage, owner: &str) -> MigrationEngine {
    MigrationEngine::new(Arc::new(store.clone()), MigrationConfig::new("test").owner(owner)).unwrap()
}

fn counting_unit(change_id: &str, counter: &Arc<AtomicUsize>) -> ChangeUnit {
    let counter = Arc::clone(counter);
    ChangeUnit::from_fn(change_id, "u1", 0, move |_db| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    })
}

fn failing_unit(change_id: &str) -> ChangeUnit {
    ChangeUnit::from_fn(change_id, "u1", 0, |_db| async move {
        Err::<(), _>(anyhow::anyhow!("index build rejected"))
    })
}

async fn wait_until_unlocked(lock: &LockStore) -> bool {
    for _ in 0..100 {
        if !lock.is_held().await.unwrap() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_both_units_succeed() {
    let store = InMemoryStorage::new();
    let engine = engine_for(&store, "a");
    let counter = Arc::new(AtomicUsize::new(0));
    let units = vec![counting_unit("A", &counter), counting_unit("B", &counter)];

    let report = engine.run(&units).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.discovered_count, 2);
    assert_eq!(report.executed_count, 2);
    assert_eq!(report.skipped_count, 0);
    assert!(report.error.is_none());
    assert!(engine.ledger().is_applied("A", "u1").await.unwrap());
    assert!(engine.ledger().is_applied("B", "u1").await.unwrap());
    assert_eq!(engine.ledger().count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_second_run_skips_everything() {
    let store = InMemoryStorage::new();
    let engine = engine_for(&store, "a");
    let counter = Arc::new(AtomicUsize::new(0));
    let units = vec![
        counting_unit("A", &counter),
        counting_unit("B", &counter),
        counting_unit("C", &counter),
    ];

    engine.run(&units).await;
    let second = engine.run(&units).await;

    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.executed_count, 0);
    assert_eq!(second.skipped_count, 3);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_failing_unit_stops_the_run() {
    let store = InMemoryStorage::new();
    let engine = engine_for(&store, "a");
    let counter = Arc::new(AtomicUsize::new(0));
    let units = vec![
        counting_unit("A", &counter),
        failing_unit("B"),
        counting_unit("C", &counter),
    ];

    let report = engine.run(&units).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.executed_count, 1);
    let error = report.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ChangeUnitExecutionFailed);
    assert_eq!(error.change_id.as_deref(), Some("B"));
    assert_eq!(error.author.as_deref(), Some("u1"));
    assert!(error.message.contains("index build rejected"));

    // C never ran, only A is recorded, lock is free
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(engine.ledger().is_applied("A", "u1").await.unwrap());
    assert!(!engine.ledger().is_applied("B", "u1").await.unwrap());
    assert_eq!(engine.ledger().count().await.unwrap(), 1);
    assert!(!engine.lock_store().is_held().await.unwrap());
    assert_eq!(engine.state(), EngineState::Unlocked);
}

#[tokio::test]
async fn test_run_checked_returns_underlying_error() {
    let store = InMemoryStorage::new();
    let engine = engine_for(&store, "a");

    let err = engine.run_checked(&[failing_unit("B")]).await.unwrap_err();
    match err {
        MigrationError::ChangeUnitExecutionFailed { change_id, source, .. } => {
            assert_eq!(change_id, "B");
            assert!(source.to_string().contains("index build rejected"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_lock_held_elsewhere_skips_without_inspecting_units() {
    let inner = InMemoryStorage::new();
    let store = InstrumentedStore::new(inner.clone(), CHANGELOG_COLLECTION);

    let other = LockStore::new(Arc::new(inner.clone()), LOCK_COLLECTION, "other-host");
    other.initialize().await.unwrap();
    assert!(other.acquire().await.unwrap());

    let engine = MigrationEngine::new(store.clone(), MigrationConfig::new("test").owner("a")).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let report = engine.run(&[counting_unit("A", &counter)]).await;

    assert_eq!(report.status, RunStatus::Skipped);
    assert_eq!(report.executed_count, 0);
    assert_eq!(report.skipped_count, 0);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(store.reads(), 0, "ledger must not be consulted");

    // The other owner still holds the lock
    let record = other.current().await.unwrap().unwrap();
    assert_eq!(record.owner.as_deref(), Some("other-host"));
    assert_eq!(engine.state(), EngineState::Skipped);
}

#[tokio::test]
async fn test_storage_unavailable_fails_run() {
    let store = InMemoryStorage::new();
    let engine = engine_for(&store, "a");
    store.set_available(false);

    let counter = Arc::new(AtomicUsize::new(0));
    let report = engine.run(&[counting_unit("A", &counter)]).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.error.unwrap().kind, ErrorKind::StorageUnavailable);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connection_lost_mid_run_is_fatal() {
    let store = InMemoryStorage::new();
    let engine = engine_for(&store, "a");

    let cut = store.clone();
    let units = vec![ChangeUnit::from_fn("A", "u1", 0, move |_db| {
        let cut = cut.clone();
        async move {
            cut.set_available(false);
            anyhow::Ok(())
        }
    })];

    let report = engine.run(&units).await;
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.error.unwrap().kind, ErrorKind::StorageUnavailable);

    // Once the connection comes back, the lock can still be cleared and the
    // unrecorded unit runs again.
    store.set_available(true);
    engine.lock_store().release().await.unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let report = engine.run(&[counting_unit("A", &counter)]).await;
    assert_eq!(report.executed_count, 1);
}

#[tokio::test]
async fn test_ledger_write_failure_is_fatal() {
    let inner = InMemoryStorage::new();
    let store = InstrumentedStore::new(inner.clone(), CHANGELOG_COLLECTION);
    let engine = MigrationEngine::new(store.clone(), MigrationConfig::new("test").owner("a")).unwrap();
    store.fail_inserts(true);

    let counter = Arc::new(AtomicUsize::new(0));
    let report = engine
        .run(&[counting_unit("A", &counter), counting_unit("B", &counter)])
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    let error = report.error.unwrap();
    assert_eq!(error.kind, ErrorKind::LedgerWriteFailed);
    assert_eq!(error.change_id.as_deref(), Some("A"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(!engine.lock_store().is_held().await.unwrap());
}

#[tokio::test]
async fn test_cancelled_run_releases_lock() {
    let store = InMemoryStorage::new();
    let engine = Arc::new(engine_for(&store, "a"));
    let started = Arc::new(Notify::new());

    let signal = Arc::clone(&started);
    let units = vec![ChangeUnit::from_fn("slow", "u1", 0, move |_db| {
        let signal = Arc::clone(&signal);
        async move {
            signal.notify_one();
            std::future::pending::<()>().await;
            anyhow::Ok(())
        }
    })];

    let runner = Arc::clone(&engine);
    let handle = tokio::spawn(async move { runner.run(&units).await });

    started.notified().await;
    assert!(engine.lock_store().is_held().await.unwrap());

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    assert!(wait_until_unlocked(engine.lock_store()).await);
    assert!(!engine.ledger().is_applied("slow", "u1").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_engines_apply_each_unit_once() {
    let store = InMemoryStorage::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let units: Vec<ChangeUnit> = (0..5)
        .map(|i| counting_unit(&format!("change-{}", i), &counter))
        .collect();

    let barrier = Arc::new(Barrier::new(8));
    let mut handles = vec![];
    for i in 0..8 {
        let engine = engine_for(&store, &format!("host-{}", i));
        let units = units.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.run(&units).await
        }));
    }

    let mut completed = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        assert!(report.is_success());
        if report.status == RunStatus::Completed {
            completed += 1;
        }
    }

    assert!(completed >= 1);
    assert_eq!(counter.load(Ordering::SeqCst), 5);
    let engine = engine_for(&store, "checker");
    assert_eq!(engine.ledger().count().await.unwrap(), 5);
    assert!(!engine.lock_store().is_held().await.unwrap());
}

#[tokio::test]
async fn test_ledger_survives_store_restart() {
    let dir = TempDir::new().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let units = vec![counting_unit("A", &counter), counting_unit("B", &counter)];

    {
        let store = InMemoryStorage::open(dir.path(), DurabilityMode::Sync).unwrap();
        let report = engine_for(&store, "a").run(&units).await;
        assert_eq!(report.executed_count, 2);
    }

    let store = InMemoryStorage::open(dir.path(), DurabilityMode::Sync).unwrap();
    let report = engine_for(&store, "b").run(&units).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.executed_count, 0);
    assert_eq!(report.skipped_count, 2);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let store = InMemoryStorage::new();
    let engine = engine_for(&store, "a");
    let mut states = engine.subscribe();

    let other = LockStore::new(Arc::new(store.clone()), LOCK_COLLECTION, "other");
    other.initialize().await.unwrap();
    other.acquire().await.unwrap();

    engine.run(&[]).await;
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), EngineState::Skipped);

    other.release().await.unwrap();
    engine.run(&[]).await;
    assert_eq!(*states.borrow_and_update(), EngineState::Unlocked);
}

#[tokio::test]
async fn test_unit_not_counted_when_ledger_checkpoint_fails() {
    let dir = TempDir::new().unwrap();
    let blocker = SnapshotManager::in_dir(dir.path()).path().with_extension("tmp");
    let store = InMemoryStorage::open(dir.path(), DurabilityMode::Sync).unwrap();
    let engine = engine_for(&store, "a");

    // The action itself succeeds, but the snapshot can no longer be written
    let path = blocker.clone();
    let units = vec![ChangeUnit::from_fn("B", "u1", 0, move |_db| {
        let path = path.clone();
        async move {
            std::fs::create_dir(&path)?;
            anyhow::Ok(())
        }
    })];

    let report = engine.run(&units).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.executed_count, 1);
    let error = report.error.unwrap();
    assert_eq!(error.kind, ErrorKind::LedgerWriteFailed);
    assert_eq!(error.change_id.as_deref(), Some("B"));

    drop(engine);
    drop(store);
    std::fs::remove_dir(&blocker).unwrap();
    let reopened = InMemoryStorage::open(dir.path(), DurabilityMode::Sync).unwrap();
    let engine = engine_for(&reopened, "b");
    assert!(!engine.ledger().is_applied("B", "u1").await.unwrap());
}

#[tokio::test]
async fn test_legacy_duplicates_block_unique_index() {
    let store = InMemoryStorage::new();
    for _ in 0..2 {
        store
            .insert_one(
                CHANGELOG_COLLECTION,
                Document::new().with("changeId", "A").with("author", "u1"),
            )
            .await
            .unwrap();
    }
    store
        .create_index(CHANGELOG_COLLECTION, IndexSpec::ascending(&["changeId", "author"]))
        .await
        .unwrap();

    let engine = engine_for(&store, "a");
    let counter = Arc::new(AtomicUsize::new(0));
    let report = engine.run(&[counting_unit("B", &counter)]).await;

    assert_eq!(report.status, RunStatus::Failed);
    let error = report.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Storage);
    assert!(error.change_id.is_none());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert!(!engine.lock_store().is_held().await.unwrap());
}
