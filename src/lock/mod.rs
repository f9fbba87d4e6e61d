//! Cross-process migration lock backed by a single document.

use crate::core::{Document, Filter, IndexSpec, Result, Update, Value};
use crate::storage::DocumentStore;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

pub const LOCK_KEY: &str = "LOCK";

const KEY_FIELD: &str = "key";
const STATUS_FIELD: &str = "status";
const OWNER_FIELD: &str = "owner";
const ACQUIRED_AT_FIELD: &str = "acquiredAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "LOCK_HELD",
            Self::Unlocked => "LOCK_RELEASED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "LOCK_HELD" => Some(Self::Locked),
            "LOCK_RELEASED" => Some(Self::Unlocked),
            _ => None,
        }
    }
}

/// Decoded view of the lock document. `owner` and `acquired_at` are
/// informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub key: String,
    pub state: LockState,
    pub owner: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    fn from_document(doc: &Document) -> Option<Self> {
        Some(Self {
            key: doc.get_str(KEY_FIELD)?.to_string(),
            state: LockState::parse(doc.get_str(STATUS_FIELD)?)?,
            owner: doc.get_str(OWNER_FIELD).map(str::to_string),
            acquired_at: doc.get(ACQUIRED_AT_FIELD).and_then(Value::as_timestamp),
        })
    }
}

/// Try-once mutex over a singleton document.
///
/// Acquire is a conditional write; release is unconditional, so any process
/// can clear a lock left behind by a crashed holder. The price is that a
/// process can also release a lock it never held.
pub struct LockStore {
    store: Arc<dyn DocumentStore>,
    collection: String,
    owner: String,
}

impl LockStore {
    pub fn new(store: Arc<dyn DocumentStore>, collection: &str, owner: &str) -> Self {
        Self {
            store,
            collection: collection.to_string(),
            owner: owner.to_string(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Create the unlocked singleton if it is missing. Safe to race: the
    /// unique index on `key` lets exactly one insert win.
    pub async fn initialize(&self) -> Result<()> {
        self.store
            .create_index(&self.collection, IndexSpec::ascending(&[KEY_FIELD]).unique())
            .await?;

        let existing = self.store.count(&self.collection, &key_filter()).await?;
        if existing > 0 {
            return Ok(());
        }

        let doc = Document::new()
            .with(KEY_FIELD, LOCK_KEY)
            .with(STATUS_FIELD, LockState::Unlocked.as_str());

        match self.store.insert_one(&self.collection, doc).await {
            Ok(_) => {
                debug!("Initialized lock document in '{}'", self.collection);
                Ok(())
            }
            Err(err) if err.is_duplicate_key() => {
                debug!("Lock document in '{}' created concurrently", self.collection);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Single atomic compare-and-set from unlocked to locked.
    ///
    /// Returns `false` when the lock is held by anyone (this process included)
    /// or the lock document does not exist yet.
    pub async fn acquire(&self) -> Result<bool> {
        let filter = key_filter().eq(STATUS_FIELD, LockState::Unlocked.as_str());
        let update = Update::new()
            .set(STATUS_FIELD, LockState::Locked.as_str())
            .set(OWNER_FIELD, self.owner.as_str())
            .set(ACQUIRED_AT_FIELD, Utc::now());

        let result = self.store.update_one(&self.collection, &filter, &update).await?;
        let acquired = result.modified_count == 1;
        if acquired {
            info!("Migration lock acquired by '{}'", self.owner);
        } else {
            debug!("Migration lock not acquired by '{}'", self.owner);
        }
        Ok(acquired)
    }

    /// Unconditionally mark the lock released. Idempotent.
    pub async fn release(&self) -> Result<()> {
        let update = Update::new().set(STATUS_FIELD, LockState::Unlocked.as_str());
        self.store.update_one(&self.collection, &key_filter(), &update).await?;
        info!("Migration lock released by '{}'", self.owner);
        Ok(())
    }

    /// Advisory read. Never gate `acquire` or `release` on this.
    pub async fn is_held(&self) -> Result<bool> {
        Ok(self
            .current()
            .await?
            .is_some_and(|record| record.state == LockState::Locked))
    }

    pub async fn current(&self) -> Result<Option<LockRecord>> {
        let doc = self.store.find_one(&self.collection, &key_filter()).await?;
        Ok(doc.as_ref().and_then(LockRecord::from_document))
    }

    /// Acquire and wrap the lock in a guard, or `None` if someone holds it.
    ///
    /// An acquire that errors may still have applied its write (a failed
    /// checkpoint, for one). If the lock now names this owner it is released
    /// before the error is returned.
    pub async fn try_lock(self: &Arc<Self>) -> Result<Option<LockGuard>> {
        match self.acquire().await {
            Ok(true) => Ok(Some(LockGuard {
                lock: Some(Arc::clone(self)),
            })),
            Ok(false) => Ok(None),
            Err(err) => {
                self.release_if_owned().await;
                Err(err)
            }
        }
    }

    async fn release_if_owned(&self) {
        let owned = match self.current().await {
            Ok(Some(record)) => {
                record.state == LockState::Locked && record.owner.as_deref() == Some(self.owner.as_str())
            }
            _ => false,
        };
        if owned {
            warn!("Acquire by '{}' failed after taking the lock, releasing", self.owner);
            if let Err(err) = self.release().await {
                warn!("release after failed acquire failed: error='{}'", err);
            }
        }
    }
}

fn key_filter() -> Filter {
    Filter::new().eq(KEY_FIELD, LOCK_KEY)
}

/// Held migration lock.
///
/// Call `release` on the way out. A guard dropped without it (panic, early
/// return, a cancelled future) schedules the release on the current tokio
/// runtime instead.
pub struct LockGuard {
    lock: Option<Arc<LockStore>>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.lock.is_some())
            .finish()
    }
}

impl LockGuard {
    pub async fn release(mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => lock.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        warn!("Migration lock guard dropped without release, releasing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = lock.release().await {
                        warn!("background lock release failed: error='{}'", err);
                    }
                });
            }
            Err(_) => {
                warn!("no tokio runtime available, lock in '{}' left held", lock.collection);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DbError;
    use crate::storage::{DurabilityMode, InMemoryStorage, SnapshotManager};

    fn lock_store(store: &InMemoryStorage, owner: &str) -> LockStore {
        LockStore::new(Arc::new(store.clone()), "mongobeelock", owner)
    }

    #[tokio::test]
    async fn test_acquire_before_initialize_fails() {
        let store = InMemoryStorage::new();
        let lock = lock_store(&store, "a");
        assert!(!lock.acquire().await.unwrap());
        assert!(lock.current().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = InMemoryStorage::new();
        let lock = lock_store(&store, "a");
        lock.initialize().await.unwrap();
        lock.initialize().await.unwrap();

        assert_eq!(store.count("mongobeelock", &Filter::new()).await.unwrap(), 1);
        let record = lock.current().await.unwrap().unwrap();
        assert_eq!(record.key, LOCK_KEY);
        assert_eq!(record.state, LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_initialize_does_not_reset_held_lock() {
        let store = InMemoryStorage::new();
        let lock = lock_store(&store, "a");
        lock.initialize().await.unwrap();
        assert!(lock.acquire().await.unwrap());

        lock.initialize().await.unwrap();
        assert!(lock.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_records_owner() {
        let store = InMemoryStorage::new();
        let lock = lock_store(&store, "host-a");
        lock.initialize().await.unwrap();
        assert!(lock.acquire().await.unwrap());

        let record = lock.current().await.unwrap().unwrap();
        assert_eq!(record.state, LockState::Locked);
        assert_eq!(record.owner.as_deref(), Some("host-a"));
        assert!(record.acquired_at.is_some());
    }

    #[tokio::test]
    async fn test_guard_release() {
        let store = InMemoryStorage::new();
        let lock = Arc::new(lock_store(&store, "a"));
        lock.initialize().await.unwrap();

        let guard = lock.try_lock().await.unwrap().unwrap();
        assert!(lock.try_lock().await.unwrap().is_none());
        guard.release().await.unwrap();
        assert!(!lock.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let store = InMemoryStorage::new();
        let lock = Arc::new(lock_store(&store, "a"));
        lock.initialize().await.unwrap();

        let guard = lock.try_lock().await.unwrap().unwrap();
        drop(guard);

        // Let the spawned release run
        for _ in 0..10 {
            tokio::task::yield_now().await;
            if !lock.is_held().await.unwrap() {
                break;
            }
        }
        assert!(!lock.is_held().await.unwrap());
    }

    #[test]
    fn test_guard_dropped_outside_runtime_stays_held() {
        let store = InMemoryStorage::new();
        let lock = Arc::new(lock_store(&store, "a"));

        let guard = tokio_test::block_on(async {
            lock.initialize().await.unwrap();
            lock.try_lock().await.unwrap().unwrap()
        });
        drop(guard);

        // Nothing could schedule the release; the next run has to clear it.
        assert!(tokio_test::block_on(lock.is_held()).unwrap());
        tokio_test::block_on(lock.release()).unwrap();
        assert!(!tokio_test::block_on(lock.is_held()).unwrap());
    }

    #[tokio::test]
    async fn test_failed_acquire_does_not_leave_lock_held() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = InMemoryStorage::open(dir.path(), DurabilityMode::Sync).unwrap();
        let lock = Arc::new(lock_store(&store, "a"));
        lock.initialize().await.unwrap();

        let blocker = SnapshotManager::in_dir(dir.path()).path().with_extension("tmp");
        std::fs::create_dir(&blocker).unwrap();

        let err = lock.try_lock().await.unwrap_err();
        assert!(matches!(err, DbError::IoError(_)));
        assert!(!lock.is_held().await.unwrap());

        std::fs::remove_dir(&blocker).unwrap();
        let guard = lock.try_lock().await.unwrap().unwrap();
        guard.release().await.unwrap();
    }
}
