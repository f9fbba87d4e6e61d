use super::collection::Collection;
use super::engine::DocumentStore;
use super::persistence::{DurabilityMode, SnapshotManager, StoreSnapshot};
use crate::core::{DbError, Document, Filter, IndexSpec, Result, Update, UpdateResult};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

/// In-process document database.
///
/// Each collection sits behind its own lock; the collection map itself is only
/// locked to look up or create handles. Cloning the store hands out another
/// handle to the same data, which is how tests model several processes
/// sharing one server.
#[derive(Clone)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
}

struct Inner {
    collections: RwLock<HashMap<String, Arc<RwLock<Collection>>>>,
    available: AtomicBool,
    persistence: Option<Mutex<SnapshotManager>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::from_parts(HashMap::new(), None)
    }

    /// Open a store backed by a snapshot in `data_dir`, recovering existing
    /// data. With `DurabilityMode::None` nothing is read or written.
    pub fn open<P: AsRef<Path>>(data_dir: P, mode: DurabilityMode) -> Result<Self> {
        if mode == DurabilityMode::None {
            return Ok(Self::new());
        }

        let manager = SnapshotManager::in_dir(data_dir);
        let collections = match manager.load()? {
            Some(snapshot) => {
                debug!(
                    "Recovered {} collections ({} documents) from {}",
                    snapshot.metadata.collection_count,
                    snapshot.metadata.document_count,
                    manager.path().display()
                );
                snapshot.collections
            }
            None => HashMap::new(),
        };

        Ok(Self::from_parts(collections, Some(manager)))
    }

    fn from_parts(collections: HashMap<String, Collection>, persistence: Option<SnapshotManager>) -> Self {
        let collections = collections
            .into_iter()
            .map(|(name, coll)| (name, Arc::new(RwLock::new(coll))))
            .collect();

        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(collections),
                available: AtomicBool::new(true),
                persistence: persistence.map(Mutex::new),
            }),
        }
    }

    /// Simulate losing (`false`) or regaining (`true`) the connection.
    /// While unavailable every operation fails with `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    pub async fn list_collections(&self) -> Vec<String> {
        self.inner.collections.read().await.keys().cloned().collect()
    }

    /// Write the whole store to its snapshot file, if persistence is configured.
    pub async fn checkpoint(&self) -> Result<()> {
        let Some(persistence) = &self.inner.persistence else {
            return Ok(());
        };
        // Holding the manager lock serializes checkpoints so an older copy never
        // overwrites a newer one.
        let manager = persistence.lock().await;

        let handles: Vec<(String, Arc<RwLock<Collection>>)> = self
            .inner
            .collections
            .read()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
            .collect();

        let mut collections = HashMap::with_capacity(handles.len());
        for (name, handle) in handles {
            collections.insert(name, handle.read().await.clone());
        }

        manager.save(&StoreSnapshot::new(collections))
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(DbError::StorageUnavailable("connection to document store lost".to_string()))
        }
    }

    async fn get_collection(&self, name: &str) -> Option<Arc<RwLock<Collection>>> {
        self.inner.collections.read().await.get(name).cloned()
    }

    async fn get_or_create_collection(&self, name: &str) -> Arc<RwLock<Collection>> {
        if let Some(handle) = self.get_collection(name).await {
            return handle;
        }
        let mut collections = self.inner.collections.write().await;
        Arc::clone(
            collections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(Collection::new(name)))),
        )
    }

    /// Checkpoint after a mutation. The change is already visible in memory;
    /// an error here means it is not on disk, and the caller must not treat
    /// the write as durable.
    async fn after_write(&self) -> Result<()> {
        self.checkpoint().await.map_err(|err| {
            warn!("snapshot checkpoint failed: error='{}'", err);
            match err {
                DbError::IoError(_) => err,
                other => DbError::IoError(other.to_string()),
            }
        })
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStorage {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String> {
        self.ensure_available()?;
        let handle = self.get_or_create_collection(collection).await;
        let id = handle.write().await.insert(doc)?;
        self.after_write().await?;
        Ok(id)
    }

    async fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        self.ensure_available()?;
        let Some(handle) = self.get_collection(collection).await else {
            return Ok(UpdateResult::default());
        };
        let result = handle.write().await.update_one(filter, update)?;
        if result.modified_count > 0 {
            self.after_write().await?;
        }
        Ok(result)
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        self.ensure_available()?;
        match self.get_collection(collection).await {
            Some(handle) => Ok(handle.read().await.find_one(filter)),
            None => Ok(None),
        }
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.ensure_available()?;
        match self.get_collection(collection).await {
            Some(handle) => Ok(handle.read().await.count(filter)),
            None => Ok(0),
        }
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        self.ensure_available()?;
        match self.get_collection(collection).await {
            Some(handle) => Ok(handle.read().await.index_specs()),
            None => Ok(Vec::new()),
        }
    }

    async fn create_index(&self, collection: &str, spec: IndexSpec) -> Result<()> {
        self.ensure_available()?;
        let handle = self.get_or_create_collection(collection).await;
        if handle.write().await.create_index(spec)? {
            self.after_write().await?;
        }
        Ok(())
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        self.ensure_available()?;
        let Some(handle) = self.get_collection(collection).await else {
            return Err(DbError::IndexNotFound(name.to_string(), collection.to_string()));
        };
        handle.write().await.drop_index(name)?;
        self.after_write().await
    }
}
