/// Shared test doubles for integration tests

use async_trait::async_trait;
use changebee::{DbError, Document, DocumentStore, Filter, IndexSpec, InMemoryStorage, Result, Update};
use changebee::core::UpdateResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Wraps an `InMemoryStorage`, counting reads of one collection and optionally
/// failing inserts into it with a non-duplicate error.
pub struct InstrumentedStore {
    inner: InMemoryStorage,
    watched: String,
    reads: AtomicUsize,
    fail_inserts: AtomicBool,
}

#[allow(dead_code)]
impl InstrumentedStore {
    pub fn new(inner: InMemoryStorage, watched: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            watched: watched.to_string(),
            reads: AtomicUsize::new(0),
            fail_inserts: AtomicBool::new(false),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    fn note_read(&self, collection: &str) {
        if collection == self.watched {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl DocumentStore for InstrumentedStore {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String> {
        if collection == self.watched && self.fail_inserts.load(Ordering::SeqCst) {
            return Err(DbError::ExecutionError("disk full".to_string()));
        }
        self.inner.insert_one(collection, doc).await
    }

    async fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        self.inner.update_one(collection, filter, update).await
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        self.note_read(collection);
        self.inner.find_one(collection, filter).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.note_read(collection);
        self.inner.count(collection, filter).await
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        self.inner.list_indexes(collection).await
    }

    async fn create_index(&self, collection: &str, spec: IndexSpec) -> Result<()> {
        self.inner.create_index(collection, spec).await
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        self.inner.drop_index(collection, name).await
    }
}
