use crate::core::{Document, Filter, IndexSpec, Result, Update, UpdateResult};
use async_trait::async_trait;

/// Document store trait - the database handle the migration core runs against.
///
/// Collections spring into existence on first write; reads against a missing
/// collection see it as empty. Every single-document write is atomic with
/// respect to every other operation on the same collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a document, returning its `_id`.
    ///
    /// Fails with `DbError::DuplicateKey` when a unique index already holds the
    /// document's key.
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String>;

    /// Apply `update` to the first document matching `filter`.
    ///
    /// Match and modification happen under one write lock, so a filter on the
    /// current state turns this into an atomic compare-and-set.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateResult>;

    /// First document matching `filter`, in insertion order.
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>>;

    /// Count documents matching `filter`.
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// All index definitions on the collection, including the implicit `_id_`.
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>>;

    /// Create an index. Re-creating an identical index is a no-op.
    async fn create_index(&self, collection: &str, spec: IndexSpec) -> Result<()>;

    /// Drop an index by name.
    async fn drop_index(&self, collection: &str, name: &str) -> Result<()>;
}
