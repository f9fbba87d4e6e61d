//! Ledger of applied change units.
//!
//! Idempotency is detect-after-run: `is_applied` is a cheap optimistic check,
//! and the unique index on `(changeId, author)` is what actually rejects a
//! second record when two runners race past that check.

use crate::core::{DbError, Document, Filter, IndexSpec, Result, Value};
use crate::storage::DocumentStore;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

pub const KEY_CHANGE_ID: &str = "changeId";
pub const KEY_AUTHOR: &str = "author";
pub const KEY_TIMESTAMP: &str = "timestamp";
pub const KEY_CHANGELOG_CLASS: &str = "changeLogClass";
pub const KEY_CHANGESET_METHOD: &str = "changeSetMethod";
pub const KEY_DURATION_MILLIS: &str = "durationMillis";

/// One applied change unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub change_id: String,
    pub author: String,
    pub executed_at: DateTime<Utc>,
    /// Source artifact of the change unit, for audit only.
    pub change_log_class: String,
    /// Operation inside the source artifact, for audit only.
    pub change_set_method: String,
    pub duration_millis: i64,
}

impl ChangeRecord {
    pub fn new(change_id: &str, author: &str) -> Self {
        Self {
            change_id: change_id.to_string(),
            author: author.to_string(),
            executed_at: Utc::now(),
            change_log_class: String::new(),
            change_set_method: String::new(),
            duration_millis: 0,
        }
    }

    pub fn with_source(mut self, change_log_class: &str, change_set_method: &str) -> Self {
        self.change_log_class = change_log_class.to_string();
        self.change_set_method = change_set_method.to_string();
        self
    }

    pub fn with_duration_millis(mut self, millis: i64) -> Self {
        self.duration_millis = millis;
        self
    }

    pub fn to_document(&self) -> Document {
        Document::new()
            .with(KEY_CHANGE_ID, self.change_id.as_str())
            .with(KEY_AUTHOR, self.author.as_str())
            .with(KEY_TIMESTAMP, self.executed_at)
            .with(KEY_CHANGELOG_CLASS, self.change_log_class.as_str())
            .with(KEY_CHANGESET_METHOD, self.change_set_method.as_str())
            .with(KEY_DURATION_MILLIS, self.duration_millis)
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        let text = |field: &str| -> Result<String> {
            doc.get_str(field).map(str::to_string).ok_or_else(|| {
                DbError::TypeMismatch(format!("ledger field '{}' is missing or not text", field))
            })
        };

        Ok(Self {
            change_id: text(KEY_CHANGE_ID)?,
            author: text(KEY_AUTHOR)?,
            executed_at: doc
                .get(KEY_TIMESTAMP)
                .and_then(Value::as_timestamp)
                .ok_or_else(|| DbError::TypeMismatch(format!("ledger field '{}' is not a timestamp", KEY_TIMESTAMP)))?,
            change_log_class: doc.get_str(KEY_CHANGELOG_CLASS).unwrap_or_default().to_string(),
            change_set_method: doc.get_str(KEY_CHANGESET_METHOD).unwrap_or_default().to_string(),
            duration_millis: doc.get(KEY_DURATION_MILLIS).and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

/// Result of `LedgerStore::record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// The unique index already held this `(changeId, author)`; another runner
    /// recorded it first.
    AlreadyRecorded,
}

pub struct LedgerStore {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl LedgerStore {
    pub fn new(store: Arc<dyn DocumentStore>, collection: &str) -> Self {
        Self {
            store,
            collection: collection.to_string(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn unique_index_spec() -> IndexSpec {
        IndexSpec::ascending(&[KEY_CHANGE_ID, KEY_AUTHOR]).unique()
    }

    /// Make sure `(changeId, author)` is covered by a unique index, replacing a
    /// legacy non-unique index with the same key shape.
    ///
    /// Concurrent runners may interleave here; a drop that finds the index
    /// already gone and a create that finds it already present are both fine.
    pub async fn ensure_uniqueness_constraint(&self) -> Result<()> {
        let wanted = Self::unique_index_spec();
        let existing = self
            .store
            .list_indexes(&self.collection)
            .await?
            .into_iter()
            .find(|index| index.same_keys(&wanted) || index.name == wanted.name);

        match existing {
            Some(index) if self.is_unique(&index) && index.same_keys(&wanted) => {
                debug!("Unique index '{}' already present on '{}'", index.name, self.collection);
                return Ok(());
            }
            Some(index) => {
                warn!(
                    "Replacing non-unique index '{}' on '{}' with a unique one",
                    index.name, self.collection
                );
                self.drop_index(&index.name).await?;
            }
            None => {}
        }

        match self.store.create_index(&self.collection, wanted.clone()).await {
            Ok(()) => {
                info!("Created unique index '{}' on '{}'", wanted.name, self.collection);
                Ok(())
            }
            Err(DbError::IndexExists(..)) => {
                // Another runner won the race; accept only if what it built is unique.
                match self.find_index(&wanted.name).await? {
                    Some(index) if self.is_unique(&index) => Ok(()),
                    _ => Err(DbError::IndexExists(wanted.name, self.collection.clone())),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn find_index(&self, name: &str) -> Result<Option<IndexSpec>> {
        Ok(self
            .store
            .list_indexes(&self.collection)
            .await?
            .into_iter()
            .find(|index| index.name == name))
    }

    pub fn is_unique(&self, index: &IndexSpec) -> bool {
        index.unique
    }

    /// Drop an index, treating an already-missing index as dropped.
    pub async fn drop_index(&self, name: &str) -> Result<()> {
        match self.store.drop_index(&self.collection, name).await {
            Ok(()) | Err(DbError::IndexNotFound(..)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn is_applied(&self, change_id: &str, author: &str) -> Result<bool> {
        let count = self
            .store
            .count(&self.collection, &entry_filter(change_id, author))
            .await?;
        Ok(count > 0)
    }

    pub async fn find(&self, change_id: &str, author: &str) -> Result<Option<ChangeRecord>> {
        self.store
            .find_one(&self.collection, &entry_filter(change_id, author))
            .await?
            .as_ref()
            .map(ChangeRecord::from_document)
            .transpose()
    }

    pub async fn count(&self) -> Result<u64> {
        self.store.count(&self.collection, &Filter::new()).await
    }

    /// Insert a record; a unique-index rejection means another runner already
    /// recorded the same change unit and is not an error.
    pub async fn record(&self, record: &ChangeRecord) -> Result<RecordOutcome> {
        match self.store.insert_one(&self.collection, record.to_document()).await {
            Ok(_) => {
                debug!("Recorded change '{}' by '{}'", record.change_id, record.author);
                Ok(RecordOutcome::Inserted)
            }
            Err(err) if err.is_duplicate_key() => {
                info!(
                    "Change '{}' by '{}' was already recorded by another runner",
                    record.change_id, record.author
                );
                Ok(RecordOutcome::AlreadyRecorded)
            }
            Err(err) => Err(err),
        }
    }
}

fn entry_filter(change_id: &str, author: &str) -> Filter {
    Filter::new().eq(KEY_CHANGE_ID, change_id).eq(KEY_AUTHOR, author)
}
