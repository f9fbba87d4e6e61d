use crate::core::{DbError, Document, Filter, ID_FIELD, IndexSpec, Result, Update, UpdateResult, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const ID_INDEX_NAME: &str = "_id_";

/// Secondary index. Entries are derived state and rebuilt after a restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    spec: IndexSpec,
    #[serde(skip)]
    entries: BTreeMap<Vec<Value>, Vec<u64>>,
}

impl Index {
    fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            entries: BTreeMap::new(),
        }
    }

    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    fn add(&mut self, id: u64, doc: &Document) {
        self.entries.entry(self.spec.key_of(doc)).or_default().push(id);
    }

    fn remove(&mut self, id: u64, doc: &Document) {
        let key = self.spec.key_of(doc);
        if let Some(ids) = self.entries.get_mut(&key) {
            ids.retain(|&x| x != id);
            if ids.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Another document already owning `doc`'s key, if this index is unique.
    fn conflict(&self, doc: &Document, ignore_id: Option<u64>) -> Option<Vec<Value>> {
        if !self.spec.unique {
            return None;
        }
        let key = self.spec.key_of(doc);
        let taken = self
            .entries
            .get(&key)
            .is_some_and(|ids| ids.iter().any(|id| Some(*id) != ignore_id));
        taken.then_some(key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    name: String,
    documents: BTreeMap<u64, Document>,
    next_doc_id: u64,
    indexes: Vec<Index>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        let id_index = IndexSpec::new(vec![(ID_FIELD.to_string(), 1)])
            .named(ID_INDEX_NAME)
            .unique();
        Self {
            name: name.into(),
            documents: BTreeMap::new(),
            next_doc_id: 0,
            indexes: vec![Index::new(id_index)],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn insert(&mut self, mut doc: Document) -> Result<String> {
        if !doc.contains(ID_FIELD) {
            doc.set(ID_FIELD, Uuid::new_v4().to_string());
        }
        self.check_uniqueness(&doc, None)?;

        let id = self.next_doc_id;
        self.next_doc_id += 1;

        for index in &mut self.indexes {
            index.add(id, &doc);
        }
        let doc_id = match doc.get(ID_FIELD) {
            Some(Value::Text(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        self.documents.insert(id, doc);
        Ok(doc_id)
    }

    pub fn update_one(&mut self, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let Some((id, current)) = self
            .documents
            .iter()
            .find(|(_, doc)| filter.matches(doc))
            .map(|(id, doc)| (*id, doc.clone()))
        else {
            return Ok(UpdateResult::default());
        };

        let mut updated = current.clone();
        if !update.apply(&mut updated) {
            return Ok(UpdateResult {
                matched_count: 1,
                modified_count: 0,
            });
        }
        if updated.get(ID_FIELD) != current.get(ID_FIELD) {
            return Err(DbError::ExecutionError(format!(
                "Cannot modify immutable field '{}' in collection '{}'",
                ID_FIELD, self.name
            )));
        }
        self.check_uniqueness(&updated, Some(id))?;

        for index in &mut self.indexes {
            index.remove(id, &current);
            index.add(id, &updated);
        }
        self.documents.insert(id, updated);

        Ok(UpdateResult {
            matched_count: 1,
            modified_count: 1,
        })
    }

    pub fn find_one(&self, filter: &Filter) -> Option<Document> {
        self.documents.values().find(|doc| filter.matches(doc)).cloned()
    }

    pub fn count(&self, filter: &Filter) -> u64 {
        self.documents.values().filter(|doc| filter.matches(doc)).count() as u64
    }

    pub fn index_specs(&self) -> Vec<IndexSpec> {
        self.indexes.iter().map(|index| index.spec.clone()).collect()
    }

    /// Returns `false` when an identical index already exists.
    pub fn create_index(&mut self, spec: IndexSpec) -> Result<bool> {
        if let Some(existing) = self
            .indexes
            .iter()
            .find(|index| index.spec.name == spec.name || index.spec.same_keys(&spec))
        {
            if existing.spec.same_keys(&spec) && existing.spec.unique == spec.unique {
                return Ok(false);
            }
            return Err(DbError::IndexExists(spec.name, self.name.clone()));
        }

        let mut index = Index::new(spec);
        for (id, doc) in &self.documents {
            if let Some(key) = index.conflict(doc, None) {
                return Err(self.duplicate_key(&index.spec.name, &key));
            }
            index.add(*id, doc);
        }
        self.indexes.push(index);
        Ok(true)
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        if name == ID_INDEX_NAME {
            return Err(DbError::ExecutionError(format!(
                "Cannot drop index '{}' in collection '{}'",
                ID_INDEX_NAME, self.name
            )));
        }
        let before = self.indexes.len();
        self.indexes.retain(|index| index.spec.name != name);
        if self.indexes.len() == before {
            return Err(DbError::IndexNotFound(name.to_string(), self.name.clone()));
        }
        Ok(())
    }

    /// Repopulate index entries from documents after deserialization.
    pub fn rebuild_indexes(&mut self) {
        for index in &mut self.indexes {
            index.entries.clear();
            for (id, doc) in &self.documents {
                index.add(*id, doc);
            }
        }
    }

    fn check_uniqueness(&self, doc: &Document, ignore_id: Option<u64>) -> Result<()> {
        for index in &self.indexes {
            if let Some(key) = index.conflict(doc, ignore_id) {
                return Err(self.duplicate_key(&index.spec.name, &key));
            }
        }
        Ok(())
    }

    fn duplicate_key(&self, index: &str, key: &[Value]) -> DbError {
        let key = key.iter().map(Value::to_string).collect::<Vec<_>>().join(", ");
        DbError::DuplicateKey {
            collection: self.name.clone(),
            index: index.to_string(),
            key: format!("({})", key),
        }
    }
}
