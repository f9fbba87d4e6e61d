use super::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ID_FIELD: &str = "_id";

/// A schemaless document: an ordered map of field name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Missing fields read as `Null`, which is how indexes key them.
    pub fn get_or_null(&self, field: &str) -> Value {
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Conjunction of field equality predicates. An empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    predicates: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.predicates
            .iter()
            .all(|(field, expected)| &doc.get_or_null(field) == expected)
    }
}

/// A `$set`-style update: each field is overwritten with the given value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    assignments: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push((field.into(), value.into()));
        self
    }

    /// Applies the assignments, returning whether anything changed.
    pub fn apply(&self, doc: &mut Document) -> bool {
        let mut changed = false;
        for (field, value) in &self.assignments {
            if doc.get(field) != Some(value) {
                doc.set(field.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Outcome of a single-document update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Index definition over one or more ascending/descending fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<(String, i32)>,
    pub unique: bool,
}

impl IndexSpec {
    /// Builds a spec whose name follows the `field_dir` convention,
    /// e.g. `changeId_1_author_1`.
    pub fn new(keys: Vec<(String, i32)>) -> Self {
        let name = keys
            .iter()
            .map(|(field, dir)| format!("{}_{}", field, dir))
            .collect::<Vec<_>>()
            .join("_");
        Self {
            name,
            keys,
            unique: false,
        }
    }

    pub fn ascending(fields: &[&str]) -> Self {
        Self::new(fields.iter().map(|f| (f.to_string(), 1)).collect())
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(field, _)| field.as_str())
    }

    pub fn same_keys(&self, other: &IndexSpec) -> bool {
        self.keys == other.keys
    }

    /// Compound key of `doc` under this index.
    pub fn key_of(&self, doc: &Document) -> Vec<Value> {
        self.fields().map(|field| doc.get_or_null(field)).collect()
    }
}
