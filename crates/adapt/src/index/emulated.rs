// crates/adapt/src/index/emulated.rs
//
// Core-maintained secondary index: canonical value → set of primary keys.

use crate::mql::IndexConstraint;
use domain::value::index_key;
use domain::{Document, FieldPath, Key};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

/// Lookup structure for one field path.
///
/// `by_value` buckets keys by the canonical form of the whole value (used by
/// equality and `$in`); `by_element` buckets keys of array-valued documents
/// by each element (used by containment). Absent and null values are not
/// indexed, so neither bucket ever answers a null lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmulatedIndex {
    by_value: BTreeMap<String, BTreeSet<Key>>,
    by_element: BTreeMap<String, BTreeSet<Key>>,
    values: BTreeMap<Key, Json>,
}

impl EmulatedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a full scan of the collection.
    pub fn build<'a>(path: &FieldPath, docs: impl IntoIterator<Item = &'a Document>) -> Self {
        let mut index = Self::new();
        for doc in docs {
            index.put(path, doc);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Index (or re-index) `doc` under its key. Documents without a key are
    /// ignored.
    pub fn put(&mut self, path: &FieldPath, doc: &Document) {
        let Some(key) = doc.key() else {
            return;
        };
        self.remove(key);
        match doc.lookup(path.as_str()) {
            None | Some(Json::Null) => {}
            Some(value) => self.insert_value(key.clone(), value.clone()),
        }
    }

    fn insert_value(&mut self, key: Key, value: Json) {
        self.by_value
            .entry(index_key(&value))
            .or_default()
            .insert(key.clone());
        if let Json::Array(items) = &value {
            for item in items {
                self.by_element
                    .entry(index_key(item))
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.values.insert(key, value);
    }

    pub fn remove(&mut self, key: &Key) {
        let Some(old) = self.values.remove(key) else {
            return;
        };
        detach(&mut self.by_value, &index_key(&old), key);
        if let Json::Array(items) = &old {
            for item in items {
                detach(&mut self.by_element, &index_key(item), key);
            }
        }
    }

    /// Candidate keys for `constraint`. Candidates are a superset only when
    /// the index has drifted; callers re-check each fetched document.
    pub fn lookup(&self, constraint: &IndexConstraint) -> BTreeSet<Key> {
        match constraint {
            IndexConstraint::Eq { value, .. } => bucket(&self.by_value, value),
            IndexConstraint::In { values, .. } => values
                .iter()
                .flat_map(|v| bucket(&self.by_value, v))
                .collect(),
            IndexConstraint::Contains { value, .. } => bucket(&self.by_element, value),
        }
    }

    /// Another key already holding `value`, if any (unique enforcement).
    pub fn conflict(&self, key: &Key, value: Option<&Json>) -> Option<&Key> {
        match value {
            None | Some(Json::Null) => None,
            Some(v) => self
                .by_value
                .get(&index_key(v))
                .and_then(|keys| keys.iter().find(|k| *k != key)),
        }
    }

    /// Serialized mapping: canonical value → keys.
    pub fn entries(&self) -> &BTreeMap<String, BTreeSet<Key>> {
        &self.by_value
    }

    /// Whether every keyed document in `docs` is indexed under its current
    /// value and nothing else is.
    pub fn agrees_with<'a>(&self, path: &FieldPath, docs: impl IntoIterator<Item = &'a Document>) -> bool {
        let mut indexed = 0;
        for doc in docs {
            let Some(key) = doc.key() else {
                continue;
            };
            match (doc.lookup(path.as_str()), self.values.get(key)) {
                (None | Some(Json::Null), None) => {}
                (Some(value), Some(held)) if index_key(value) == index_key(held) => indexed += 1,
                _ => return false,
            }
        }
        indexed == self.values.len()
    }

    /// Rebuild from a persisted `entries()` mapping.
    pub fn from_entries(entries: BTreeMap<String, BTreeSet<Key>>) -> Result<Self, serde_json::Error> {
        let mut index = Self::new();
        for (canonical, keys) in entries {
            let value: Json = serde_json::from_str(&canonical)?;
            for key in keys {
                index.insert_value(key, value.clone());
            }
        }
        Ok(index)
    }
}

fn bucket(map: &BTreeMap<String, BTreeSet<Key>>, value: &Json) -> BTreeSet<Key> {
    map.get(&index_key(value)).cloned().unwrap_or_default()
}

fn detach(map: &mut BTreeMap<String, BTreeSet<Key>>, bucket: &str, key: &Key) {
    if let Some(keys) = map.get_mut(bucket) {
        keys.remove(key);
        if keys.is_empty() {
            map.remove(bucket);
        }
    }
}
