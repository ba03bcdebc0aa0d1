//! MongoDB adapter over the synchronous `MongoExec` port. Documents are
//! stored with the key in `_id` and the revision in `_rev`; filters arrive
//! already compiled to Mongo query documents. Index definitions live in the
//! `__blitzdb_indexes` collection.

use super::{check_key, expect_target, key_for, BackendAdapter, BackendKind, Cursor, Delegation};
use crate::mql::mongo::{ID, REV};
use crate::mql::{CompiledQuery, MongoFind, NativeQuery};
use crate::{Error, Result};
use domain::{Document, FieldPath, IndexDefinition, Key};
use serde_json::{json, Map, Value as Json};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Port / trait: the driver crate implements this.
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MongoExecError {
    #[error("mongo unavailable: {0}")]
    Unavailable(String),
    /// Duplicate key (code 11000) on the named index; `_id_` is the primary key.
    #[error("duplicate key on index {index}")]
    DuplicateKey { index: String },
    #[error("mongo command failed: {0}")]
    Command(String),
}

/// Name Mongo gives the primary-key index.
pub const PRIMARY_INDEX: &str = "_id_";

pub trait MongoExec: Send {
    fn insert_one(&mut self, collection: &str, doc: Json) -> Result<(), MongoExecError>;

    /// Replace the document with `_id == key`; returns the matched count.
    fn replace_one(&mut self, collection: &str, key: &str, doc: Json) -> Result<u64, MongoExecError>;

    /// Returns the deleted count.
    fn delete_one(&mut self, collection: &str, key: &str) -> Result<u64, MongoExecError>;

    fn find(&mut self, collection: &str, find: &MongoFind) -> Result<Vec<Json>, MongoExecError>;

    fn count(&mut self, collection: &str, filter: &Json) -> Result<u64, MongoExecError>;

    /// Plain ascending index; uniqueness is checked by the store.
    fn create_index(&mut self, collection: &str, name: &str, path: &str) -> Result<(), MongoExecError>;

    fn drop_index(&mut self, collection: &str, name: &str) -> Result<(), MongoExecError>;

    fn drop_collection(&mut self, collection: &str) -> Result<(), MongoExecError>;

    fn close(&mut self) -> Result<(), MongoExecError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Document mapping
// ─────────────────────────────────────────────────────────────────────────────

fn to_stored(key: &Key, revision: u64, fields: &Map<String, Json>) -> Json {
    let mut out = Map::with_capacity(fields.len() + 2);
    out.insert(ID.to_string(), Json::from(key.as_str()));
    out.insert(REV.to_string(), Json::from(revision));
    for (k, v) in fields {
        out.insert(k.clone(), v.clone());
    }
    Json::Object(out)
}

fn from_stored(collection: &str, stored: Json) -> Result<Document> {
    let Json::Object(mut fields) = stored else {
        return Err(Error::backend("mongo returned a non-document"));
    };
    let key = match fields.remove(ID) {
        Some(Json::String(s)) => Key::new(s),
        Some(other) => Key::new(other.to_string()),
        None => return Err(Error::backend("mongo document without _id")),
    };
    let revision = fields.remove(REV).and_then(|r| r.as_u64()).unwrap_or(0);
    Ok(Document::from_fields(fields)
        .with_key(key)
        .with_collection(collection)
        .with_revision(revision))
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_BATCH_SIZE: u64 = 256;

/// Index catalog collection; collection names never start with `__`.
const CATALOG: &str = "__blitzdb_indexes";

/// Undo log of an open transaction: the stored form of every touched
/// document before its first write (`None` when it did not exist).
#[derive(Debug, Default)]
struct Journal {
    seen: HashSet<(String, Key)>,
    undo: Vec<(String, Key, Option<Json>)>,
}

pub struct MongoAdapter<E: MongoExec> {
    exec: E,
    batch_size: u64,
    journal: Option<Journal>,
}

impl<E: MongoExec> MongoAdapter<E> {
    pub fn new(exec: E) -> Self {
        Self {
            exec,
            batch_size: DEFAULT_BATCH_SIZE,
            journal: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Stored form of `key`, if present.
    fn stored(&mut self, collection: &str, key: &Key) -> Result<Option<Json>> {
        let find = MongoFind {
            filter: json!({ ID: key.as_str() }),
            sort: Vec::new(),
            skip: 0,
            limit: Some(1),
        };
        let mut found = self
            .exec
            .find(collection, &find)
            .map_err(|e| to_error(collection, Some(key), e))?;
        Ok(found.pop())
    }

    /// Remember `before` as the pre-image of `key` unless the open
    /// transaction already has one.
    fn journal(&mut self, collection: &str, key: &Key, before: &Option<Json>) {
        if let Some(journal) = self.journal.as_mut() {
            if journal.seen.insert((collection.to_string(), key.clone())) {
                journal
                    .undo
                    .push((collection.to_string(), key.clone(), before.clone()));
            }
        }
    }

    /// Put `key` back the way `before` has it.
    fn restore(&mut self, collection: &str, key: &Key, before: Option<Json>) -> Result<()> {
        let err = |e: MongoExecError| to_error(collection, Some(key), e);
        match before {
            Some(doc) => {
                if self.exec.replace_one(collection, key.as_str(), doc.clone()).map_err(err)? == 0 {
                    self.exec.insert_one(collection, doc).map_err(err)?;
                }
            }
            None => {
                self.exec.delete_one(collection, key.as_str()).map_err(err)?;
            }
        }
        Ok(())
    }
}

fn revision_of(stored: &Json) -> u64 {
    stored.get(REV).and_then(Json::as_u64).unwrap_or(0)
}

fn to_error(collection: &str, key: Option<&Key>, e: MongoExecError) -> Error {
    match e {
        MongoExecError::Unavailable(msg) => Error::BackendUnavailable(msg),
        MongoExecError::DuplicateKey { index } if index == PRIMARY_INDEX => match key {
            Some(key) => Error::duplicate(collection, key),
            None => Error::backend(format!("duplicate primary key in {collection}")),
        },
        MongoExecError::DuplicateKey { index } => Error::UniqueViolation {
            collection: collection.to_string(),
            index,
        },
        MongoExecError::Command(msg) => Error::Backend(msg),
    }
}

fn mongo_find(query: &CompiledQuery) -> Result<&MongoFind> {
    match query.native() {
        NativeQuery::Mongo(f) => Ok(f),
        _ => Err(Error::backend("query has no Mongo form")),
    }
}

impl<E: MongoExec> BackendAdapter for MongoAdapter<E> {
    fn kind(&self) -> BackendKind {
        BackendKind::Mongo
    }

    fn insert(&mut self, collection: &str, doc: Document, overwrite: bool) -> Result<Document> {
        let key = key_for(&doc);
        let before = self.stored(collection, &key)?;
        let previous = before.as_ref().map(revision_of);
        if previous.is_none() || overwrite {
            self.journal(collection, &key, &before);
        }
        let fields = doc.into_fields();
        let revision = match previous {
            Some(_) if !overwrite => return Err(Error::duplicate(collection, &key)),
            Some(rev) => {
                let stored = to_stored(&key, rev + 1, &fields);
                self.exec
                    .replace_one(collection, key.as_str(), stored)
                    .map_err(|e| to_error(collection, Some(&key), e))?;
                rev + 1
            }
            None => {
                self.exec
                    .insert_one(collection, to_stored(&key, 1, &fields))
                    .map_err(|e| to_error(collection, Some(&key), e))?;
                1
            }
        };
        debug!(collection, key = %key, revision, "mongo insert");
        Ok(Document::from_fields(fields)
            .with_key(key)
            .with_collection(collection)
            .with_revision(revision))
    }

    fn update(&mut self, collection: &str, key: &Key, doc: Document) -> Result<Document> {
        check_key(key, &doc)?;
        let before = self.stored(collection, key)?;
        let revision = match &before {
            Some(stored) => revision_of(stored) + 1,
            None => return Err(Error::not_found(collection, key)),
        };
        self.journal(collection, key, &before);
        let fields = doc.into_fields();
        let matched = self
            .exec
            .replace_one(collection, key.as_str(), to_stored(key, revision, &fields))
            .map_err(|e| to_error(collection, Some(key), e))?;
        if matched == 0 {
            return Err(Error::not_found(collection, key));
        }
        Ok(Document::from_fields(fields)
            .with_key(key.clone())
            .with_collection(collection)
            .with_revision(revision))
    }

    fn delete(&mut self, collection: &str, key: &Key, strict: bool) -> Result<bool> {
        if self.journal.is_some() {
            let before = self.stored(collection, key)?;
            if before.is_some() {
                self.journal(collection, key, &before);
            }
        }
        let deleted = self
            .exec
            .delete_one(collection, key.as_str())
            .map_err(|e| to_error(collection, Some(key), e))?;
        match deleted {
            0 if strict => Err(Error::not_found(collection, key)),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    fn fetch_by_key(&mut self, collection: &str, key: &Key) -> Result<Document> {
        let find = MongoFind {
            filter: json!({ ID: key.as_str() }),
            sort: Vec::new(),
            skip: 0,
            limit: Some(1),
        };
        let mut found = self
            .exec
            .find(collection, &find)
            .map_err(|e| to_error(collection, Some(key), e))?;
        match found.pop() {
            Some(doc) => from_stored(collection, doc),
            None => Err(Error::not_found(collection, key)),
        }
    }

    fn execute_query<'a>(
        &'a mut self,
        collection: &str,
        query: &CompiledQuery,
    ) -> Result<Cursor<'a>> {
        expect_target(query, BackendKind::Mongo)?;
        let find = mongo_find(query)?.clone();
        Ok(Cursor::new(Batches {
            adapter: self,
            collection: collection.to_string(),
            find,
            fetched: 0,
            buffer: VecDeque::new(),
            done: false,
        }))
    }

    fn count(&mut self, collection: &str, query: &CompiledQuery) -> Result<u64> {
        expect_target(query, BackendKind::Mongo)?;
        let find = mongo_find(query)?;
        let total = self
            .exec
            .count(collection, &find.filter)
            .map_err(|e| to_error(collection, None, e))?;
        let after_skip = total.saturating_sub(find.skip);
        Ok(find.limit.map_or(after_skip, |l| after_skip.min(l)))
    }

    fn create_index(&mut self, def: &IndexDefinition) -> Result<Delegation> {
        self.exec
            .create_index(def.collection(), &def.name(), def.path().as_str())
            .map_err(|e| to_error(def.collection(), None, e))?;
        Ok(Delegation::Native)
    }

    fn drop_index(&mut self, def: &IndexDefinition) -> Result<()> {
        if !def.delegated {
            return Ok(());
        }
        self.exec
            .drop_index(def.collection(), &def.name())
            .map_err(|e| to_error(def.collection(), None, e))
    }

    fn supports_native_index(&self, _path: &FieldPath) -> bool {
        true
    }

    fn drop_collection(&mut self, collection: &str) -> Result<()> {
        if self.journal.is_some() {
            return Err(Error::Transaction(format!(
                "cannot drop {collection} inside a transaction"
            )));
        }
        self.exec
            .drop_collection(collection)
            .map_err(|e| to_error(collection, None, e))
    }

    fn load_catalog(&mut self) -> Result<Vec<IndexDefinition>> {
        let all = MongoFind {
            filter: json!({}),
            sort: vec![(ID.to_string(), 1)],
            skip: 0,
            limit: None,
        };
        let entries = self
            .exec
            .find(CATALOG, &all)
            .map_err(|e| to_error(CATALOG, None, e))?;
        entries
            .into_iter()
            .map(|mut entry| {
                let def = entry.get_mut("definition").map(Json::take);
                match def {
                    Some(def) => Ok(serde_json::from_value(def)?),
                    None => Err(Error::backend(format!("bad catalog entry: {entry}"))),
                }
            })
            .collect()
    }

    fn record_index(&mut self, def: &IndexDefinition) -> Result<()> {
        let name = def.name();
        let entry = json!({
            ID: &name,
            "collection": def.collection(),
            "definition": def,
        });
        let matched = self
            .exec
            .replace_one(CATALOG, &name, entry.clone())
            .map_err(|e| to_error(CATALOG, None, e))?;
        if matched == 0 {
            self.exec
                .insert_one(CATALOG, entry)
                .map_err(|e| to_error(CATALOG, None, e))?;
        }
        Ok(())
    }

    fn forget_index(&mut self, def: &IndexDefinition) -> Result<()> {
        self.exec
            .delete_one(CATALOG, &def.name())
            .map_err(|e| to_error(CATALOG, None, e))?;
        Ok(())
    }

    /// Writes go straight to the server; rollback replays the undo log.
    /// Other connections see uncommitted writes.
    fn begin(&mut self) -> Result<()> {
        if self.journal.is_some() {
            return Err(Error::Transaction("already in a transaction".into()));
        }
        self.journal = Some(Journal::default());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let journal = self
            .journal
            .take()
            .ok_or_else(|| Error::Transaction("no open transaction".into()))?;
        debug!(documents = journal.undo.len(), "mongo transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let journal = self
            .journal
            .take()
            .ok_or_else(|| Error::Transaction("no open transaction".into()))?;
        let mut failed = None;
        for (collection, key, before) in journal.undo.into_iter().rev() {
            if let Err(e) = self.restore(&collection, &key, before) {
                warn!(collection = %collection, key = %key, error = %e, "rollback could not restore document");
                failed.get_or_insert(e);
            }
        }
        failed.map_or(Ok(()), Err)
    }

    fn close(&mut self) -> Result<()> {
        self.exec.close().map_err(|e| to_error("", None, e))
    }
}

/// Batch-at-a-time cursor: each refill is one `find` with skip/limit.
struct Batches<'a, E: MongoExec> {
    adapter: &'a mut MongoAdapter<E>,
    collection: String,
    find: MongoFind,
    fetched: u64,
    buffer: VecDeque<Document>,
    done: bool,
}

impl<E: MongoExec> Batches<'_, E> {
    fn fill(&mut self) -> Result<()> {
        let batch = self.adapter.batch_size;
        let requested = self
            .find
            .limit
            .map_or(batch, |l| l.saturating_sub(self.fetched).min(batch));
        if requested == 0 {
            self.done = true;
            return Ok(());
        }
        let page = self
            .find
            .page(self.find.skip + self.fetched, Some(requested));
        let docs = self
            .adapter
            .exec
            .find(&self.collection, &page)
            .map_err(|e| to_error(&self.collection, None, e))?;
        if (docs.len() as u64) < requested {
            self.done = true;
        }
        self.fetched += docs.len() as u64;
        for doc in docs {
            self.buffer.push_back(from_stored(&self.collection, doc)?);
        }
        Ok(())
    }
}

impl<E: MongoExec> Iterator for Batches<'_, E> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
pub(crate) mod fake;
