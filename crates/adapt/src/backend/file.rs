// crates/adapt/src/backend/file.rs
//
// Local store: one JSON file per collection under a root directory, or no
// files at all for `memory://`. Queries are full scans evaluated in-process
// and indexes are always emulated.

use super::{check_key, expect_target, key_for, BackendAdapter, BackendKind, Cursor, Delegation};
use crate::mql::{scan, CompiledQuery};
use crate::{Error, Result};
use domain::{Document, FieldPath, IndexDefinition, Key};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk record; the primary key is the map key of the collection file.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    rev: u64,
    fields: Map<String, Json>,
}

type Collection = BTreeMap<Key, Document>;

/// Index catalog file under the root; collection names never start with `__`.
const CATALOG: &str = "__blitzdb_indexes.json";

/// Open transaction: each touched collection as it was before its first
/// write. Touched collections are flushed on commit and restored on rollback.
#[derive(Debug, Default)]
struct Pending {
    before: HashMap<String, Collection>,
}

#[derive(Debug, Default)]
pub struct FileAdapter {
    root: Option<PathBuf>,
    collections: HashMap<String, Collection>,
    catalog: Option<Vec<IndexDefinition>>,
    tx: Option<Pending>,
}

impl FileAdapter {
    /// Non-persistent store.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Persistent store rooted at `root`; the directory is created if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "file backend opened");
        Ok(Self {
            root: Some(root),
            ..Self::default()
        })
    }

    fn file_of(&self, collection: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|r| r.join(format!("{collection}.json")))
    }

    fn load(&mut self, collection: &str) -> Result<&mut Collection> {
        if !self.collections.contains_key(collection) {
            let docs = match self.file_of(collection) {
                Some(path) if path.exists() => read_collection(&path, collection)?,
                _ => Collection::new(),
            };
            self.collections.insert(collection.to_string(), docs);
        }
        self.collections
            .get_mut(collection)
            .ok_or_else(|| Error::backend(format!("collection {collection} not loaded")))
    }

    /// Rewrite the collection file atomically (temp file + rename).
    fn flush(&self, collection: &str) -> Result<()> {
        let (Some(path), Some(docs)) = (self.file_of(collection), self.collections.get(collection))
        else {
            return Ok(());
        };
        let records: BTreeMap<&str, Record> = docs
            .iter()
            .map(|(k, d)| {
                (
                    k.as_str(),
                    Record {
                        rev: d.revision(),
                        fields: d.fields().clone(),
                    },
                )
            })
            .collect();
        write_atomic(&path, &serde_json::to_vec_pretty(&records)?)
    }

    /// Flush unless a transaction defers it. A failed flush drops the cached
    /// collection so memory and disk agree again on next access.
    fn persist(&mut self, collection: &str) -> Result<()> {
        if self.tx.is_some() {
            return Ok(());
        }
        self.flush(collection).inspect_err(|_| {
            self.collections.remove(collection);
        })
    }

    /// Snapshot `collection` before the open transaction first writes it.
    fn touch(&mut self, collection: &str) -> Result<()> {
        let untouched = self
            .tx
            .as_ref()
            .is_some_and(|tx| !tx.before.contains_key(collection));
        if untouched {
            let snapshot = self.load(collection)?.clone();
            if let Some(tx) = self.tx.as_mut() {
                tx.before.insert(collection.to_string(), snapshot);
            }
        }
        Ok(())
    }

    fn store(&mut self, collection: &str, key: Key, doc: Document) -> Result<Document> {
        self.touch(collection)?;
        self.load(collection)?.insert(key, doc.clone());
        self.persist(collection)?;
        Ok(doc)
    }

    fn catalog(&mut self) -> Result<&mut Vec<IndexDefinition>> {
        if self.catalog.is_none() {
            let defs = match self.root.as_ref().map(|r| r.join(CATALOG)) {
                Some(path) if path.exists() => serde_json::from_slice(&fs::read(&path)?)?,
                _ => Vec::new(),
            };
            self.catalog = Some(defs);
        }
        self.catalog
            .as_mut()
            .ok_or_else(|| Error::backend("index catalog not loaded"))
    }

    fn save_catalog(&self) -> Result<()> {
        match (&self.root, &self.catalog) {
            (Some(root), Some(defs)) => write_atomic(&root.join(CATALOG), &serde_json::to_vec_pretty(defs)?),
            _ => Ok(()),
        }
    }
}

/// Temp file + rename, so readers never see a torn file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_collection(path: &Path, collection: &str) -> Result<Collection> {
    let bytes = fs::read(path)?;
    let records: BTreeMap<String, Record> = serde_json::from_slice(&bytes)?;
    Ok(records
        .into_iter()
        .map(|(k, r)| {
            let key = Key::new(k);
            let doc = Document::from_fields(r.fields)
                .with_key(key.clone())
                .with_collection(collection)
                .with_revision(r.rev);
            (key, doc)
        })
        .collect())
}

impl BackendAdapter for FileAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn insert(&mut self, collection: &str, doc: Document, overwrite: bool) -> Result<Document> {
        let key = key_for(&doc);
        let previous = self.load(collection)?.get(&key).map(Document::revision);
        let revision = match previous {
            Some(_) if !overwrite => return Err(Error::duplicate(collection, &key)),
            Some(rev) => rev + 1,
            None => 1,
        };
        let stored = Document::from_fields(doc.into_fields())
            .with_key(key.clone())
            .with_collection(collection)
            .with_revision(revision);
        self.store(collection, key, stored)
    }

    fn update(&mut self, collection: &str, key: &Key, doc: Document) -> Result<Document> {
        check_key(key, &doc)?;
        let revision = match self.load(collection)?.get(key) {
            Some(existing) => existing.revision() + 1,
            None => return Err(Error::not_found(collection, key)),
        };
        let stored = Document::from_fields(doc.into_fields())
            .with_key(key.clone())
            .with_collection(collection)
            .with_revision(revision);
        self.store(collection, key.clone(), stored)
    }

    fn delete(&mut self, collection: &str, key: &Key, strict: bool) -> Result<bool> {
        self.touch(collection)?;
        let removed = self.load(collection)?.remove(key);
        match removed {
            Some(old) => {
                self.persist(collection)?;
                debug!(collection, key = %key, rev = old.revision(), "deleted");
                Ok(true)
            }
            None if strict => Err(Error::not_found(collection, key)),
            None => Ok(false),
        }
    }

    fn fetch_by_key(&mut self, collection: &str, key: &Key) -> Result<Document> {
        self.load(collection)?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(collection, key))
    }

    fn execute_query<'a>(
        &'a mut self,
        collection: &str,
        query: &CompiledQuery,
    ) -> Result<Cursor<'a>> {
        expect_target(query, BackendKind::File)?;
        let docs: &'a Collection = self.load(collection)?;
        Ok(Cursor::from_boxed(scan::stream(
            docs.values().cloned(),
            query.query(),
        )))
    }

    fn create_index(&mut self, _def: &IndexDefinition) -> Result<Delegation> {
        Ok(Delegation::Emulated)
    }

    fn drop_index(&mut self, _def: &IndexDefinition) -> Result<()> {
        Ok(())
    }

    fn supports_native_index(&self, _path: &FieldPath) -> bool {
        false
    }

    fn drop_collection(&mut self, collection: &str) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::Transaction(format!(
                "cannot drop {collection} inside a transaction"
            )));
        }
        self.collections.remove(collection);
        if let Some(path) = self.file_of(collection) {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn auxiliary_dir(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn load_catalog(&mut self) -> Result<Vec<IndexDefinition>> {
        Ok(self.catalog()?.clone())
    }

    fn record_index(&mut self, def: &IndexDefinition) -> Result<()> {
        let name = def.name();
        let defs = self.catalog()?;
        defs.retain(|d| d.name() != name);
        defs.push(def.clone());
        self.save_catalog()
    }

    fn forget_index(&mut self, def: &IndexDefinition) -> Result<()> {
        let name = def.name();
        self.catalog()?.retain(|d| d.name() != name);
        self.save_catalog()
    }

    fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::Transaction("already in a transaction".into()));
        }
        self.tx = Some(Pending::default());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Transaction("no open transaction".into()))?;
        let mut failed = None;
        for collection in tx.before.keys() {
            if let Err(e) = self.flush(collection) {
                self.collections.remove(collection);
                failed.get_or_insert(e);
            }
        }
        debug!(collections = tx.before.len(), "file transaction committed");
        failed.map_or(Ok(()), Err)
    }

    fn rollback(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Transaction("no open transaction".into()))?;
        debug!(collections = tx.before.len(), "file transaction rolled back");
        self.collections.extend(tx.before);
        Ok(())
    }
}
