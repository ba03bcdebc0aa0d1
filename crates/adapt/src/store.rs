// crates/adapt/src/store.rs
//
// Public facade: binds one backend adapter and one index manager, validates
// documents, runs type guards and routes reads through emulated indexes.

use crate::backend::{BackendAdapter, BackendKind, Cursor, Delegation};
use crate::index::{IndexBuildMode, IndexInfo, IndexManager};
use crate::mql::{compile, scan, CompiledQuery, Filter, IndexConstraint, Query};
use crate::{Error, Result};
use domain::{validate_collection, Document, FieldPath, IndexDefinition, IndexState, Key};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A store shared between threads; callers serialize on the mutex.
pub type SharedStore = Arc<Mutex<Store>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub index_build: IndexBuildMode,
    /// Make `delete` fail with `NotFound` on a missing key.
    pub strict_delete: bool,
}

pub struct Store {
    adapter: Box<dyn BackendAdapter>,
    indexes: IndexManager,
    options: StoreOptions,
    /// Collections written inside the open transaction.
    tx: Option<BTreeSet<String>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("indexes", &self.indexes)
            .field("options", &self.options)
            .field("tx", &self.tx)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Bind `adapter` and re-register every index recorded in its catalog.
    /// Emulated indexes adopt their mirror file when it still agrees with the
    /// stored documents and are rebuilt otherwise.
    #[instrument(skip_all)]
    pub fn open(mut adapter: Box<dyn BackendAdapter>, options: StoreOptions) -> Result<Self> {
        let mut indexes = IndexManager::new(options.index_build);
        if let Some(dir) = adapter.auxiliary_dir() {
            indexes = indexes.persist_to(dir);
        }
        let catalog = adapter.load_catalog()?;
        let mut store = Self {
            adapter,
            indexes,
            options,
            tx: None,
        };
        for def in catalog {
            store.restore_index(def)?;
        }
        store.indexes.finish_builds()?;
        info!(backend = %store.adapter.kind(), "store opened");
        Ok(store)
    }

    fn restore_index(&mut self, def: IndexDefinition) -> Result<()> {
        debug!(index = %def.name(), delegated = def.delegated, "restoring index");
        if def.delegated {
            let snapshot = if def.unique {
                self.scan_all(def.collection())?
            } else {
                Vec::new()
            };
            self.indexes.register(def, Delegation::Native, snapshot)?;
        } else {
            let docs = self.scan_all(def.collection())?;
            self.indexes.restore(def, &docs)?;
        }
        Ok(())
    }

    pub fn kind(&self) -> BackendKind {
        self.adapter.kind()
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// Release the backend connection. An open transaction is rolled back.
    pub fn close(mut self) -> Result<()> {
        if self.tx.is_some() {
            warn!("closing with an open transaction; rolling back");
            if let Err(e) = self.rollback() {
                warn!(error = %e, "rollback on close failed");
            }
        }
        self.adapter.close()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Open a transaction. Writes stay invisible to other connections until
    /// `commit` where the engine isolates them; index administration is
    /// refused until the transaction ends.
    pub fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::Transaction("a transaction is already open".into()));
        }
        self.adapter.begin()?;
        self.tx = Some(BTreeSet::new());
        debug!("transaction opened");
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        let touched = self.tx.take().ok_or_else(no_transaction)?;
        if let Err(e) = self.adapter.commit() {
            warn!(error = %e, "commit failed; rolling back");
            if let Err(undo) = self.adapter.rollback() {
                warn!(error = %undo, "rollback after failed commit failed");
            }
            self.forget_writes(&touched);
            return Err(e);
        }
        debug!(collections = touched.len(), "transaction committed");
        Ok(())
    }

    /// Discard every write since `begin`. Emulated indexes of the touched
    /// collections are rebuilt before their next use.
    pub fn rollback(&mut self) -> Result<()> {
        let touched = self.tx.take().ok_or_else(no_transaction)?;
        let undone = self.adapter.rollback();
        self.forget_writes(&touched);
        debug!(collections = touched.len(), "transaction rolled back");
        undone
    }

    /// Run `work` inside a transaction: committed when it returns `Ok`,
    /// rolled back when it fails. Inside an open transaction `work` simply
    /// joins it.
    pub fn transaction<T>(&mut self, work: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.in_transaction() {
            return work(self);
        }
        self.begin()?;
        match work(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(undo) = self.rollback() {
                    warn!(error = %undo, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn forget_writes(&mut self, touched: &BTreeSet<String>) {
        for collection in touched {
            self.indexes.mark_collection_stale(collection);
        }
    }

    fn outside_transaction(&self, operation: &str) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::Transaction(format!("{operation} is not allowed inside a transaction")));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────

    /// Store a new document; `DuplicateKey` when its key already exists.
    #[instrument(skip_all, fields(collection = %collection))]
    pub fn insert(&mut self, collection: &str, doc: Document) -> Result<Document> {
        self.put(collection, doc, false)
    }

    /// Insert or overwrite by key.
    #[instrument(skip_all, fields(collection = %collection))]
    pub fn save(&mut self, collection: &str, doc: Document) -> Result<Document> {
        self.put(collection, doc, true)
    }

    fn put(&mut self, collection: &str, doc: Document, overwrite: bool) -> Result<Document> {
        self.begin_write(collection)?;
        doc.validate()?;
        let key = doc.key().cloned().unwrap_or_else(Key::generate);
        self.check_unique(collection, &key, &doc)?;
        let previous = if overwrite {
            self.previous(collection, &key)?
        } else {
            None
        };
        let stored = self.adapter.insert(collection, doc.with_key(key), overwrite)?;
        self.index_put(collection, &stored, previous)?;
        debug!(collection, key = ?stored.key(), rev = stored.revision(), "stored");
        Ok(stored)
    }

    /// Replace the document stored under `key`; `NotFound` when absent.
    #[instrument(skip_all, fields(collection = %collection))]
    pub fn update(&mut self, collection: &str, key: &Key, doc: Document) -> Result<Document> {
        self.begin_write(collection)?;
        doc.validate()?;
        self.check_unique(collection, key, &doc)?;
        let previous = self.previous(collection, key)?;
        let stored = self.adapter.update(collection, key, doc)?;
        self.index_put(collection, &stored, previous)?;
        Ok(stored)
    }

    /// Remove `key`. Missing keys are a no-op unless the store was opened
    /// with `strict_delete`.
    pub fn delete(&mut self, collection: &str, key: &Key) -> Result<bool> {
        self.remove(collection, key, self.options.strict_delete)
    }

    /// Remove `key`, failing with `NotFound` when it is absent.
    pub fn delete_strict(&mut self, collection: &str, key: &Key) -> Result<bool> {
        self.remove(collection, key, true)
    }

    #[instrument(skip_all, fields(collection = %collection))]
    fn remove(&mut self, collection: &str, key: &Key, strict: bool) -> Result<bool> {
        self.begin_write(collection)?;
        let previous = self.previous(collection, key)?;
        let removed = self.adapter.delete(collection, key, strict)?;
        if removed {
            if let Err(e) = self.indexes.apply_remove(collection, key) {
                if let Some(old) = previous {
                    self.compensate(collection, key, Some(old));
                }
                return Err(e);
            }
        }
        Ok(removed)
    }

    /// Delete every document matching `filter`; returns how many went.
    #[instrument(skip_all, fields(collection = %collection))]
    pub fn delete_matching(&mut self, collection: &str, filter: Filter) -> Result<u64> {
        let keys = self.keys(collection, &Query::new(filter))?;
        let mut deleted = 0;
        for key in &keys {
            if self.remove(collection, key, false)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Emulated unique indexes answer from memory; for native ones the
    /// backend is asked for another document holding the same value, so
    /// every backend applies the same equality (`1 == 1.0`, `true != 1`).
    fn check_unique(&mut self, collection: &str, key: &Key, doc: &Document) -> Result<()> {
        self.indexes.check_unique(collection, key, doc)?;
        for def in self.indexes.delegated_unique(collection) {
            let value = match doc.lookup(def.path().as_str()) {
                None | Some(Json::Null) => continue,
                Some(value) => value.clone(),
            };
            let query = Query::new(Filter::eq(def.path().as_str(), value)?).limit(2);
            let compiled = compile(&query, self.adapter.kind())?;
            for held in self.adapter.execute_query(collection, &compiled)? {
                if held?.key() != Some(key) {
                    return Err(Error::UniqueViolation {
                        collection: collection.to_string(),
                        index: def.name(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Previous version of `key`, fetched only when emulated indexes would
    /// need it to undo a failed index write.
    fn previous(&mut self, collection: &str, key: &Key) -> Result<Option<Document>> {
        let emulated = self
            .indexes
            .indexes(collection)
            .iter()
            .any(|i| !i.definition.delegated);
        if !emulated {
            return Ok(None);
        }
        match self.adapter.fetch_by_key(collection, key) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn index_put(
        &mut self,
        collection: &str,
        stored: &Document,
        previous: Option<Document>,
    ) -> Result<()> {
        if let Err(e) = self.indexes.apply_put(collection, stored) {
            if let Some(key) = stored.key() {
                self.compensate(collection, key, previous);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Undo a backend write whose index update failed. The collection's
    /// emulated indexes are already `Building`; a failed undo is only logged
    /// since the rebuild reads the backend anyway.
    fn compensate(&mut self, collection: &str, key: &Key, previous: Option<Document>) {
        let undo = match previous {
            Some(old) => self.adapter.insert(collection, old, true).map(|_| ()),
            None => self.adapter.delete(collection, key, false).map(|_| ()),
        };
        match undo {
            Ok(()) => warn!(collection, key = %key, "write rolled back after index failure"),
            Err(e) => warn!(collection, key = %key, error = %e, "rollback failed"),
        }
    }

    /// Common prologue of every write: collection name check, incremental
    /// build progress and eager rebuild of stale indexes.
    fn begin_write(&mut self, collection: &str) -> Result<()> {
        validate_collection(collection)?;
        if let Some(touched) = self.tx.as_mut() {
            touched.insert(collection.to_string());
        }
        self.indexes.advance_builds()?;
        if self.indexes.has_stale(collection) {
            let docs = self.scan_all(collection)?;
            self.indexes.rebuild_stale(collection, &docs)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    pub fn get(&mut self, collection: &str, key: &Key) -> Result<Document> {
        validate_collection(collection)?;
        self.indexes.advance_builds()?;
        self.adapter.fetch_by_key(collection, key)
    }

    /// Exactly one document matching `filter`.
    pub fn get_one(&mut self, collection: &str, filter: Filter) -> Result<Document> {
        let mut found = self
            .find(collection, &Query::new(filter).limit(2))?
            .collect_all()?;
        match found.len() {
            0 => Err(Error::no_match(collection)),
            1 => Ok(found.remove(0)),
            count => Err(Error::MultipleResults {
                collection: collection.to_string(),
                count,
            }),
        }
    }

    /// Compile `query` for this store's backend. The result may be reused.
    pub fn compile(&self, query: &Query) -> Result<CompiledQuery> {
        compile(query, self.adapter.kind())
    }

    pub fn find(&mut self, collection: &str, query: &Query) -> Result<Cursor<'_>> {
        let compiled = self.compile(query)?;
        self.find_compiled(collection, &compiled)
    }

    /// Run a compiled query. Ordering comparisons are guarded first so every
    /// backend reports `TypeMismatch` alike; equality and containment on an
    /// active emulated index are answered from the index.
    #[instrument(skip_all, fields(collection = %collection))]
    pub fn find_compiled(&mut self, collection: &str, query: &CompiledQuery) -> Result<Cursor<'_>> {
        self.prepare_read(collection, query)?;
        if let Some(docs) = self.indexed(collection, query)? {
            return Ok(Cursor::from_vec(docs));
        }
        self.adapter.execute_query(collection, query)
    }

    pub fn count(&mut self, collection: &str, query: &Query) -> Result<u64> {
        let compiled = self.compile(query)?;
        self.prepare_read(collection, &compiled)?;
        if let Some(docs) = self.indexed(collection, &compiled)? {
            return Ok(docs.len() as u64);
        }
        self.adapter.count(collection, &compiled)
    }

    /// Keys of the matching documents, in result order.
    pub fn keys(&mut self, collection: &str, query: &Query) -> Result<Vec<Key>> {
        self.find(collection, query)?
            .map(|doc| doc.map(|d| d.key().cloned()))
            .filter_map(Result::transpose)
            .collect()
    }

    fn prepare_read(&mut self, collection: &str, query: &CompiledQuery) -> Result<()> {
        validate_collection(collection)?;
        if query.target() != self.adapter.kind() {
            return Err(Error::backend(format!(
                "query compiled for {} cannot run on {}",
                query.target(),
                self.adapter.kind()
            )));
        }
        self.indexes.advance_builds()?;
        for guard in query.guards() {
            let check = compile(&Query::new(guard.violations()).limit(1), self.adapter.kind())?;
            let offender = self.adapter.execute_query(collection, &check)?.next();
            if let Some(doc) = offender {
                return Err(guard.mismatch(&doc?));
            }
        }
        Ok(())
    }

    /// Answer `query` from an emulated index, verifying every candidate.
    /// Returns `None` when no index applies or the index turned out to be
    /// inconsistent (it is then scheduled for rebuild).
    fn indexed(&mut self, collection: &str, query: &CompiledQuery) -> Result<Option<Vec<Document>>> {
        let Some((hint, keys)) = self.indexes.candidates(collection, query.hints()) else {
            return Ok(None);
        };
        match self.verified(collection, hint, keys)? {
            Ok(docs) => Ok(Some(scan::run(docs, query.query()))),
            Err(inconsistent) => {
                warn!(error = %inconsistent, "falling back to collection scan");
                self.indexes.mark_stale(collection, hint.path());
                Ok(None)
            }
        }
    }

    /// Outer error: backend failure. Inner error: index disagreement.
    fn verified(
        &mut self,
        collection: &str,
        hint: &IndexConstraint,
        keys: impl IntoIterator<Item = Key>,
    ) -> Result<Result<Vec<Document>>> {
        let inconsistent = || Error::IndexInconsistent {
            collection: collection.to_string(),
            path: hint.path().to_string(),
        };
        let mut docs = Vec::new();
        for key in keys {
            match self.adapter.fetch_by_key(collection, &key) {
                Ok(doc) if hint.matches(&doc) => docs.push(doc),
                Ok(_) => return Ok(Err(inconsistent())),
                Err(e) if e.is_not_found() => return Ok(Err(inconsistent())),
                Err(e) => return Err(e),
            }
        }
        Ok(Ok(docs))
    }

    fn scan_all(&mut self, collection: &str) -> Result<Vec<Document>> {
        let all = compile(&Query::all(), self.adapter.kind())?;
        self.adapter.execute_query(collection, &all)?.collect_all()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Indexes and collections
    // ─────────────────────────────────────────────────────────────────────

    /// Create an index on `path`. Delegated when the backend supports it,
    /// emulated otherwise; the returned state is `Building` while an
    /// incremental build is pending. The definition is recorded in the
    /// backend catalog so the next `open` restores it.
    #[instrument(skip_all, fields(collection = %collection, path = %path))]
    pub fn create_index(&mut self, collection: &str, path: &str, unique: bool) -> Result<IndexState> {
        self.outside_transaction("create_index")?;
        self.begin_write(collection)?;
        let mut def = IndexDefinition::new(collection, path, unique)?;
        if self.indexes.contains(collection, def.path()) {
            return Err(Error::IndexExists {
                collection: collection.to_string(),
                path: path.to_string(),
            });
        }
        let delegation = self.adapter.create_index(&def)?;
        def.delegated = delegation == Delegation::Native;
        let registered = match self.snapshot_for(&def) {
            Ok(snapshot) => self.indexes.register(def.clone(), delegation, snapshot),
            Err(e) => Err(e),
        };
        let state = match registered {
            Ok(state) => state,
            Err(e) => {
                self.discard_native(&def);
                return Err(e);
            }
        };
        if let Err(e) = self.adapter.record_index(&def) {
            if let Err(undo) = self.indexes.drop_index(collection, def.path()) {
                warn!(error = %undo, "unregistering index failed");
            }
            self.discard_native(&def);
            return Err(e);
        }
        Ok(state)
    }

    /// Documents a new index has to see: all of them for emulated indexes,
    /// and for native unique ones so existing duplicates are refused.
    fn snapshot_for(&mut self, def: &IndexDefinition) -> Result<Vec<Document>> {
        if def.delegated && !def.unique {
            return Ok(Vec::new());
        }
        self.scan_all(def.collection())
    }

    fn discard_native(&mut self, def: &IndexDefinition) {
        if def.delegated {
            if let Err(e) = self.adapter.drop_index(def) {
                warn!(index = %def.name(), error = %e, "dropping native index failed");
            }
        }
    }

    /// Drop the index on `path`: the native index first, then the catalog
    /// entry, then the in-memory state, so a backend failure leaves the index
    /// fully in place.
    #[instrument(skip_all, fields(collection = %collection, path = %path))]
    pub fn drop_index(&mut self, collection: &str, path: &str) -> Result<()> {
        self.outside_transaction("drop_index")?;
        validate_collection(collection)?;
        let path = FieldPath::parse(path)?;
        let def = self
            .indexes
            .definition(collection, &path)
            .cloned()
            .ok_or_else(|| Error::UnknownIndex {
                collection: collection.to_string(),
                path: path.to_string(),
            })?;
        self.adapter.drop_index(&def)?;
        if let Err(e) = self.adapter.forget_index(&def) {
            if def.delegated {
                if let Err(undo) = self.adapter.create_index(&def) {
                    warn!(index = %def.name(), error = %undo, "recreating native index failed");
                }
            }
            return Err(e);
        }
        self.indexes.drop_index(collection, &path)?;
        Ok(())
    }

    pub fn indexes(&self, collection: &str) -> Vec<IndexInfo> {
        self.indexes.indexes(collection)
    }

    pub fn index_state(&self, collection: &str, path: &str) -> Result<IndexState> {
        Ok(self.indexes.state(collection, &FieldPath::parse(path)?))
    }

    /// Drive all incremental index builds to completion.
    pub fn finish_index_builds(&mut self) -> Result<()> {
        self.indexes.finish_builds()
    }

    #[instrument(skip_all, fields(collection = %collection))]
    pub fn drop_collection(&mut self, collection: &str) -> Result<()> {
        self.outside_transaction("drop_collection")?;
        validate_collection(collection)?;
        self.adapter.drop_collection(collection)?;
        for info in self.indexes.indexes(collection) {
            self.adapter.forget_index(&info.definition)?;
        }
        self.indexes.drop_collection(collection)
    }
}

fn no_transaction() -> Error {
    Error::Transaction("no transaction is open".into())
}
