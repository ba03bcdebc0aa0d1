//! Index Manager: per (collection, field path) index state, emulated lookup
//! structures and their on-disk mirrors.
//!
//! Delegated indexes are only bookkept here; the backend maintains them.
//! Emulated indexes are mutated exclusively through this module, after the
//! corresponding backend write has succeeded.

mod build;
mod emulated;

pub use build::IndexBuildMode;
pub use emulated::EmulatedIndex;

use crate::backend::Delegation;
use crate::mql::IndexConstraint;
use crate::{Error, Result};
use build::{BuildJob, PendingWrite};
use domain::{Document, FieldPath, IndexDefinition, IndexState, Key};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const INDEX_FILE_SUFFIX: &str = ".index.json";

/// Definition and current state, as reported by `Store::indexes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub definition: IndexDefinition,
    pub state: IndexState,
}

/// On-disk form of one emulated index.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub definition: IndexDefinition,
    pub entries: BTreeMap<String, BTreeSet<Key>>,
}

#[derive(Debug)]
struct Entry {
    def: IndexDefinition,
    state: IndexState,
    emulated: Option<EmulatedIndex>,
    job: Option<BuildJob>,
    /// Forced rebuild pending (state is `Building` while set).
    stale: bool,
}

impl Entry {
    fn is_emulated(&self) -> bool {
        !self.def.delegated
    }

    fn info(&self) -> IndexInfo {
        IndexInfo {
            definition: self.def.clone(),
            state: self.state,
        }
    }
}

type Slot = (String, FieldPath);

#[derive(Debug, Default)]
pub struct IndexManager {
    mode: IndexBuildMode,
    entries: HashMap<Slot, Entry>,
    root: Option<PathBuf>,
}

impl IndexManager {
    pub fn new(mode: IndexBuildMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Mirror emulated indexes as `<name>.index.json` files under `root`.
    pub fn persist_to(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn mode(&self) -> IndexBuildMode {
        self.mode
    }

    pub fn state(&self, collection: &str, path: &FieldPath) -> IndexState {
        self.entries
            .get(&slot(collection, path))
            .map_or(IndexState::Unindexed, |e| e.state)
    }

    pub fn contains(&self, collection: &str, path: &FieldPath) -> bool {
        self.entries.contains_key(&slot(collection, path))
    }

    pub fn definition(&self, collection: &str, path: &FieldPath) -> Option<&IndexDefinition> {
        self.entries.get(&slot(collection, path)).map(|e| &e.def)
    }

    /// Definitions of `collection` the backend enforces uniqueness for only
    /// through the store.
    pub fn delegated_unique(&self, collection: &str) -> Vec<IndexDefinition> {
        self.entries
            .values()
            .filter(|e| e.def.delegated && e.def.unique && e.def.collection() == collection)
            .map(|e| e.def.clone())
            .collect()
    }

    pub fn indexes(&self, collection: &str) -> Vec<IndexInfo> {
        let mut out: Vec<IndexInfo> = self
            .entries
            .values()
            .filter(|e| e.def.collection() == collection)
            .map(Entry::info)
            .collect();
        out.sort_by(|a, b| a.definition.path().cmp(b.definition.path()));
        out
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Register a new index. `snapshot` is the collection content at creation
    /// time; it is indexed for emulated indexes and checked for duplicates
    /// for unique ones.
    pub fn register(
        &mut self,
        mut def: IndexDefinition,
        delegation: Delegation,
        snapshot: Vec<Document>,
    ) -> Result<IndexState> {
        let key = slot(def.collection(), def.path());
        if self.entries.contains_key(&key) {
            return Err(Error::IndexExists {
                collection: key.0,
                path: key.1.to_string(),
            });
        }
        def.delegated = delegation == Delegation::Native;

        let mut entry = Entry {
            def,
            state: IndexState::Building,
            emulated: None,
            job: None,
            stale: false,
        };
        match (delegation, self.mode) {
            (Delegation::Native, _) => {
                check_unique_build(&entry.def, &snapshot)?;
                entry.state = IndexState::Active;
            }
            (Delegation::Emulated, IndexBuildMode::Incremental { .. }) if !entry.def.unique => {
                entry.job = Some(BuildJob::new(snapshot));
            }
            (Delegation::Emulated, _) => {
                check_unique_build(&entry.def, &snapshot)?;
                entry.emulated = Some(EmulatedIndex::build(entry.def.path(), &snapshot));
                entry.state = IndexState::Active;
            }
        }
        info!(
            index = %entry.def.name(),
            delegated = entry.def.delegated,
            state = ?entry.state,
            "index registered"
        );
        if let Some(index) = &entry.emulated {
            save_to(self.root.as_deref(), &entry.def, index)?;
        }
        let state = entry.state;
        self.entries.insert(key, entry);
        Ok(state)
    }

    /// Remove an index; the returned definition tells the caller whether the
    /// backend has to drop a native counterpart.
    pub fn drop_index(&mut self, collection: &str, path: &FieldPath) -> Result<IndexDefinition> {
        let entry = self
            .entries
            .remove(&slot(collection, path))
            .ok_or_else(|| Error::UnknownIndex {
                collection: collection.to_string(),
                path: path.to_string(),
            })?;
        self.unlink(&entry.def)?;
        info!(index = %entry.def.name(), state = ?IndexState::Dropped, "index dropped");
        Ok(entry.def)
    }

    /// Forget every index of `collection` (the backend drops native ones
    /// together with the collection).
    pub fn drop_collection(&mut self, collection: &str) -> Result<()> {
        let slots: Vec<Slot> = self
            .entries
            .keys()
            .filter(|(c, _)| c == collection)
            .cloned()
            .collect();
        for key in slots {
            if let Some(entry) = self.entries.remove(&key) {
                self.unlink(&entry.def)?;
                debug!(index = %entry.def.name(), "index dropped with collection");
            }
        }
        Ok(())
    }

    /// Force a rebuild of an emulated index before its next use.
    pub fn mark_stale(&mut self, collection: &str, path: &FieldPath) {
        if let Some(entry) = self.entries.get_mut(&slot(collection, path)) {
            if entry.is_emulated() && !entry.stale {
                warn!(index = %entry.def.name(), "index marked for rebuild");
                entry.stale = true;
                entry.state = IndexState::Building;
                entry.emulated = None;
                entry.job = None;
            }
        }
    }

    /// Force a rebuild of every emulated index of `collection`.
    pub fn mark_collection_stale(&mut self, collection: &str) {
        let paths: Vec<FieldPath> = self
            .emulated_of(collection)
            .map(|e| e.def.path().clone())
            .collect();
        for path in paths {
            self.mark_stale(collection, &path);
        }
    }

    pub fn has_stale(&self, collection: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.stale && e.def.collection() == collection)
    }

    /// Rebuild every stale index of `collection` from a fresh scan.
    pub fn rebuild_stale(&mut self, collection: &str, docs: &[Document]) -> Result<()> {
        let root = self.root.clone();
        for entry in self
            .entries
            .values_mut()
            .filter(|e| e.stale && e.def.collection() == collection)
        {
            check_unique_build(&entry.def, docs)?;
            let index = EmulatedIndex::build(entry.def.path(), docs);
            save_to(root.as_deref(), &entry.def, &index)?;
            entry.emulated = Some(index);
            entry.stale = false;
            entry.state = IndexState::Active;
            info!(index = %entry.def.name(), docs = docs.len(), "index rebuilt");
        }
        Ok(())
    }

    /// Advance incremental builds by one batch each.
    pub fn advance_builds(&mut self) -> Result<()> {
        let batch = match self.mode {
            IndexBuildMode::Incremental { batch } => batch.max(1),
            IndexBuildMode::Immediate => usize::MAX,
        };
        self.drive(batch)
    }

    /// Run every pending build to completion.
    pub fn finish_builds(&mut self) -> Result<()> {
        self.drive(usize::MAX)
    }

    fn drive(&mut self, batch: usize) -> Result<()> {
        let root = self.root.clone();
        for entry in self.entries.values_mut() {
            let Some(job) = entry.job.as_mut() else {
                continue;
            };
            if !job.step(entry.def.path(), batch) {
                debug!(index = %entry.def.name(), remaining = job.remaining(), "index build progressed");
                continue;
            }
            if let Some(job) = entry.job.take() {
                let index = job.finish(entry.def.path());
                if let Err(e) = save_to(root.as_deref(), &entry.def, &index) {
                    entry.stale = true;
                    return Err(e);
                }
                entry.emulated = Some(index);
                entry.state = IndexState::Active;
                info!(index = %entry.def.name(), "index build finished");
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Write path
    // ─────────────────────────────────────────────────────────────────────

    /// Reject `doc` when an active emulated unique index already holds its
    /// value under another key.
    pub fn check_unique(&self, collection: &str, key: &Key, doc: &Document) -> Result<()> {
        for entry in self.emulated_of(collection).filter(|e| e.def.unique) {
            if let Some(index) = &entry.emulated {
                if index.conflict(key, doc.lookup(entry.def.path().as_str())).is_some() {
                    return Err(unique_violation(&entry.def));
                }
            }
        }
        Ok(())
    }

    /// Apply a stored document to every emulated index of its collection.
    /// On failure every emulated index of the collection is left `Building`,
    /// since the caller undoes the backend write the others already took.
    pub fn apply_put(&mut self, collection: &str, doc: &Document) -> Result<()> {
        self.apply(collection, PendingWrite::Put(doc.clone()))
    }

    pub fn apply_remove(&mut self, collection: &str, key: &Key) -> Result<()> {
        self.apply(collection, PendingWrite::Remove(key.clone()))
    }

    fn apply(&mut self, collection: &str, write: PendingWrite) -> Result<()> {
        let root = self.root.clone();
        let mut failed = None;
        for entry in self
            .entries
            .values_mut()
            .filter(|e| e.is_emulated() && e.def.collection() == collection)
        {
            let pending = write.clone();
            if let Some(job) = entry.job.as_mut() {
                job.queue(pending);
                continue;
            }
            let Some(index) = entry.emulated.as_mut() else {
                // stale: rebuilt wholesale on the next write
                continue;
            };
            match pending {
                PendingWrite::Put(doc) => index.put(entry.def.path(), &doc),
                PendingWrite::Remove(key) => index.remove(&key),
            }
            if let Err(e) = save_to(root.as_deref(), &entry.def, index) {
                warn!(index = %entry.def.name(), error = %e, "index write failed");
                failed = Some(e);
                break;
            }
        }
        match failed {
            Some(e) => {
                self.mark_collection_stale(collection);
                Err(e)
            }
            None => Ok(()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read path
    // ─────────────────────────────────────────────────────────────────────

    /// First constraint an active emulated index can answer, with its
    /// candidate keys.
    pub fn candidates<'q>(
        &self,
        collection: &str,
        hints: &'q [IndexConstraint],
    ) -> Option<(&'q IndexConstraint, BTreeSet<Key>)> {
        hints.iter().find_map(|hint| {
            let entry = self.entries.get(&slot(collection, hint.path()))?;
            if entry.state != IndexState::Active || !entry.is_emulated() {
                return None;
            }
            entry.emulated.as_ref().map(|index| (hint, index.lookup(hint)))
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    /// Re-register an emulated index recorded in the backend catalog. The
    /// mirror file is adopted when it agrees with `docs`; a missing, corrupt
    /// or outdated one is replaced by a fresh build.
    pub fn restore(&mut self, mut def: IndexDefinition, docs: &[Document]) -> Result<IndexState> {
        def.delegated = false;
        let key = slot(def.collection(), def.path());
        if self.entries.contains_key(&key) {
            return Err(Error::IndexExists {
                collection: key.0,
                path: key.1.to_string(),
            });
        }
        check_unique_build(&def, docs)?;
        let saved = self
            .root
            .as_deref()
            .and_then(|root| read_saved(root, &def));
        let index = match saved {
            Some(index) if index.agrees_with(def.path(), docs) => {
                debug!(index = %def.name(), entries = index.len(), "persisted index adopted");
                index
            }
            saved => {
                if saved.is_some() {
                    warn!(index = %def.name(), "persisted index out of date; rebuilt");
                }
                let index = EmulatedIndex::build(def.path(), docs);
                save_to(self.root.as_deref(), &def, &index)?;
                index
            }
        };
        info!(index = %def.name(), state = ?IndexState::Active, "index restored");
        self.entries.insert(
            key,
            Entry {
                def,
                state: IndexState::Active,
                emulated: Some(index),
                job: None,
                stale: false,
            },
        );
        Ok(IndexState::Active)
    }

    fn unlink(&self, def: &IndexDefinition) -> Result<()> {
        if let Some(root) = &self.root {
            let file = index_file(root, def);
            if file.exists() {
                fs::remove_file(file)?;
            }
        }
        Ok(())
    }

    fn emulated_of<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
        self.entries
            .values()
            .filter(move |e| e.is_emulated() && e.def.collection() == collection)
    }
}

/// The mirror file of `def`, if present and readable. Anything unusable is
/// logged and ignored; the caller rebuilds from the documents.
fn read_saved(root: &Path, def: &IndexDefinition) -> Option<EmulatedIndex> {
    let bytes = match fs::read(index_file(root, def)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(index = %def.name(), "no persisted index");
            return None;
        }
        Err(e) => {
            warn!(index = %def.name(), error = %e, "persisted index unreadable");
            return None;
        }
    };
    let saved: PersistedIndex = match serde_json::from_slice(&bytes) {
        Ok(saved) => saved,
        Err(e) => {
            warn!(index = %def.name(), error = %e, "persisted index corrupt");
            return None;
        }
    };
    let same = saved.definition.collection() == def.collection()
        && saved.definition.path() == def.path()
        && saved.definition.unique == def.unique;
    if !same {
        warn!(index = %def.name(), "persisted index belongs to another definition");
        return None;
    }
    EmulatedIndex::from_entries(saved.entries)
        .inspect_err(|e| warn!(index = %def.name(), error = %e, "persisted index corrupt"))
        .ok()
}

fn slot(collection: &str, path: &FieldPath) -> Slot {
    (collection.to_string(), path.clone())
}

fn index_file(root: &Path, def: &IndexDefinition) -> PathBuf {
    root.join(format!("{}{INDEX_FILE_SUFFIX}", def.name()))
}

fn unique_violation(def: &IndexDefinition) -> Error {
    Error::UniqueViolation {
        collection: def.collection().to_string(),
        index: def.name(),
    }
}

/// Existing data must already satisfy a unique index being built.
fn check_unique_build(def: &IndexDefinition, docs: &[Document]) -> Result<()> {
    if !def.unique {
        return Ok(());
    }
    let mut seen = EmulatedIndex::new();
    for doc in docs {
        if let Some(key) = doc.key() {
            if seen.conflict(key, doc.lookup(def.path().as_str())).is_some() {
                return Err(unique_violation(def));
            }
        }
        seen.put(def.path(), doc);
    }
    Ok(())
}

fn save_to(root: Option<&Path>, def: &IndexDefinition, index: &EmulatedIndex) -> Result<()> {
    let Some(root) = root else {
        return Ok(());
    };
    let persisted = PersistedIndex {
        definition: def.clone(),
        entries: index.entries().clone(),
    };
    let file = index_file(root, def);
    let tmp = file.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&persisted)?)?;
    fs::rename(&tmp, &file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as Json};

    fn def(path: &str, unique: bool) -> IndexDefinition {
        IndexDefinition::new("items", path, unique).unwrap()
    }

    fn path(p: &str) -> FieldPath {
        FieldPath::parse(p).unwrap()
    }

    fn doc(key: &str, v: Json) -> Document {
        Document::from_json(v).unwrap().with_key(key)
    }

    fn eq(p: &str, v: Json) -> IndexConstraint {
        IndexConstraint::Eq {
            path: path(p),
            value: v,
        }
    }

    fn candidate_keys(m: &IndexManager, hint: IndexConstraint) -> Option<Vec<String>> {
        m.candidates("items", std::slice::from_ref(&hint))
            .map(|(_, keys)| keys.iter().map(|k| k.to_string()).collect())
    }

    // ─────────────────────────────────────────────────────────────
    // lifecycle
    // ─────────────────────────────────────────────────────────────

    #[test]
    fn state_machine_unindexed_active_dropped() {
        let mut m = IndexManager::new(IndexBuildMode::Immediate);
        let p = path("name");
        assert_eq!(m.state("items", &p), IndexState::Unindexed);

        let state = m
            .register(def("name", false), Delegation::Emulated, vec![doc("a", json!({ "name": "x" }))])
            .unwrap();
        assert_eq!(state, IndexState::Active);
        assert_eq!(candidate_keys(&m, eq("name", json!("x"))), Some(vec!["a".into()]));

        assert!(matches!(
            m.register(def("name", true), Delegation::Emulated, vec![]),
            Err(Error::IndexExists { .. })
        ));

        let dropped = m.drop_index("items", &p).unwrap();
        assert!(!dropped.delegated);
        assert_eq!(m.state("items", &p), IndexState::Unindexed);
        assert!(matches!(m.drop_index("items", &p), Err(Error::UnknownIndex { .. })));
    }

    #[test]
    fn delegated_indexes_are_only_bookkept() {
        let mut m = IndexManager::new(IndexBuildMode::Immediate);
        m.register(def("name", false), Delegation::Native, vec![]).unwrap();
        let infos = m.indexes("items");
        assert_eq!(infos.len(), 1);
        assert!(infos[0].definition.delegated);
        assert_eq!(infos[0].state, IndexState::Active);
        // the backend answers these itself
        assert_eq!(candidate_keys(&m, eq("name", json!("x"))), None);
        assert!(m.delegated_unique("items").is_empty());

        // uniqueness of a native index is still checked against the snapshot
        let dupes = vec![doc("a", json!({ "e": true })), doc("b", json!({ "e": true }))];
        assert!(matches!(
            m.register(def("e", true), Delegation::Native, dupes),
            Err(Error::UniqueViolation { .. })
        ));
        let distinct = vec![doc("a", json!({ "e": true })), doc("b", json!({ "e": 1 }))];
        m.register(def("e", true), Delegation::Native, distinct).unwrap();
        assert_eq!(m.delegated_unique("items").len(), 1);
    }

    #[test]
    fn unique_build_rejects_existing_duplicates() {
        let mut m = IndexManager::new(IndexBuildMode::Immediate);
        let docs = vec![doc("a", json!({ "e": 1 })), doc("b", json!({ "e": 1.0 }))];
        assert!(matches!(
            m.register(def("e", true), Delegation::Emulated, docs),
            Err(Error::UniqueViolation { .. })
        ));
        assert!(!m.contains("items", &path("e")));
    }

    // ─────────────────────────────────────────────────────────────
    // incremental builds
    // ─────────────────────────────────────────────────────────────

    #[test]
    fn incremental_build_queues_writes_until_done() {
        let mut m = IndexManager::new(IndexBuildMode::Incremental { batch: 1 });
        let snapshot = vec![doc("a", json!({ "n": 1 })), doc("b", json!({ "n": 2 }))];
        let state = m.register(def("n", false), Delegation::Emulated, snapshot).unwrap();
        assert_eq!(state, IndexState::Building);
        assert_eq!(candidate_keys(&m, eq("n", json!(1))), None);

        m.apply_put("items", &doc("c", json!({ "n": 1 }))).unwrap();
        m.apply_remove("items", &"a".into()).unwrap();

        m.advance_builds().unwrap();
        assert_eq!(m.state("items", &path("n")), IndexState::Building);
        m.advance_builds().unwrap();
        assert_eq!(m.state("items", &path("n")), IndexState::Active);
        assert_eq!(candidate_keys(&m, eq("n", json!(1))), Some(vec!["c".into()]));
    }

    #[test]
    fn unique_indexes_build_immediately_even_in_incremental_mode() {
        let mut m = IndexManager::new(IndexBuildMode::Incremental { batch: 1 });
        let state = m
            .register(def("e", true), Delegation::Emulated, vec![doc("a", json!({ "e": 1 }))])
            .unwrap();
        assert_eq!(state, IndexState::Active);
        assert!(m.check_unique("items", &"b".into(), &doc("b", json!({ "e": 1 }))).is_err());
        assert!(m.check_unique("items", &"a".into(), &doc("a", json!({ "e": 1 }))).is_ok());
        assert!(m.check_unique("items", &"b".into(), &doc("b", json!({}))).is_ok());
    }

    // ─────────────────────────────────────────────────────────────
    // forced rebuilds
    // ─────────────────────────────────────────────────────────────

    #[test]
    fn stale_index_is_skipped_until_rebuilt() {
        let mut m = IndexManager::new(IndexBuildMode::Immediate);
        m.register(def("n", false), Delegation::Emulated, vec![doc("a", json!({ "n": 1 }))])
            .unwrap();
        m.mark_stale("items", &path("n"));
        assert!(m.has_stale("items"));
        assert_eq!(m.state("items", &path("n")), IndexState::Building);
        assert_eq!(candidate_keys(&m, eq("n", json!(1))), None);

        // writes while stale are not applied piecemeal
        m.apply_put("items", &doc("b", json!({ "n": 1 }))).unwrap();

        let fresh = vec![doc("a", json!({ "n": 1 })), doc("b", json!({ "n": 1 }))];
        m.rebuild_stale("items", &fresh).unwrap();
        assert!(!m.has_stale("items"));
        assert_eq!(
            candidate_keys(&m, eq("n", json!(1))),
            Some(vec!["a".into(), "b".into()])
        );
    }

    // ─────────────────────────────────────────────────────────────
    // persistence
    // ─────────────────────────────────────────────────────────────

    #[test]
    fn emulated_indexes_are_mirrored_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = IndexManager::new(IndexBuildMode::Immediate).persist_to(dir.path());
        m.register(def("tags", false), Delegation::Emulated, vec![doc("1", json!({ "tags": ["x"] }))])
            .unwrap();
        m.apply_put("items", &doc("2", json!({ "tags": ["x", "y"] }))).unwrap();

        let file = index_file(dir.path(), &def("tags", false));
        assert!(file.ends_with("idx_items__tags.index.json"));
        let saved: PersistedIndex = serde_json::from_slice(&fs::read(&file).unwrap()).unwrap();
        assert_eq!(saved.definition.path().as_str(), "tags");
        assert_eq!(saved.entries.len(), 2);

        m.drop_index("items", &path("tags")).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn failed_mirror_write_marks_every_index_of_the_collection_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = IndexManager::new(IndexBuildMode::Immediate).persist_to(dir.path());
        let docs = vec![doc("a", json!({ "a": 1, "b": 1 }))];
        m.register(def("a", false), Delegation::Emulated, docs.clone()).unwrap();
        m.register(def("b", false), Delegation::Emulated, docs.clone()).unwrap();

        // a directory where the temp file goes makes the write fail
        let blocker = index_file(dir.path(), &def("b", false)).with_extension("json.tmp");
        fs::create_dir(&blocker).unwrap();

        assert!(m.apply_put("items", &doc("c", json!({ "a": 2, "b": 2 }))).is_err());
        assert_eq!(m.state("items", &path("a")), IndexState::Building);
        assert_eq!(m.state("items", &path("b")), IndexState::Building);
        assert_eq!(candidate_keys(&m, eq("a", json!(1))), None);

        // a rebuild that cannot be mirrored stays pending
        assert!(m.rebuild_stale("items", &docs).is_err());
        assert!(m.has_stale("items"));
        assert_eq!(m.state("items", &path("b")), IndexState::Building);

        fs::remove_dir(&blocker).unwrap();
        m.rebuild_stale("items", &docs).unwrap();
        assert_eq!(m.state("items", &path("a")), IndexState::Active);
        assert_eq!(m.state("items", &path("b")), IndexState::Active);
        assert_eq!(candidate_keys(&m, eq("b", json!(2))), Some(vec![]));
    }

    fn restored(dir: &Path, docs: &[Document]) -> IndexManager {
        let mut m = IndexManager::new(IndexBuildMode::Incremental { batch: 1 }).persist_to(dir);
        assert_eq!(m.restore(def("n", false), docs).unwrap(), IndexState::Active);
        assert_eq!(m.mode(), IndexBuildMode::Incremental { batch: 1 });
        m
    }

    #[test]
    fn restore_adopts_an_agreeing_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let docs = vec![doc("a", json!({ "n": 1 })), doc("b", json!({ "n": [1, 2] }))];
        {
            let mut m = IndexManager::new(IndexBuildMode::Immediate).persist_to(dir.path());
            m.register(def("n", false), Delegation::Emulated, docs.clone()).unwrap();
        }
        let m = restored(dir.path(), &docs);
        assert_eq!(candidate_keys(&m, eq("n", json!(1))), Some(vec!["a".into()]));
        let contains = IndexConstraint::Contains {
            path: path("n"),
            value: json!(2),
        };
        assert_eq!(candidate_keys(&m, contains), Some(vec!["b".into()]));
    }

    #[test]
    fn restore_rebuilds_an_outdated_mirror() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut m = IndexManager::new(IndexBuildMode::Immediate).persist_to(dir.path());
            m.register(def("n", false), Delegation::Emulated, vec![doc("a", json!({ "n": 1 }))])
                .unwrap();
        }
        let m = restored(dir.path(), &[doc("a", json!({ "n": 2 }))]);
        assert_eq!(candidate_keys(&m, eq("n", json!(2))), Some(vec!["a".into()]));
        assert_eq!(candidate_keys(&m, eq("n", json!(1))), Some(vec![]));
    }

    #[test]
    fn restore_survives_corrupt_and_missing_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let file = index_file(dir.path(), &def("n", false));
        let docs = [doc("a", json!({ "n": 1 }))];

        fs::write(&file, b"{ not json").unwrap();
        let m = restored(dir.path(), &docs);
        assert_eq!(candidate_keys(&m, eq("n", json!(1))), Some(vec!["a".into()]));
        // the rebuilt mirror replaced the corrupt one
        let saved: PersistedIndex = serde_json::from_slice(&fs::read(&file).unwrap()).unwrap();
        assert_eq!(saved.entries.len(), 1);

        fs::remove_file(&file).unwrap();
        let m = restored(dir.path(), &docs);
        assert_eq!(candidate_keys(&m, eq("n", json!(1))), Some(vec!["a".into()]));
        assert!(file.exists());
    }

    #[test]
    fn restore_rejects_duplicates_under_a_unique_definition() {
        let mut m = IndexManager::new(IndexBuildMode::Immediate);
        let docs = [doc("a", json!({ "e": 1 })), doc("b", json!({ "e": 1 }))];
        assert!(matches!(
            m.restore(def("e", true), &docs),
            Err(Error::UniqueViolation { .. })
        ));
        assert!(!m.contains("items", &path("e")));
    }
}
