//! Backend adapters: one per storage engine, all behind [`BackendAdapter`].

pub mod file;
pub mod mongo;
pub mod sql;

pub use file::FileAdapter;
pub use mongo::{MongoAdapter, MongoExec, MongoExecError};
pub use sql::{SqlAdapter, SqlExec, SqlExecError, SqlRow, SqlValue};

use crate::mql::CompiledQuery;
use crate::{Error, Result};
use domain::{Document, FieldPath, IndexDefinition, Key};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Which native query form a backend executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    File,
    Sql,
    Mongo,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::File => "file",
            BackendKind::Sql => "sql",
            BackendKind::Mongo => "mongo",
        })
    }
}

/// Outcome of asking a backend to create an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delegation {
    /// The engine maintains it. Uniqueness is still checked by the store.
    Native,
    /// The core has to maintain it.
    Emulated,
}

/// Lazy, forward-only sequence of query results. Not restartable; errors
/// surface per item.
pub struct Cursor<'a> {
    inner: Box<dyn Iterator<Item = Result<Document>> + 'a>,
}

impl<'a> Cursor<'a> {
    pub fn new(inner: impl Iterator<Item = Result<Document>> + 'a) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub fn from_boxed(inner: Box<dyn Iterator<Item = Result<Document>> + 'a>) -> Self {
        Self { inner }
    }

    pub fn from_vec(docs: Vec<Document>) -> Self {
        Self::new(docs.into_iter().map(Ok))
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// Drain the cursor, stopping at the first error.
    pub fn collect_all(self) -> Result<Vec<Document>> {
        self.collect()
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Uniform contract over one storage engine.
///
/// Adapters assign keys (when absent) and revisions; the store layers index
/// maintenance, validation and type guards on top.
pub trait BackendAdapter: Send {
    fn kind(&self) -> BackendKind;

    /// Store a new document. Fails with `DuplicateKey` when the key exists
    /// and `overwrite` is false; with `overwrite` the revision continues
    /// from the replaced document.
    fn insert(&mut self, collection: &str, doc: Document, overwrite: bool) -> Result<Document>;

    /// Replace an existing document; `NotFound` when the key is absent.
    fn update(&mut self, collection: &str, key: &Key, doc: Document) -> Result<Document>;

    /// Returns whether a document was removed. With `strict`, a missing key
    /// is `NotFound` instead of `Ok(false)`.
    fn delete(&mut self, collection: &str, key: &Key, strict: bool) -> Result<bool>;

    fn fetch_by_key(&mut self, collection: &str, key: &Key) -> Result<Document>;

    fn execute_query<'a>(
        &'a mut self,
        collection: &str,
        query: &CompiledQuery,
    ) -> Result<Cursor<'a>>;

    fn count(&mut self, collection: &str, query: &CompiledQuery) -> Result<u64> {
        let mut n = 0;
        for doc in self.execute_query(collection, query)? {
            doc?;
            n += 1;
        }
        Ok(n)
    }

    fn create_index(&mut self, def: &IndexDefinition) -> Result<Delegation>;

    fn drop_index(&mut self, def: &IndexDefinition) -> Result<()>;

    /// Whether `create_index` on `path` would be delegated.
    fn supports_native_index(&self, path: &FieldPath) -> bool;

    fn drop_collection(&mut self, collection: &str) -> Result<()>;

    /// Directory for auxiliary files (persisted emulated indexes), if any.
    fn auxiliary_dir(&self) -> Option<&Path> {
        None
    }

    /// Index definitions recorded by `record_index`, including those of
    /// earlier sessions against the same database.
    fn load_catalog(&mut self) -> Result<Vec<IndexDefinition>>;

    /// Persist `def` in the catalog, replacing an entry of the same name.
    fn record_index(&mut self, def: &IndexDefinition) -> Result<()>;

    fn forget_index(&mut self, def: &IndexDefinition) -> Result<()>;

    /// Open a transaction; writes until `commit` or `rollback` belong to it.
    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    /// Undo every write since `begin`.
    fn rollback(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Rejects a compiled query built for another backend kind.
pub(crate) fn expect_target(query: &CompiledQuery, kind: BackendKind) -> Result<()> {
    if query.target() == kind {
        Ok(())
    } else {
        Err(Error::backend(format!(
            "query compiled for {} cannot run on {}",
            query.target(),
            kind
        )))
    }
}

/// Key for a document about to be stored: its own, or a fresh one.
pub(crate) fn key_for(doc: &Document) -> Key {
    doc.key().cloned().unwrap_or_else(Key::generate)
}

/// `update` must not silently re-key a document.
pub(crate) fn check_key(key: &Key, doc: &Document) -> Result<()> {
    match doc.key() {
        Some(found) if found != key => Err(Error::KeyMismatch {
            expected: key.clone(),
            found: found.clone(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_collects_and_stops_at_errors() {
        let docs = vec![Document::new().with_key("a"), Document::new().with_key("b")];
        assert_eq!(Cursor::from_vec(docs).collect_all().unwrap().len(), 2);

        let failing = Cursor::new(
            vec![
                Ok(Document::new()),
                Err(Error::BackendUnavailable("gone".into())),
            ]
            .into_iter(),
        );
        assert!(matches!(
            failing.collect_all(),
            Err(Error::BackendUnavailable(_))
        ));
        assert_eq!(Cursor::empty().count(), 0);
    }

    #[test]
    fn update_key_must_match() {
        let key = Key::from("k1");
        let doc = Document::from_json(json!({ "a": 1 })).unwrap();
        assert!(check_key(&key, &doc).is_ok());
        assert!(check_key(&key, &doc.clone().with_key("k1")).is_ok());
        assert!(matches!(
            check_key(&key, &doc.with_key("k2")),
            Err(Error::KeyMismatch { .. })
        ));
    }

    #[test]
    fn kinds_display_lowercase() {
        assert_eq!(BackendKind::Sql.to_string(), "sql");
        assert_eq!(serde_json::to_value(BackendKind::Mongo).unwrap(), json!("mongo"));
    }
}
