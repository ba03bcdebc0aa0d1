//! Backend abstraction, query compiler and index manager for blitzdb.
//!
//! Application code talks to [`Store`]; a [`backend::BackendAdapter`]
//! translates document operations into one engine's native operations.

pub mod backend;
pub mod index;
pub mod mql;
pub mod store;

pub use backend::{BackendAdapter, BackendKind, Cursor, Delegation};
pub use index::{IndexBuildMode, IndexInfo, IndexManager};
pub use mql::{CmpOp, CompiledQuery, FieldExpr, Filter, Query, SortDir};
pub use store::{SharedStore, Store, StoreOptions};

use domain::{DocumentError, Key};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// `key` is `None` when a filter (not a key) found nothing.
    #[error("no document{} in {collection}", describe_key(.key))]
    NotFound {
        collection: String,
        key: Option<Key>,
    },

    #[error("document {key} already exists in {collection}")]
    DuplicateKey { collection: String, key: Key },

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("type mismatch on {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    /// Emulated index disagreed with the source collection. Recovered inside
    /// the store and never returned to callers.
    #[error("index on {collection}.{path} is inconsistent")]
    IndexInconsistent { collection: String, path: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unique index {index} on {collection} rejects the write")]
    UniqueViolation { collection: String, index: String },

    #[error("document key {found} does not match {expected}")]
    KeyMismatch { expected: Key, found: Key },

    #[error("{count} documents match in {collection}, expected one")]
    MultipleResults { collection: String, count: usize },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid operator: {0}")]
    InvalidOperator(String),

    #[error("invalid sort spec: {0}")]
    InvalidSort(String),

    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("index on {collection}.{path} already exists")]
    IndexExists { collection: String, path: String },

    #[error("no index on {collection}.{path}")]
    UnknownIndex { collection: String, path: String },

    #[error("transaction: {0}")]
    Transaction(String),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    #[inline]
    pub fn not_found(collection: &str, key: &Key) -> Self {
        Error::NotFound {
            collection: collection.to_string(),
            key: Some(key.clone()),
        }
    }

    #[inline]
    pub fn duplicate(collection: &str, key: &Key) -> Self {
        Error::DuplicateKey {
            collection: collection.to_string(),
            key: key.clone(),
        }
    }

    #[inline]
    pub fn backend(msg: impl Into<String>) -> Self {
        Error::Backend(msg.into())
    }

    pub fn no_match(collection: &str) -> Self {
        Error::NotFound {
            collection: collection.to_string(),
            key: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

fn describe_key(key: &Option<Key>) -> String {
    key.as_ref().map(|k| format!(" with key {k}")).unwrap_or_default()
}
