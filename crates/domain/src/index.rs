// crates/domain/src/index.rs

use crate::error::DocumentError;
use crate::path::{validate_collection, FieldPath};
use serde::{Deserialize, Serialize};

/// Secondary index declaration for one field path of one collection.
///
/// The path never changes after creation; to re-point an index it has to be
/// dropped and created again. `delegated` records whether the active backend
/// enforces the index natively or the core emulates it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    collection: String,
    path: FieldPath,
    pub unique: bool,
    pub delegated: bool,
}

impl IndexDefinition {
    pub fn new(collection: &str, path: &str, unique: bool) -> Result<Self, DocumentError> {
        validate_collection(collection)?;
        Ok(Self {
            collection: collection.to_string(),
            path: FieldPath::parse(path)?,
            unique,
            delegated: false,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Stable native name, e.g. `idx_items__meta__lang`.
    ///
    /// Each part keeps ASCII alphanumerics, writes `.` as `__` and any other
    /// character (`_` included) as `_<hex>_`. Collection names never hold a
    /// dot, so the first `__` after `idx_` separates collection from path and
    /// distinct definitions never share a name.
    pub fn name(&self) -> String {
        format!("idx_{}__{}", encode(&self.collection), encode(self.path.as_str()))
    }
}

fn encode(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '.' => "__".to_string(),
            c if c.is_ascii_alphanumeric() => c.to_string(),
            c => format!("_{:x}_", c as u32),
        })
        .collect()
}

/// Lifecycle of an index on one (collection, field path):
/// `Unindexed → Building → Active`, `Active → Dropped`, and `Active →
/// Building` when a forced rebuild is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Unindexed,
    Building,
    Active,
    Dropped,
}
