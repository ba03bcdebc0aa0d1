// crates/domain/src/path.rs

use crate::error::DocumentError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

static IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// Reserved top-level names (primary key and revision slots in Mongo).
pub const RESERVED_FIELDS: [&str; 2] = ["_id", "_rev"];

/// Collection names double as SQL table names, Mongo collection names and
/// file names, so they are restricted to plain identifiers.
pub fn validate_collection(name: &str) -> Result<(), DocumentError> {
    if IDENT.is_match(name) && !name.starts_with("__") {
        Ok(())
    } else {
        Err(DocumentError::InvalidCollection(name.to_string()))
    }
}

/// A single field name inside a document (any nesting level).
pub fn validate_field_name(name: &str) -> Result<(), DocumentError> {
    if name.is_empty() || name.contains('.') || name.starts_with('$') {
        return Err(DocumentError::InvalidFieldName(name.to_string()));
    }
    Ok(())
}

/// Plain identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(s: &str) -> bool {
    IDENT.is_match(s)
}

// ─────────────────────────────────────────────────────────────────────────────
// FieldPath
// ─────────────────────────────────────────────────────────────────────────────

/// A validated dotted path into a document, e.g. `"meta.lang"`.
///
/// Segments address object keys only; array positions are not addressable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(String);

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, DocumentError> {
        if path.is_empty() {
            return Err(DocumentError::InvalidPath(path.to_string()));
        }
        for seg in path.split('.') {
            if seg.is_empty() || seg.starts_with('$') {
                return Err(DocumentError::InvalidPath(path.to_string()));
            }
        }
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> SmallVec<[&str; 4]> {
        self.0.split('.').collect()
    }

    pub fn is_top_level(&self) -> bool {
        !self.0.contains('.')
    }

    /// True when every segment is a plain identifier, which makes the path
    /// safe to embed as a literal in native query text.
    pub fn is_identifier(&self) -> bool {
        self.0.split('.').all(is_identifier)
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = DocumentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldPath::parse(&value)
    }
}

impl TryFrom<&str> for FieldPath {
    type Error = DocumentError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        FieldPath::parse(value)
    }
}

impl From<FieldPath> for String {
    fn from(p: FieldPath) -> Self {
        p.0
    }
}
