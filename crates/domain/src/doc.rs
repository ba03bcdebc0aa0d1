// crates/domain/src/doc.rs

use crate::error::DocumentError;
use crate::path::{validate_field_name, FieldPath, RESERVED_FIELDS};
use crate::value::values_equal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Key
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque primary key, unique within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Fresh random key (UUIDv4, simple form).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Document
// ─────────────────────────────────────────────────────────────────────────────

/// A stored record: primary key, field map and metadata.
///
/// The serde form is also the file backend's on-disk record, so
/// `from_value(to_value(d)) == d` holds for every document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection: Option<String>,
    #[serde(default, rename = "rev")]
    revision: u64,
    #[serde(default)]
    fields: Map<String, Json>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: Map<String, Json>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Build from a JSON object; anything else is rejected.
    pub fn from_json(value: Json) -> Result<Self, DocumentError> {
        match value {
            Json::Object(fields) => Ok(Self::from_fields(fields)),
            other => Err(DocumentError::InvalidDocument(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    // ───────────────────────────────
    // Builder-style setters
    // ───────────────────────────────

    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    // ───────────────────────────────
    // Accessors
    // ───────────────────────────────

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn fields(&self) -> &Map<String, Json> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Json> {
        self.fields
    }

    pub fn to_json(&self) -> Json {
        Json::Object(self.fields.clone())
    }

    /// Value at a dotted path, or `None` when any segment is missing.
    pub fn lookup(&self, path: &str) -> Option<&Json> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn get(&self, path: &str) -> Result<&Json, DocumentError> {
        self.lookup(path)
            .ok_or_else(|| DocumentError::FieldNotFound(path.to_string()))
    }

    /// Returns a copy with `value` stored at `path`; `self` is untouched.
    ///
    /// Missing intermediate objects are created. An intermediate segment that
    /// holds a non-object value is an error rather than being overwritten.
    pub fn set(&self, path: &str, value: Json) -> Result<Document, DocumentError> {
        let path = FieldPath::parse(path)?;
        let segments = path.segments();
        for seg in &segments {
            validate_field_name(seg)?;
        }

        let mut out = self.clone();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return Err(DocumentError::InvalidPath(path.to_string())),
        };

        let mut cursor = &mut out.fields;
        let mut walked = String::new();
        for seg in parents {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(seg);
            let slot = cursor
                .entry(seg.to_string())
                .or_insert_with(|| Json::Object(Map::new()));
            cursor = match slot {
                Json::Object(map) => map,
                _ => return Err(DocumentError::NotAnObject { path: walked }),
            };
        }
        cursor.insert(last.to_string(), value);
        Ok(out)
    }

    /// Structural equality: same key, collection and deep-equal fields
    /// (numbers compare by value, so `1` equals `1.0`). Revision is metadata
    /// and does not participate.
    pub fn equals(&self, other: &Document) -> bool {
        self.key == other.key
            && self.collection == other.collection
            && values_equal(
                &Json::Object(self.fields.clone()),
                &Json::Object(other.fields.clone()),
            )
    }

    /// Check field names at every nesting level.
    pub fn validate(&self) -> Result<(), DocumentError> {
        for name in self.fields.keys() {
            if RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(DocumentError::InvalidFieldName(name.clone()));
            }
        }
        validate_map(&self.fields)
    }
}

fn validate_map(map: &Map<String, Json>) -> Result<(), DocumentError> {
    for (name, value) in map {
        validate_field_name(name)?;
        validate_value(value)?;
    }
    Ok(())
}

fn validate_value(value: &Json) -> Result<(), DocumentError> {
    match value {
        Json::Object(map) => validate_map(map),
        Json::Array(items) => items.iter().try_for_each(validate_value),
        _ => Ok(()),
    }
}

impl TryFrom<Json> for Document {
    type Error = DocumentError;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Document::from_json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Document {
        Document::from_json(json!({
            "name": "a",
            "meta": { "lang": "en", "tags": ["x", "y"] },
            "n": 1
        }))
        .unwrap()
    }

    // ─────────────────────────────────────────────────────────────────────
    // get / lookup
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn get_resolves_nested_paths() {
        let d = sample();
        assert_eq!(d.get("name").unwrap(), &json!("a"));
        assert_eq!(d.get("meta.lang").unwrap(), &json!("en"));
        assert_eq!(d.get("meta.tags").unwrap(), &json!(["x", "y"]));
    }

    #[test]
    fn get_missing_field_is_field_not_found() {
        let d = sample();
        assert_eq!(
            d.get("meta.missing"),
            Err(DocumentError::FieldNotFound("meta.missing".into()))
        );
        // traversing through a scalar also misses
        assert!(d.get("name.inner").is_err());
        assert!(d.lookup("").is_none());
    }

    // ─────────────────────────────────────────────────────────────────────
    // set
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn set_returns_modified_copy() {
        let d = sample();
        let d2 = d.set("meta.lang", json!("de")).unwrap();
        assert_eq!(d.get("meta.lang").unwrap(), &json!("en"));
        assert_eq!(d2.get("meta.lang").unwrap(), &json!("de"));
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let d = Document::new().set("a.b.c", json!(1)).unwrap();
        assert_eq!(d.to_json(), json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn set_through_scalar_fails() {
        let d = sample();
        assert_eq!(
            d.set("name.first", json!("x")).unwrap_err(),
            DocumentError::NotAnObject {
                path: "name".into()
            }
        );
    }

    #[test]
    fn set_rejects_operator_segments() {
        assert!(sample().set("$inc", json!(1)).is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // equality / serde
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn equals_is_structural_and_numeric_aware() {
        let a = Document::from_json(json!({"n": 1, "v": [1, 2]}))
            .unwrap()
            .with_key("k");
        let b = Document::from_json(json!({"v": [1.0, 2], "n": 1.0}))
            .unwrap()
            .with_key("k")
            .with_revision(7);
        assert!(a.equals(&b));
        assert!(!a.equals(&b.clone().with_key("other")));
    }

    #[test]
    fn serde_round_trip_preserves_everything() {
        let d = sample()
            .with_key("k1")
            .with_collection("items")
            .with_revision(3);
        let encoded = serde_json::to_value(&d).unwrap();
        assert_eq!(encoded["rev"], json!(3));
        assert_eq!(encoded["key"], json!("k1"));
        let back: Document = serde_json::from_value(encoded).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn from_json_rejects_non_objects() {
        assert!(Document::from_json(json!([1, 2])).is_err());
        assert!(Document::try_from(json!("x")).is_err());
    }

    #[test]
    fn validate_rejects_reserved_and_dotted_names() {
        assert!(sample().validate().is_ok());
        let reserved = Document::from_json(json!({"_id": 1})).unwrap();
        assert!(reserved.validate().is_err());
        let nested = Document::from_json(json!({"a": [{"b.c": 1}]})).unwrap();
        assert!(nested.validate().is_err());
        let dollar = Document::from_json(json!({"a": {"$gt": 1}})).unwrap();
        assert!(dollar.validate().is_err());
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = Key::generate();
        let b = Key::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
