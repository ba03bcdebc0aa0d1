//! Storage-engine-neutral document model shared by every backend.

pub mod doc;
pub mod error;
pub mod index;
pub mod path;
pub mod value;

pub use doc::{Document, Key};
pub use error::DocumentError;
pub use index::{IndexDefinition, IndexState};
pub use path::{validate_collection, validate_field_name, FieldPath};
pub use value::ValueKind;
