use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("value at {path:?} is not an object")]
    NotAnObject { path: String },

    #[error("invalid field name: {0:?}")]
    InvalidFieldName(String),

    #[error("invalid field path: {0:?}")]
    InvalidPath(String),

    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}
