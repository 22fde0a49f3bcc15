//! Error types and result types for model operations.
//!
//! Every fallible operation in this crate returns [`ModelResult<T>`]. The first error raised
//! during a call aborts the remaining steps of that call and is handed back to the caller
//! unchanged; nothing in this crate retries.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors raised while resolving, executing or persisting model operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// A schema definition is malformed, a requested hook or virtual is unknown, or a
    /// dependency chain loops back on itself. Raised before any storage I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A document failed validation (missing required field, wrong type, rejected setter value).
    #[error("Validation error: {0}")]
    Validation(String),
    /// A relationship names a target model that is not registered on the connection.
    #[error("Resolution error: {0}")]
    Resolution(String),
    /// A hook handler rejected the operation.
    #[error("Hook error: {0}")]
    Hook(String),
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// A document with the given ID already exists in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document {0} already exists in collection {1}")]
    DocumentAlreadyExists(String, String),
    /// The requested document was not found in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document not found {0} in collection {1}")]
    DocumentNotFound(String, String),
    /// The requested collection does not exist in the store.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
    /// An unknown error occurred.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ModelError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        ModelError::Configuration(message.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        ModelError::Validation(message.into())
    }
}

/// A specialized `Result` type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

impl From<BsonError> for ModelError {
    fn from(err: BsonError) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for ModelError {
    fn from(err: SerdeJsonError) -> Self {
        ModelError::Serialization(err.to_string())
    }
}
