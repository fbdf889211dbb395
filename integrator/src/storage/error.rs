use crate::core::CoreError;
use thiserror::Error;

/// Storage layer error type.
///
/// Covers durable blob access, graph file encoding and the buffer
/// invariants of the graph object stores.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// An I/O operation on a blob failed.
    #[error("I/O error on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The requested blob does not exist.
    #[error("blob not found: {path}")]
    NotFound { path: String },

    /// A blob path escapes the storage root or is otherwise unusable.
    #[error("invalid blob path: {path}")]
    InvalidPath { path: String },

    /// A free-form property reuses a reserved field name, so the object
    /// could not be decoded once written.
    #[error("object _key={key} has a property named like the reserved field {property}")]
    ReservedProperty { key: String, property: String },

    /// An object selected for flushing is missing from the `_type` index.
    /// This is a broken buffer invariant, not a user error.
    #[error("object _key={key} is missing from the _type index for {object_type}")]
    MissingIndexEntry { key: String, object_type: String },

    /// The on-disk location index points at a file that does not hold the object.
    #[error("graph file {path} has no object at position {index}")]
    CorruptLocation { path: String, index: usize },
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
