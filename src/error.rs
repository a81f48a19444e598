//! Error types for state_tree

use crate::model::Hash;
use thiserror::Error;

/// Result type alias for state_tree operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in state_tree operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Key is not equal to defined key length of {expected} (got {found})")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("Value cannot be empty")]
    InvalidValue,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Duplicate key in batch: {0}")]
    DuplicateKey(String),

    /// The store does not hold a node the tree points at. The root refers to
    /// data that is gone, so the store is corrupt.
    #[error("Node with hash {0} does not exist in the store")]
    MissingNode(Hash),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store file: {0}")]
    InvalidFile(String),

    #[error("Ref not found: {0}")]
    RefNotFound(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Config error: {0}")]
    Config(String),
}
