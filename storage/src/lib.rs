mod backend;
mod engine;
mod validation;
mod versioning;

pub use backend::{Backend, CompactionPolicy, FileBackend, MemoryBackend, Namespace};
pub use engine::{ApplyOutcome, StorageEngine};
pub use validation::{validate_key, validate_value, Limits};
pub use versioning::{resolve, UpdateStamp, Value, VersionedValue};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a node. Ordering is byte-lexicographic and is part of
/// the stamp comparison rule, so it must never change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub live_keys: u64,
    pub tombstones: u64,
    pub value_bytes: u64,
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Storage log {0} is unusable after a failed write")]
    LogUnusable(String),

    #[error("Identity mismatch: persisted {persisted}, configured {configured}")]
    IdentityMismatch { persisted: String, configured: String },
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
