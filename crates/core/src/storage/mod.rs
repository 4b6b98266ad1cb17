//! Object storage interface used to stage job inputs and outputs.
//!
//! [`ObjectStore`] is the seam between the worker and a concrete storage
//! SDK. This module ships two in-process backends: [`InMemoryObjectStore`]
//! for tests and dry runs, and [`LocalObjectStore`] which mirrors buckets
//! as directories for local development. The S3-compatible backend lives
//! in `lipid-cloud`.

pub mod local;
pub mod memory;
pub mod uri;

use async_trait::async_trait;

pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;
pub use uri::{join_key, StorageUri};

/// Errors raised by object store backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Wrap an arbitrary SDK error.
    pub fn backend(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Backend(err.into())
    }
}

/// Byte-blob storage addressed by URI.
///
/// Implementations must round-trip bytes exactly: what `put` stores is
/// what a later `get` of the returned URI yields.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download the object at `uri`.
    async fn get(&self, uri: &StorageUri) -> Result<Vec<u8>, StorageError>;

    /// Upload `bytes` under `key` in the results bucket and return the
    /// object's URI.
    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError>;
}
