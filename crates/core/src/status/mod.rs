//! Job status store interface.
//!
//! The runner issues partial merges while a job is running and exactly one
//! terminal write at the end. Both operations must be atomic and
//! linearizable per job id; timestamps are assigned by the store, never by
//! the caller.

pub mod document;
pub mod memory;

use async_trait::async_trait;

pub use document::{tail_chars, FailureInfo, StatusDocument, StatusUpdate, MAX_TRACE_CHARS};
pub use memory::{InMemoryStatusStore, StatusWrite, WriteKind};

/// Errors raised by status store backends.
#[derive(Debug, thiserror::Error)]
pub enum StatusStoreError {
    #[error("Status store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Status document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StatusStoreError {
    pub fn backend(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Backend(err.into())
    }
}

/// Persistent store of per-job status documents.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Non-destructive partial update: fields set in `fields` overwrite the
    /// stored ones, everything else is left untouched. Creates the record
    /// if it does not exist. Stamps `updated_at`.
    async fn merge(&self, job_id: &str, fields: &StatusDocument) -> Result<(), StatusStoreError>;

    /// Terminal write: the stored record becomes exactly `fields` in a
    /// single atomic update, so nothing from an earlier execution of the
    /// same job survives. Stamps `updated_at`, and `finished_at` when
    /// `fields` commits success.
    async fn replace(&self, job_id: &str, fields: &StatusDocument)
        -> Result<(), StatusStoreError>;

    /// Current record for `job_id`, if any.
    async fn get(&self, job_id: &str) -> Result<Option<StatusDocument>, StatusStoreError>;
}
