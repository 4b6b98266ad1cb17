//! In-process status store that keeps a log of every write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{StatusDocument, StatusStore, StatusStoreError};

/// Which operation produced a logged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Merge,
    Replace,
}

/// One successfully applied write, as sent by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusWrite {
    pub job_id: String,
    pub kind: WriteKind,
    pub fields: StatusDocument,
}

/// Status store backed by a `HashMap`.
///
/// Rejected writes are not applied and not logged, mirroring an atomic
/// backend where a failed request leaves no trace.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    records: Mutex<HashMap<String, StatusDocument>>,
    writes: Mutex<Vec<StatusWrite>>,
    fail_merges: AtomicBool,
    fail_replaces: AtomicUsize,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent `merge`.
    pub fn fail_merges(&self) {
        self.fail_merges.store(true, Ordering::SeqCst);
    }

    /// Reject the next `count` calls to `replace`.
    pub fn fail_next_replaces(&self, count: usize) {
        self.fail_replaces.store(count, Ordering::SeqCst);
    }

    /// Applied writes in order.
    pub fn writes(&self) -> Vec<StatusWrite> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Applied writes for one job that carry a terminal status.
    pub fn terminal_writes(&self, job_id: &str) -> Vec<StatusWrite> {
        self.writes()
            .into_iter()
            .filter(|w| w.job_id == job_id && w.fields.is_terminal())
            .collect()
    }

    /// Every `pct` value written for `job_id`, in order.
    pub fn pct_history(&self, job_id: &str) -> Vec<u8> {
        self.writes()
            .into_iter()
            .filter(|w| w.job_id == job_id)
            .filter_map(|w| w.fields.pct)
            .collect()
    }

    fn apply(&self, job_id: &str, kind: WriteKind, fields: &StatusDocument) {
        let now = chrono::Utc::now();
        let mut stamped = fields.clone();
        stamped.updated_at = Some(now);
        stamped.finished_at = None;
        if kind == WriteKind::Replace && fields.is_success() {
            stamped.finished_at = Some(now);
        }

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match kind {
            WriteKind::Merge => records
                .entry(job_id.to_string())
                .or_default()
                .merge_from(&stamped),
            WriteKind::Replace => {
                records.insert(job_id.to_string(), stamped);
            }
        }

        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StatusWrite {
                job_id: job_id.to_string(),
                kind,
                fields: fields.clone(),
            });
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn merge(&self, job_id: &str, fields: &StatusDocument) -> Result<(), StatusStoreError> {
        if self.fail_merges.load(Ordering::SeqCst) {
            return Err(StatusStoreError::backend("injected merge failure"));
        }
        self.apply(job_id, WriteKind::Merge, fields);
        Ok(())
    }

    async fn replace(
        &self,
        job_id: &str,
        fields: &StatusDocument,
    ) -> Result<(), StatusStoreError> {
        let rejected = self
            .fail_replaces
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StatusStoreError::backend("injected replace failure"));
        }
        self.apply(job_id, WriteKind::Replace, fields);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<StatusDocument>, StatusStoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
