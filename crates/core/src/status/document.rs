//! Wire-level status document and the typed updates that produce it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::{JobState, Stage, PCT_DONE};
use crate::types::Timestamp;

/// Upper bound on `error.message` and `error.trace`, in characters.
pub const MAX_TRACE_CHARS: usize = 2000;

/// Persisted job status record, keyed by job id.
///
/// Every field is optional and absent fields are skipped on
/// serialization, so a partial document merged into an existing record
/// can only add or overwrite fields, never clear them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pct: Option<u8>,
    /// Relative output path -> storage URI. Present only on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_refs: Option<BTreeMap<String, String>>,
    /// Present only on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
    /// Assigned by the status store on every write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
    /// Assigned by the status store on the success commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

impl StatusDocument {
    /// Overlay every field that is set in `partial` onto `self`.
    pub fn merge_from(&mut self, partial: &StatusDocument) {
        if partial.status.is_some() {
            self.status = partial.status;
        }
        if partial.stage.is_some() {
            self.stage = partial.stage;
        }
        if partial.pct.is_some() {
            self.pct = partial.pct;
        }
        if let Some(refs) = &partial.result_refs {
            self.result_refs = Some(refs.clone());
        }
        if let Some(error) = &partial.error {
            self.error = Some(error.clone());
        }
        if partial.updated_at.is_some() {
            self.updated_at = partial.updated_at;
        }
        if partial.finished_at.is_some() {
            self.finished_at = partial.finished_at;
        }
    }

    /// Whether this document carries a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(JobState::is_terminal)
    }

    /// Whether this document commits a successful outcome.
    pub fn is_success(&self) -> bool {
        self.status == Some(JobState::Succeeded)
    }
}

/// Structured failure recorded on the status document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Error category (`configuration`, `input_fetch`, `processing`, ...).
    pub kind: String,
    pub message: String,
    /// Tail of the tool output or error chain, bounded by [`MAX_TRACE_CHARS`].
    pub trace: String,
}

impl FailureInfo {
    /// Build a failure record, keeping only the last [`MAX_TRACE_CHARS`]
    /// characters of `message` and `trace`.
    pub fn new(kind: impl Into<String>, message: &str, trace: &str) -> Self {
        Self {
            kind: kind.into(),
            message: tail_chars(message, MAX_TRACE_CHARS).to_string(),
            trace: tail_chars(trace, MAX_TRACE_CHARS).to_string(),
        }
    }
}

/// The last `max` characters of `s`, split on a char boundary.
pub fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

/// Typed status transition emitted by the job runner.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Progress merge while the job is running.
    Running { stage: Stage, pct: u8 },
    /// Terminal success commit.
    Succeeded {
        result_refs: BTreeMap<String, String>,
    },
    /// Terminal failure commit. `pct` is the last progress reached, if any.
    Failed { error: FailureInfo, pct: Option<u8> },
}

impl StatusUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }

    /// Flatten into the wire document.
    ///
    /// Terminal documents are complete: a success carries no `error` and a
    /// failure carries no `result_refs`.
    pub fn into_document(self) -> StatusDocument {
        match self {
            Self::Running { stage, pct } => StatusDocument {
                status: Some(JobState::Running),
                stage: Some(stage),
                pct: Some(pct),
                ..Default::default()
            },
            Self::Succeeded { result_refs } => StatusDocument {
                status: Some(JobState::Succeeded),
                stage: Some(Stage::Done),
                pct: Some(PCT_DONE),
                result_refs: Some(result_refs),
                ..Default::default()
            },
            Self::Failed { error, pct } => StatusDocument {
                status: Some(JobState::Failed),
                stage: Some(Stage::Error),
                pct,
                error: Some(error),
                ..Default::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
