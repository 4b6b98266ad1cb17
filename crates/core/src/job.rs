//! Job model: processing modes, lifecycle states, and pipeline stages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::JobId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Progress reported when the job starts.
pub const PCT_PREPARE: u8 = 5;

/// Progress reported right before the segmentation tool is invoked.
pub const PCT_SEGMENTATION: u8 = 25;

/// Progress reported once the tool has exited successfully.
pub const PCT_PROCESSING: u8 = 75;

/// Progress carried by the success commit.
pub const PCT_DONE: u8 = 100;

/// Mode selector values accepted from the scheduler.
pub const VALID_MODES: &[&str] = &["40X", "20X"];

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Processing variant selected per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// `40X`: high-resolution pipeline.
    HighRes,
    /// `20X`: low-resolution pipeline.
    LowRes,
}

impl Mode {
    /// Parse the scheduler-supplied mode selector.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        match name {
            "40X" => Ok(Self::HighRes),
            "20X" => Ok(Self::LowRes),
            other => Err(CoreError::UnknownMode(other.to_string())),
        }
    }

    /// Wire value of the mode selector.
    pub fn name(self) -> &'static str {
        match self {
            Self::HighRes => "40X",
            Self::LowRes => "20X",
        }
    }
}

impl FromStr for Mode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Outcome-level status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Coarse position of a job within the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Prepare,
    Segmentation,
    Processing,
    Done,
    Error,
}

impl Stage {
    /// Progress percentage associated with the stage.
    ///
    /// `Error` has none: a failed job keeps the last percentage it reached.
    pub fn progress(self) -> Option<u8> {
        match self {
            Self::Prepare => Some(PCT_PREPARE),
            Self::Segmentation => Some(PCT_SEGMENTATION),
            Self::Processing => Some(PCT_PROCESSING),
            Self::Done => Some(PCT_DONE),
            Self::Error => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Job parameters
// ---------------------------------------------------------------------------

/// Parameters of a single job execution as handed over by the scheduler.
///
/// `mode` and `input_uri` stay raw strings here; the runner validates them
/// so that invalid values end up in the failure record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub job_id: JobId,
    pub mode: String,
    pub input_uri: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
