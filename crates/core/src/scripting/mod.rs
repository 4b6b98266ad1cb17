//! Subprocess execution for external analysis tools.
//!
//! [`subprocess::run_merged`] spawns a prepared [`tokio::process::Command`],
//! captures stdout and stderr into one interleaved buffer, and optionally
//! enforces a wall-clock limit.

pub mod subprocess;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Stdout and stderr lines in arrival order.
    pub output: String,
    /// Process exit code (`-1` if killed by a signal).
    pub exit_code: i32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors that prevent a subprocess from producing a [`CommandOutput`].
#[derive(Debug)]
pub enum SubprocessError {
    /// The program could not be started.
    Spawn(std::io::Error),
    /// The process exceeded its timeout and was killed.
    Timeout {
        elapsed_ms: u64,
        /// Output captured before the process was killed.
        output: String,
    },
    /// Waiting on the process failed.
    Io(std::io::Error),
}

impl fmt::Display for SubprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(err) => write!(f, "Failed to spawn process: {err}"),
            Self::Timeout { elapsed_ms, .. } => {
                write!(f, "Process timed out after {elapsed_ms}ms")
            }
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for SubprocessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(err) | Self::Io(err) => Some(err),
            Self::Timeout { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
