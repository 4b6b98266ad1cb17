//! External segmentation tool adapter.
//!
//! [`QuPathProcessor`] turns a [`ToolProfile`] plus the per-job input and
//! output paths into a headless QuPath command line, runs it through
//! [`lipid_core::scripting::subprocess::run_merged`], and converts a
//! non-zero exit into [`ProcessorError::ExitStatus`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use lipid_core::scripting::subprocess::run_merged;
use lipid_core::scripting::{CommandOutput, SubprocessError};

/// Fixed per-deployment settings for one processing variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolProfile {
    /// Executable to launch (e.g. `qupath`).
    pub program: String,
    /// Groovy pipeline script.
    pub script: PathBuf,
    /// Pixel classifier / model file.
    pub classifier: PathBuf,
    pub export_geojson: bool,
    pub export_mask: bool,
    /// Downsample factor applied by the pipeline script.
    pub downsample: u32,
}

impl ToolProfile {
    /// The `key=value;...` string passed to the script via `--args`.
    pub fn script_args(&self, out_dir: &Path) -> String {
        [
            format!("out={}", out_dir.display()),
            format!("classifier={}", self.classifier.display()),
            format!("export_geojson={}", self.export_geojson),
            format!("export_mask={}", self.export_mask),
            format!("ds={}", self.downsample),
        ]
        .join(";")
    }

    /// Full argument vector (without the program itself).
    pub fn command_args(&self, input: &Path, out_dir: &Path) -> Vec<OsString> {
        vec![
            "script".into(),
            "--image".into(),
            input.as_os_str().to_owned(),
            "--script".into(),
            self.script.as_os_str().to_owned(),
            "--args".into(),
            self.script_args(out_dir).into(),
        ]
    }
}

/// Errors from invoking the external tool.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {exit_code}")]
    ExitStatus {
        program: String,
        exit_code: i32,
        /// Combined stdout/stderr of the failed run.
        output: String,
    },

    #[error("{program} timed out after {elapsed_ms}ms")]
    Timeout {
        program: String,
        elapsed_ms: u64,
        output: String,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessorError {
    /// Tool output captured before the failure, if the process ran at all.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::ExitStatus { output, .. } | Self::Timeout { output, .. } => Some(output),
            Self::Spawn { .. } | Self::Io { .. } => None,
        }
    }
}

/// Runs the segmentation tool for one job.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process `input`, writing all results under `out_dir`.
    ///
    /// Returns the captured output of a successful (exit code 0) run.
    async fn invoke(
        &self,
        input: &Path,
        out_dir: &Path,
        profile: &ToolProfile,
    ) -> Result<CommandOutput, ProcessorError>;
}

/// Headless QuPath invocation.
#[derive(Debug, Clone, Default)]
pub struct QuPathProcessor {
    timeout: Option<Duration>,
}

impl QuPathProcessor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Processor for QuPathProcessor {
    async fn invoke(
        &self,
        input: &Path,
        out_dir: &Path,
        profile: &ToolProfile,
    ) -> Result<CommandOutput, ProcessorError> {
        let program = profile.program.clone();
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|source| ProcessorError::Io {
                program: program.clone(),
                source,
            })?;

        let args = profile.command_args(input, out_dir);
        tracing::info!(program = %program, args = ?args, "Running segmentation tool");

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args);

        let output = run_merged(&mut cmd, self.timeout)
            .await
            .map_err(|e| match e {
                SubprocessError::Spawn(source) => ProcessorError::Spawn {
                    program: program.clone(),
                    source,
                },
                SubprocessError::Timeout { elapsed_ms, output } => ProcessorError::Timeout {
                    program: program.clone(),
                    elapsed_ms,
                    output,
                },
                SubprocessError::Io(source) => ProcessorError::Io {
                    program: program.clone(),
                    source,
                },
            })?;

        if !output.success() {
            tracing::warn!(
                program = %program,
                exit_code = output.exit_code,
                duration_ms = output.duration_ms,
                "Segmentation tool failed",
            );
            return Err(ProcessorError::ExitStatus {
                program,
                exit_code: output.exit_code,
                output: output.output,
            });
        }

        tracing::info!(
            program = %program,
            duration_ms = output.duration_ms,
            "Segmentation tool finished",
        );
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
