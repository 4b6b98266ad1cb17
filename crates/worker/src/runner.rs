//! Single-job lifecycle: progress merges, tool invocation, result
//! collection, and the one terminal status commit.
//!
//! [`JobRunner::run`] writes best-effort progress merges (5, 25, 75) and
//! finishes with exactly one atomic `replace`: success with
//! `result_refs`, or failure with a structured `error`. Every error is
//! converted to the failure record in one place, after the pipeline
//! returns.

use std::collections::BTreeMap;
use std::error::Error as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lipid_core::error::CoreError;
use lipid_core::job::{Mode, Stage};
use lipid_core::status::{FailureInfo, StatusStore, StatusStoreError, StatusUpdate};
use lipid_core::storage::{ObjectStore, StorageError, StorageUri};

use crate::collector::{list_output_files, CollectError, ResultCollector};
use crate::config::ConfigError;
use crate::processor::{Processor, ProcessorError, ToolProfile};

/// File name used for the downloaded input when the URI has none.
const FALLBACK_INPUT_NAME: &str = "input";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tool profile per processing mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeProfiles {
    pub high_res: ToolProfile,
    pub low_res: ToolProfile,
}

impl ModeProfiles {
    pub fn for_mode(&self, mode: Mode) -> &ToolProfile {
        match mode {
            Mode::HighRes => &self.high_res,
            Mode::LowRes => &self.low_res,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Parent of the per-run temporary work directory. `None` uses the
    /// system temp dir.
    pub work_dir: Option<PathBuf>,
    pub profiles: ModeProfiles,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a job run failed. Each variant maps to the `kind` stored in the
/// failure record.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Unknown mode or malformed input URI.
    #[error(transparent)]
    Config(#[from] CoreError),

    /// Missing or invalid worker settings for this job.
    #[error(transparent)]
    Settings(#[from] ConfigError),

    #[error("Failed to fetch input {uri}: {source}")]
    InputFetch {
        uri: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Processing(#[from] ProcessorError),

    #[error("Segmentation tool produced no usable output")]
    NoOutput,

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error("Failed to commit job result: {0}")]
    Commit(#[source] StatusStoreError),

    #[error("Work directory error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Failure category written to `error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Settings(_) => "configuration",
            Self::InputFetch { .. } => "input_fetch",
            Self::Processing(_) | Self::NoOutput => "processing",
            Self::Collect(CollectError::Upload { .. }) => "upload",
            Self::Collect(_) | Self::Io(_) => "io",
            Self::Commit(_) => "commit",
        }
    }

    /// Diagnostic detail for `error.trace`: the tool's own output when it
    /// ran, otherwise the chain of underlying causes.
    pub fn trace(&self) -> String {
        if let Self::Processing(err) = self {
            if let Some(output) = err.captured_output() {
                return output.to_string();
            }
        }
        let mut causes = Vec::new();
        let mut source = self.source();
        while let Some(err) = source {
            causes.push(err.to_string());
            source = err.source();
        }
        causes.join("\ncaused by: ")
    }

    /// Bounded failure record for the terminal commit.
    pub fn to_failure(&self) -> FailureInfo {
        FailureInfo::new(self.kind(), &self.to_string(), &self.trace())
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Writes progress merges, never letting `pct` go backwards.
struct ProgressTracker<'a> {
    job_id: &'a str,
    store: &'a dyn StatusStore,
    last_pct: u8,
}

impl<'a> ProgressTracker<'a> {
    fn new(job_id: &'a str, store: &'a dyn StatusStore) -> Self {
        Self {
            job_id,
            store,
            last_pct: 0,
        }
    }

    /// Highest progress written so far, `None` before the first update.
    fn last_pct(&self) -> Option<u8> {
        (self.last_pct > 0).then_some(self.last_pct)
    }

    /// Best-effort: a failed merge is logged and the run continues.
    async fn advance(&mut self, stage: Stage) {
        let Some(pct) = stage.progress() else {
            return;
        };
        if pct < self.last_pct {
            tracing::warn!(job_id = self.job_id, ?stage, pct, last = self.last_pct, "Ignoring progress regression");
            return;
        }
        self.last_pct = pct;

        let fields = StatusUpdate::Running { stage, pct }.into_document();
        match self.store.merge(self.job_id, &fields).await {
            Ok(()) => tracing::info!(job_id = self.job_id, ?stage, pct, "Progress"),
            Err(e) => tracing::warn!(
                job_id = self.job_id,
                ?stage,
                pct,
                error = %e,
                "Progress update failed, continuing",
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct JobRunner {
    objects: Arc<dyn ObjectStore>,
    statuses: Arc<dyn StatusStore>,
    processor: Arc<dyn Processor>,
    collector: ResultCollector,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        statuses: Arc<dyn StatusStore>,
        processor: Arc<dyn Processor>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            collector: ResultCollector::new(Arc::clone(&objects)),
            objects,
            statuses,
            processor,
            config,
        }
    }

    /// Run one job to completion.
    ///
    /// On success returns the committed `result_refs`. On failure the
    /// failure record has already been written (or its write was logged
    /// as failed) and the original error is returned.
    pub async fn run(
        &self,
        job_id: &str,
        mode: &str,
        input_uri: &str,
    ) -> Result<BTreeMap<String, String>, JobError> {
        tracing::info!(job_id, mode, input_uri, "Job started");
        let mut progress = ProgressTracker::new(job_id, self.statuses.as_ref());

        match self.execute(job_id, mode, input_uri, &mut progress).await {
            Ok(refs) => {
                tracing::info!(job_id, outputs = refs.len(), "Job succeeded");
                Ok(refs)
            }
            Err(err) => {
                let last_pct = progress.last_pct();
                record_failure(self.statuses.as_ref(), job_id, &err, last_pct).await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        job_id: &str,
        mode: &str,
        input_uri: &str,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<BTreeMap<String, String>, JobError> {
        progress.advance(Stage::Prepare).await;
        progress.advance(Stage::Segmentation).await;

        let mode = Mode::from_name(mode)?;
        let input = StorageUri::parse(input_uri)?;
        let profile = self.config.profiles.for_mode(mode);

        let work = self.create_work_dir().await?;
        let input_dir = work.path().join("input");
        let out_dir = work.path().join("output");
        tokio::fs::create_dir_all(&input_dir).await?;
        tokio::fs::create_dir_all(&out_dir).await?;

        let input_path = self.fetch_input(&input, &input_dir).await?;

        self.processor.invoke(&input_path, &out_dir, profile).await?;
        if list_output_files(&out_dir)?.is_empty() {
            return Err(JobError::NoOutput);
        }
        progress.advance(Stage::Processing).await;

        let result_refs = self.collector.collect(&out_dir, job_id, input_uri).await?;

        let fields = StatusUpdate::Succeeded {
            result_refs: result_refs.clone(),
        }
        .into_document();
        self.statuses
            .replace(job_id, &fields)
            .await
            .map_err(JobError::Commit)?;

        Ok(result_refs)
    }

    async fn fetch_input(&self, input: &StorageUri, dir: &Path) -> Result<PathBuf, JobError> {
        let bytes = self
            .objects
            .get(input)
            .await
            .map_err(|source| JobError::InputFetch {
                uri: input.to_string(),
                source,
            })?;

        let name = input
            .file_name()
            .filter(|n| *n != "." && *n != "..")
            .unwrap_or(FALLBACK_INPUT_NAME);
        let path = dir.join(name);
        tokio::fs::write(&path, &bytes).await?;

        tracing::info!(uri = %input, path = %path.display(), size = bytes.len(), "Downloaded input");
        Ok(path)
    }

    async fn create_work_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("lipid-job-");
        match &self.config.work_dir {
            Some(base) => {
                tokio::fs::create_dir_all(base).await?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
    }
}

/// Write the terminal failure record for `job_id`.
///
/// `last_pct` is the progress reached before the error, `None` if the job
/// never started. A failed write is logged; the caller still reports `err`.
pub async fn record_failure(
    statuses: &dyn StatusStore,
    job_id: &str,
    err: &JobError,
    last_pct: Option<u8>,
) {
    let failure = err.to_failure();
    tracing::error!(job_id, kind = %failure.kind, error = %err, "Job failed");

    let fields = StatusUpdate::Failed {
        error: failure,
        pct: last_pct,
    }
    .into_document();
    if let Err(e) = statuses.replace(job_id, &fields).await {
        tracing::error!(job_id, error = %e, "Failed to record job failure");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
