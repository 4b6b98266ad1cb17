//! End-to-end tests for [`JobRunner`] using in-memory stores and a fake
//! segmentation tool.
//!
//! Each test checks the terminal-commit protocol: exactly one terminal
//! write, non-decreasing progress, and the shape of the final record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use async_trait::async_trait;
use lipid_core::job::{JobState, Stage};
use lipid_core::manifest::Manifest;
use lipid_core::scripting::CommandOutput;
use lipid_core::status::{InMemoryStatusStore, StatusStore, WriteKind, MAX_TRACE_CHARS};
use lipid_core::storage::InMemoryObjectStore;
use lipid_worker::collector::CollectError;
use lipid_worker::processor::{Processor, ProcessorError, ToolProfile};
use lipid_worker::config::ConfigError;
use lipid_worker::runner::{record_failure, JobError, JobRunner, ModeProfiles, RunnerConfig};

const INPUT_URI: &str = "gs://in/a.tif";
const INPUT_BYTES: &[u8] = b"II*\0fake-tiff";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Writes a fixed set of files into the output dir, or fails with a
/// given exit code and output.
#[derive(Default)]
struct FakeProcessor {
    files: Vec<(&'static str, &'static [u8])>,
    failure: Option<(i32, String)>,
    calls: AtomicUsize,
    last_call: Mutex<Option<(PathBuf, Vec<u8>, ToolProfile)>>,
}

impl FakeProcessor {
    fn writing(files: &[(&'static str, &'static [u8])]) -> Self {
        Self {
            files: files.to_vec(),
            ..Default::default()
        }
    }

    fn failing(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            failure: Some((exit_code, output.into())),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_profile(&self) -> Option<ToolProfile> {
        self.last_call
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, _, profile)| profile.clone())
    }
}

#[async_trait]
impl Processor for FakeProcessor {
    async fn invoke(
        &self,
        input: &Path,
        out_dir: &Path,
        profile: &ToolProfile,
    ) -> Result<CommandOutput, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let input_bytes = std::fs::read(input).unwrap();
        *self.last_call.lock().unwrap() =
            Some((input.to_path_buf(), input_bytes, profile.clone()));

        if let Some((exit_code, output)) = &self.failure {
            return Err(ProcessorError::ExitStatus {
                program: profile.program.clone(),
                exit_code: *exit_code,
                output: output.clone(),
            });
        }

        for (relative, contents) in &self.files {
            let path = out_dir.join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        Ok(CommandOutput {
            output: "INFO: done".into(),
            exit_code: 0,
            duration_ms: 1,
        })
    }
}

fn profile(classifier: &str, downsample: u32) -> ToolProfile {
    ToolProfile {
        program: "qupath".into(),
        script: "/worker/scripts/qupath_headless.groovy".into(),
        classifier: classifier.into(),
        export_geojson: true,
        export_mask: true,
        downsample,
    }
}

struct Harness {
    objects: Arc<InMemoryObjectStore>,
    statuses: Arc<InMemoryStatusStore>,
    processor: Arc<FakeProcessor>,
    runner: JobRunner,
    work_root: tempfile::TempDir,
}

impl Harness {
    fn new(processor: FakeProcessor) -> Self {
        Self::with_work_subdir(processor, None)
    }

    /// Work dirs go under `subdir` of the temp root, which does not exist
    /// yet when given.
    fn with_work_subdir(processor: FakeProcessor, subdir: Option<&str>) -> Self {
        let objects = Arc::new(InMemoryObjectStore::new("gs", "results"));
        objects.insert(INPUT_URI, INPUT_BYTES);
        let statuses = Arc::new(InMemoryStatusStore::new());
        let processor = Arc::new(processor);
        let work = tempfile::tempdir().unwrap();

        let config = RunnerConfig {
            work_dir: Some(match subdir {
                Some(sub) => work.path().join(sub),
                None => work.path().to_path_buf(),
            }),
            profiles: ModeProfiles {
                high_res: profile("/worker/models/lipid_1.json", 16),
                low_res: profile("/worker/models/lipid_20x.json", 8),
            },
        };
        let runner = JobRunner::new(
            objects.clone(),
            statuses.clone(),
            processor.clone(),
            config,
        );

        Self {
            objects,
            statuses,
            processor,
            runner,
            work_root: work,
        }
    }

    /// Per-run work dirs left behind under the configured base.
    fn leftover_work_dirs(&self) -> usize {
        std::fs::read_dir(self.work_root.path()).unwrap().count()
    }
}

fn standard_outputs() -> FakeProcessor {
    let files: [(&'static str, &'static [u8]); 2] = [
        ("documents/d.csv", b"id,area\n1,3.5\n"),
        ("images/i.png", b"\x89PNG"),
    ];
    FakeProcessor::writing(&files)
}

// ---------------------------------------------------------------------------
// Success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_success_commits_refs_and_manifest() {
    let h = Harness::new(standard_outputs());

    let refs = h.runner.run("J1", "40X", INPUT_URI).await.unwrap();

    let expected: BTreeMap<String, String> = [
        ("documents/d.csv", "gs://results/J1/documents/d.csv"),
        ("images/i.png", "gs://results/J1/images/i.png"),
        ("manifest.json", "gs://results/J1/manifest.json"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    assert_eq!(refs, expected);

    let record = h.statuses.get("J1").await.unwrap().expect("status record");
    assert_eq!(record.status, Some(JobState::Succeeded));
    assert_eq!(record.stage, Some(Stage::Done));
    assert_eq!(record.pct, Some(100));
    assert_eq!(record.result_refs, Some(expected));
    assert!(record.error.is_none());
    assert!(record.finished_at.is_some());
    assert!(record.updated_at.is_some());

    let manifest: Manifest =
        serde_json::from_slice(&h.objects.object("gs://results/J1/manifest.json").unwrap())
            .unwrap();
    assert_eq!(manifest.inputs.image, INPUT_URI);
    assert_eq!(manifest.outputs, vec!["documents/d.csv", "images/i.png"]);
    assert_eq!(
        h.objects.object("gs://results/J1/images/i.png"),
        Some(vec![0x89, b'P', b'N', b'G'])
    );
}

#[tokio::test]
async fn success_writes_progress_then_one_terminal_replace() {
    let h = Harness::new(standard_outputs());
    h.runner.run("J1", "40X", INPUT_URI).await.unwrap();

    assert_eq!(h.statuses.pct_history("J1"), vec![5, 25, 75, 100]);

    let writes = h.statuses.writes();
    let kinds: Vec<WriteKind> = writes.iter().map(|w| w.kind).collect();
    assert_eq!(
        kinds,
        vec![
            WriteKind::Merge,
            WriteKind::Merge,
            WriteKind::Merge,
            WriteKind::Replace
        ]
    );
    assert!(writes[..3].iter().all(|w| !w.fields.is_terminal()));
    assert_eq!(h.statuses.terminal_writes("J1").len(), 1);
}

#[tokio::test]
async fn processor_receives_downloaded_input_and_mode_profile() {
    let h = Harness::new(standard_outputs());
    h.runner.run("J1", "20X", INPUT_URI).await.unwrap();

    let (input_path, input_bytes, used) = h.processor.last_call.lock().unwrap().clone().unwrap();
    assert_eq!(input_path.file_name().unwrap(), "a.tif");
    assert_eq!(input_bytes, INPUT_BYTES);
    assert_eq!(used.downsample, 8);
    assert_eq!(used.classifier, PathBuf::from("/worker/models/lipid_20x.json"));

    // The input never becomes a result.
    assert!(h.objects.object("gs://results/J1/a.tif").is_none());
}

#[tokio::test]
async fn work_dir_is_removed_after_the_run() {
    let h = Harness::new(standard_outputs());
    h.runner.run("J1", "40X", INPUT_URI).await.unwrap();
    assert_eq!(h.leftover_work_dirs(), 0);

    let failing = Harness::new(FakeProcessor::failing(1, "boom"));
    failing.runner.run("J2", "40X", INPUT_URI).await.unwrap_err();
    assert_eq!(failing.leftover_work_dirs(), 0);
}

#[tokio::test]
async fn missing_work_dir_base_is_created() {
    let h = Harness::with_work_subdir(standard_outputs(), Some("scratch/jobs"));
    h.runner.run("J1", "40X", INPUT_URI).await.unwrap();

    let base = h.work_root.path().join("scratch/jobs");
    assert!(base.is_dir());
    assert_eq!(std::fs::read_dir(&base).unwrap().count(), 0);
}

#[tokio::test]
async fn rerun_after_failure_commits_a_clean_success() {
    let h = Harness::new(standard_outputs());
    h.runner.run("J1", "99X", INPUT_URI).await.unwrap_err();
    assert!(h.statuses.get("J1").await.unwrap().unwrap().error.is_some());

    h.runner.run("J1", "40X", INPUT_URI).await.unwrap();

    let record = h.statuses.get("J1").await.unwrap().unwrap();
    assert_eq!(record.status, Some(JobState::Succeeded));
    assert!(record.error.is_none());
    assert!(record.result_refs.is_some());
    assert!(record.finished_at.is_some());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_mode_fails_before_touching_storage_or_tool() {
    let h = Harness::new(standard_outputs());

    let err = h.runner.run("J1", "99X", INPUT_URI).await.unwrap_err();
    assert_matches!(err, JobError::Config(_));

    assert_eq!(h.objects.get_count(), 0);
    assert_eq!(h.objects.put_count(), 0);
    assert_eq!(h.processor.calls(), 0);

    let record = h.statuses.get("J1").await.unwrap().unwrap();
    assert_eq!(record.status, Some(JobState::Failed));
    assert_eq!(record.stage, Some(Stage::Error));
    assert_eq!(record.pct, Some(25));
    let error = record.error.unwrap();
    assert_eq!(error.kind, "configuration");
    assert!(error.message.contains("99X"), "message: {}", error.message);
    assert!(record.result_refs.is_none());
    assert!(record.finished_at.is_none());
    assert_eq!(h.statuses.terminal_writes("J1").len(), 1);
}

#[tokio::test]
async fn malformed_input_uri_is_a_configuration_error() {
    let h = Harness::new(standard_outputs());
    let err = h.runner.run("J1", "40X", "not-a-uri").await.unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert_eq!(h.objects.get_count(), 0);
    assert_eq!(h.processor.calls(), 0);
}

#[tokio::test]
async fn empty_input_uri_is_recorded_as_configuration_failure() {
    let h = Harness::new(standard_outputs());
    let err = h.runner.run("J1", "40X", "").await.unwrap_err();
    assert_matches!(err, JobError::Config(_));

    let record = h.statuses.get("J1").await.unwrap().unwrap();
    assert_eq!(record.status, Some(JobState::Failed));
    assert_eq!(record.error.unwrap().kind, "configuration");
    assert_eq!(h.objects.get_count(), 0);
    assert_eq!(h.statuses.terminal_writes("J1").len(), 1);
}

#[tokio::test]
async fn settings_error_is_recorded_without_running_the_job() {
    let statuses = InMemoryStatusStore::new();
    let err = JobError::from(ConfigError::Missing("RESULTS_BUCKET"));
    assert_eq!(err.kind(), "configuration");

    record_failure(&statuses, "J1", &err, None).await;

    let record = statuses.get("J1").await.unwrap().unwrap();
    assert_eq!(record.status, Some(JobState::Failed));
    assert_eq!(record.stage, Some(Stage::Error));
    assert!(record.pct.is_none());
    let error = record.error.unwrap();
    assert_eq!(error.kind, "configuration");
    assert!(error.message.contains("RESULTS_BUCKET"), "message: {}", error.message);
    assert!(record.finished_at.is_none());
    assert_eq!(statuses.terminal_writes("J1").len(), 1);
}

#[tokio::test]
async fn tool_failure_records_bounded_trace_and_no_success() {
    let long_output = format!("{}\nERROR: classifier failed", "x".repeat(5_000));
    let h = Harness::new(FakeProcessor::failing(2, long_output.clone()));

    let err = h.runner.run("J1", "40X", INPUT_URI).await.unwrap_err();
    assert_matches!(
        err,
        JobError::Processing(ProcessorError::ExitStatus { exit_code: 2, .. })
    );

    let record = h.statuses.get("J1").await.unwrap().unwrap();
    assert_eq!(record.status, Some(JobState::Failed));
    assert_eq!(record.pct, Some(25));
    let error = record.error.unwrap();
    assert_eq!(error.kind, "processing");
    assert!(!error.message.is_empty());
    assert_eq!(error.trace.chars().count(), MAX_TRACE_CHARS);
    assert!(error.trace.ends_with("ERROR: classifier failed"));

    assert_eq!(h.statuses.pct_history("J1"), vec![5, 25]);
    assert_eq!(h.objects.put_count(), 0);
    assert!(h
        .statuses
        .writes()
        .iter()
        .all(|w| w.fields.status != Some(JobState::Succeeded)));
}

#[tokio::test]
async fn tool_without_output_is_a_processing_failure() {
    let h = Harness::new(FakeProcessor::writing(&[]));
    let err = h.runner.run("J1", "40X", INPUT_URI).await.unwrap_err();
    assert_matches!(err, JobError::NoOutput);

    let record = h.statuses.get("J1").await.unwrap().unwrap();
    assert_eq!(record.error.unwrap().kind, "processing");
    assert_eq!(h.objects.put_count(), 0);
}

#[tokio::test]
async fn missing_input_is_an_input_fetch_failure() {
    let h = Harness::new(standard_outputs());
    let err = h
        .runner
        .run("J1", "40X", "gs://in/missing.tif")
        .await
        .unwrap_err();
    assert_matches!(err, JobError::InputFetch { .. });
    assert_eq!(h.processor.calls(), 0);

    let record = h.statuses.get("J1").await.unwrap().unwrap();
    let error = record.error.unwrap();
    assert_eq!(error.kind, "input_fetch");
    assert!(error.message.contains("gs://in/missing.tif"));
}

#[tokio::test]
async fn upload_failure_commits_failure_without_refs() {
    let h = Harness::new(standard_outputs());
    h.objects.fail_puts_containing("images/");

    let err = h.runner.run("J1", "40X", INPUT_URI).await.unwrap_err();
    assert_matches!(err, JobError::Collect(CollectError::Upload { .. }));

    let record = h.statuses.get("J1").await.unwrap().unwrap();
    assert_eq!(record.status, Some(JobState::Failed));
    assert_eq!(record.pct, Some(75));
    assert_eq!(record.error.unwrap().kind, "upload");
    assert!(record.result_refs.is_none());
    assert!(h.objects.object("gs://results/J1/manifest.json").is_none());
    assert_eq!(h.statuses.terminal_writes("J1").len(), 1);
}

#[tokio::test]
async fn progress_merge_failures_do_not_change_the_outcome() {
    let h = Harness::new(standard_outputs());
    h.statuses.fail_merges();

    let refs = h.runner.run("J1", "40X", INPUT_URI).await.unwrap();
    assert_eq!(refs.len(), 3);

    let record = h.statuses.get("J1").await.unwrap().unwrap();
    assert_eq!(record.status, Some(JobState::Succeeded));
    assert_eq!(record.pct, Some(100));
    assert_eq!(h.statuses.pct_history("J1"), vec![100]);
}

#[tokio::test]
async fn failed_success_commit_becomes_the_failure_commit() {
    let h = Harness::new(standard_outputs());
    h.statuses.fail_next_replaces(1);

    let err = h.runner.run("J1", "40X", INPUT_URI).await.unwrap_err();
    assert_matches!(err, JobError::Commit(_));

    let terminal = h.statuses.terminal_writes("J1");
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].fields.status, Some(JobState::Failed));

    let record = h.statuses.get("J1").await.unwrap().unwrap();
    assert_eq!(record.error.unwrap().kind, "commit");
    assert!(record.result_refs.is_none());
    assert!(record.finished_at.is_none());
}

#[tokio::test]
async fn failed_failure_commit_still_returns_the_original_error() {
    let h = Harness::new(FakeProcessor::failing(1, "boom"));
    h.statuses.fail_next_replaces(1);

    let err = h.runner.run("J1", "40X", INPUT_URI).await.unwrap_err();
    assert_matches!(err, JobError::Processing(_));
    assert!(h.statuses.terminal_writes("J1").is_empty());
}

#[tokio::test]
async fn high_res_mode_uses_high_res_profile() {
    let h = Harness::new(standard_outputs());
    h.runner.run("J1", "40X", INPUT_URI).await.unwrap();
    let used = h.processor.last_profile().unwrap();
    assert_eq!(used.downsample, 16);
    assert_eq!(used.classifier, PathBuf::from("/worker/models/lipid_1.json"));
}
