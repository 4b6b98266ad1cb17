//! Worker configuration loaded from environment variables.
//!
//! Loading happens in two stages. [`BootstrapConfig`] names the job and
//! its status store; without it nothing can be recorded and the worker
//! exits with code 2. [`WorkerConfig`] holds everything else, and its
//! errors become the job's failure record.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lipid_core::job::JobSpec;

use crate::processor::ToolProfile;
use crate::runner::{ModeProfiles, RunnerConfig};

/// Errors raised while reading the worker environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var}='{value}' is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where job inputs are read from and results are written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// S3-compatible service, optionally at a custom endpoint.
    S3 { endpoint_url: Option<String> },
    /// Buckets as directories under `root`.
    Local { root: PathBuf },
}

/// Where job status documents are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusBackend {
    Postgres { database_url: String },
    /// Process-local; only useful for dry runs.
    Memory,
}

/// What the worker needs before it can record anything about the job:
/// the job itself and where its status lives.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// The job handed to this process by the scheduler.
    pub job: JobSpec,
    pub status: StatusBackend,
}

impl BootstrapConfig {
    /// Load the bootstrap settings from the process environment.
    ///
    /// | Env Var          | Default                           |
    /// |------------------|-----------------------------------|
    /// | `JOB_ID`         | required                          |
    /// | `MODE`           | `40X`                             |
    /// | `GS_INPUT`       | empty (rejected by the runner)    |
    /// | `STATUS_BACKEND` | `postgres` (`postgres`, `memory`) |
    /// | `DATABASE_URL`   | required for `postgres`           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup`, which returns the value of a variable if it
    /// is set.
    ///
    /// `MODE` and `GS_INPUT` are passed through unchecked so that a bad
    /// value ends up in the job's failure record.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let job = JobSpec {
            job_id: env.required("JOB_ID")?,
            mode: env.or("MODE", "40X"),
            input_uri: env.or("GS_INPUT", ""),
        };

        let status = match env.or("STATUS_BACKEND", "postgres").as_str() {
            "postgres" => StatusBackend::Postgres {
                database_url: env.required("DATABASE_URL")?,
            },
            "memory" => StatusBackend::Memory,
            other => {
                return Err(invalid("STATUS_BACKEND", other, "expected postgres or memory"))
            }
        };

        Ok(Self { job, status })
    }
}

/// Settings for running the job once its status can be recorded. Errors
/// here are reported as the job's `configuration` failure.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bucket receiving job outputs.
    pub results_bucket: String,
    /// Scheme used when formatting result URIs (default: `gs`).
    pub storage_scheme: String,
    pub storage: StorageBackend,
    /// Parent of per-run work dirs (default: system temp dir).
    pub work_dir: Option<PathBuf>,
    pub profiles: ModeProfiles,
    /// Wall-clock limit for the segmentation tool (default: none).
    pub tool_timeout: Option<Duration>,
}

impl WorkerConfig {
    /// Load the job settings from the process environment.
    ///
    /// | Env Var             | Default                                  |
    /// |---------------------|------------------------------------------|
    /// | `RESULTS_BUCKET`    | required                                 |
    /// | `STORAGE_BACKEND`   | `s3` (`s3`, `local`)                     |
    /// | `STORAGE_ROOT`      | `./storage`                              |
    /// | `STORAGE_SCHEME`    | `gs`                                     |
    /// | `S3_ENDPOINT_URL`   | unset                                    |
    /// | `WORK_DIR`          | system temp dir                          |
    /// | `QUPATH_BIN`        | `qupath`                                 |
    /// | `QUPATH_SCRIPT`     | `/worker/scripts/qupath_headless.groovy` |
    /// | `CLASSIFIER_40X`    | `/worker/models/lipid_1.json`            |
    /// | `CLASSIFIER_20X`    | `/worker/models/lipid_20x.json`          |
    /// | `DOWNSAMPLE_40X`    | `16`                                     |
    /// | `DOWNSAMPLE_20X`    | `8`                                      |
    /// | `TOOL_TIMEOUT_SECS` | unset (no timeout)                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup`, which returns the value of a variable if it
    /// is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let storage = match env.or("STORAGE_BACKEND", "s3").as_str() {
            "s3" => StorageBackend::S3 {
                endpoint_url: env.optional("S3_ENDPOINT_URL"),
            },
            "local" => StorageBackend::Local {
                root: env.or("STORAGE_ROOT", "./storage").into(),
            },
            other => return Err(invalid("STORAGE_BACKEND", other, "expected s3 or local")),
        };

        let program = env.or("QUPATH_BIN", "qupath");
        let script: PathBuf = env
            .or("QUPATH_SCRIPT", "/worker/scripts/qupath_headless.groovy")
            .into();
        let profile = |classifier: String, downsample: u32| ToolProfile {
            program: program.clone(),
            script: script.clone(),
            classifier: classifier.into(),
            export_geojson: true,
            export_mask: true,
            downsample,
        };
        let profiles = ModeProfiles {
            high_res: profile(
                env.or("CLASSIFIER_40X", "/worker/models/lipid_1.json"),
                env.parsed("DOWNSAMPLE_40X", 16)?,
            ),
            low_res: profile(
                env.or("CLASSIFIER_20X", "/worker/models/lipid_20x.json"),
                env.parsed("DOWNSAMPLE_20X", 8)?,
            ),
        };

        let tool_timeout = match env.optional("TOOL_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value("TOOL_TIMEOUT_SECS", &raw)?)),
            None => None,
        };

        Ok(Self {
            results_bucket: env.required("RESULTS_BUCKET")?,
            storage_scheme: env.or("STORAGE_SCHEME", "gs"),
            storage,
            work_dir: env.optional("WORK_DIR").map(PathBuf::from),
            profiles,
            tool_timeout,
        })
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            work_dir: self.work_dir.clone(),
            profiles: self.profiles.clone(),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank.
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
