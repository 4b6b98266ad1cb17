//! `lipid-worker` -- single-job segmentation worker.
//!
//! Runs the job described by `JOB_ID`, `MODE` and `GS_INPUT`, then exits.
//! See [`BootstrapConfig::from_env`] and [`WorkerConfig::from_env`] for
//! the full list of variables.
//!
//! Exit codes: `0` success, `1` job failed (failure recorded in the
//! status store), `2` no job id or no reachable status store.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use lipid_cloud::{S3ObjectStore, S3Settings};
use lipid_core::status::{InMemoryStatusStore, StatusStore};
use lipid_core::storage::{LocalObjectStore, ObjectStore};
use lipid_db::PgStatusStore;
use lipid_worker::config::{BootstrapConfig, StatusBackend, StorageBackend, WorkerConfig};
use lipid_worker::processor::QuPathProcessor;
use lipid_worker::runner::{record_failure, JobError, JobRunner};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lipid_worker=info,lipid_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let boot = match BootstrapConfig::from_env() {
        Ok(boot) => boot,
        Err(e) => {
            tracing::error!(error = %e, "Invalid worker configuration");
            return ExitCode::from(2);
        }
    };

    let statuses = match connect_status_store(&boot.status).await {
        Ok(statuses) => statuses,
        Err(e) => {
            tracing::error!(error = ?e, "Worker setup failed");
            return ExitCode::from(2);
        }
    };

    let job = &boot.job;
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            record_failure(statuses.as_ref(), &job.job_id, &JobError::from(e), None).await;
            return ExitCode::from(1);
        }
    };

    let runner = build_runner(&config, statuses).await;
    match runner.run(&job.job_id, &job.mode, &job.input_uri).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::from(1),
    }
}

async fn connect_status_store(backend: &StatusBackend) -> anyhow::Result<Arc<dyn StatusStore>> {
    match backend {
        StatusBackend::Postgres { database_url } => {
            let pool = lipid_db::create_pool(database_url)
                .await
                .context("Failed to connect to database")?;
            lipid_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            lipid_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database connected, migrations applied");
            Ok(Arc::new(PgStatusStore::new(pool)))
        }
        StatusBackend::Memory => {
            tracing::warn!("Using in-memory status store; job status will not be persisted");
            Ok(Arc::new(InMemoryStatusStore::new()))
        }
    }
}

async fn build_runner(config: &WorkerConfig, statuses: Arc<dyn StatusStore>) -> JobRunner {
    let objects: Arc<dyn ObjectStore> = match &config.storage {
        StorageBackend::S3 { endpoint_url } => Arc::new(
            S3ObjectStore::from_env(S3Settings {
                results_bucket: config.results_bucket.clone(),
                scheme: config.storage_scheme.clone(),
                endpoint_url: endpoint_url.clone(),
            })
            .await,
        ),
        StorageBackend::Local { root } => {
            tracing::info!(root = %root.display(), "Using local object store");
            Arc::new(LocalObjectStore::new(
                root.clone(),
                config.storage_scheme.clone(),
                config.results_bucket.clone(),
            ))
        }
    };

    let processor = Arc::new(QuPathProcessor::new(config.tool_timeout));

    JobRunner::new(objects, statuses, processor, config.runner_config())
}
