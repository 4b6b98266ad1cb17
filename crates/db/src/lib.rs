//! `lipid-db` -- PostgreSQL-backed job status store.

use sqlx::postgres::PgPoolOptions;

pub mod status_repo;

pub use status_repo::PgStatusStore;

pub type DbPool = sqlx::PgPool;

/// A single worker issues a handful of sequential writes; a small pool is plenty.
const MAX_CONNECTIONS: u32 = 2;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(database_url)
        .await
}

/// Verify the database answers a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations (creates `job_status`).
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
