//! Job store for the try job integrator.
//!
//! Provides the `JobDb` and `JobCache` traits with PostgreSQL and
//! in-memory implementations.

pub mod cache;
pub mod error;
pub mod job;
pub mod memory;

pub use cache::{DbJobCache, JobCache};
pub use error::{DbError, DbResult};
pub use job::{JobDb, JobSearchParams, PgJobDb};
pub use memory::InMemoryJobDb;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
