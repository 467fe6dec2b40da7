//! Postgres connection pool and schema wiring.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Schema of every table the Postgres adapters use. Idempotent.
pub const SCHEMA: &str = include_str!("../migrations/0001_sync.sql");

/// Open a connection pool.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Apply [`SCHEMA`].
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::info!("sync schema applied");
    Ok(())
}

/// Classify a sqlx failure as "the database is unreachable / busy" versus
/// everything else. Callers use it to decide between retrying and surfacing.
pub(crate) fn is_unavailable(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
