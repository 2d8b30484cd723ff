use crate::errors::{DbError, DbResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Build the SQLite connection pool for a database path or URL.
///
/// WAL journaling keeps readers unblocked while a sync cycle commits; the
/// busy timeout covers the brief window where the save transaction holds the
/// write lock.
pub async fn create_pool(db_url: &str) -> DbResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(|e| DbError::Other(format!("invalid database URL '{}': {}", db_url, e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Pool for a database file under a data-root directory.
pub async fn create_pool_at(data_root: &Path) -> DbResult<SqlitePool> {
    let db_path = data_root.join("mindwtr.db");
    let url = format!("sqlite://{}", db_path.display());
    create_pool(&url).await
}

#[cfg(test)]
pub async fn create_test_pool() -> SqlitePool {
    // Tests share one in-memory database across the pool's connections.
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap()
}
