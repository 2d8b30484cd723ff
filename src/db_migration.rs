use crate::errors::{DbError, DbResult};
use sqlx::{Row, SqlitePool};

// Embed all migration SQL files at compile time
const MIGRATION_INITIAL: &str = include_str!("../migrations/0001_initial.sql");
const MIGRATION_FTS: &str = include_str!("../migrations/0002_fts.sql");
const MIGRATION_PURGE_MARKERS: &str = include_str!("../migrations/0003_purge_markers.sql");

// Forward-only list; versions are contiguous integers recorded in
// schema_migrations.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "initial", MIGRATION_INITIAL),
    (2, "fts", MIGRATION_FTS),
    (3, "purge_markers", MIGRATION_PURGE_MARKERS),
];

/// Columns that older databases may lack. The legacy app versioned its
/// schema loosely, so beyond the numbered migrations we probe
/// `PRAGMA table_info` and add anything missing.
const COLUMN_REPAIRS: &[(&str, &str, &str)] = &[
    ("tasks", "review_at", "TEXT"),
    ("tasks", "time_estimate", "INTEGER"),
    ("tasks", "text_direction", "TEXT"),
    ("tasks", "push_count", "INTEGER"),
    ("tasks", "purged_at", "TEXT"),
    ("projects", "review_at", "TEXT"),
    ("projects", "area_title", "TEXT"),
    ("projects", "purged_at", "TEXT"),
    ("sections", "purged_at", "TEXT"),
    ("areas", "purged_at", "TEXT"),
];

/// Apply all pending migrations, then repair any columns an older database
/// is missing.
pub async fn initialize_database(pool: &SqlitePool) -> DbResult<()> {
    create_migrations_table(pool).await?;

    let current = current_version(pool).await?;
    log::debug!("schema version before migration: {}", current);

    apply_pending_migrations(pool, current).await?;
    repair_missing_columns(pool).await?;

    Ok(())
}

async fn create_migrations_table(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::Migration(format!("failed to create schema_migrations: {}", e)))?;

    Ok(())
}

async fn current_version(pool: &SqlitePool) -> DbResult<i64> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(pool)
            .await
            .map_err(|e| DbError::Migration(format!("failed to read schema version: {}", e)))?;
    Ok(version.unwrap_or(0))
}

async fn apply_pending_migrations(pool: &SqlitePool, current: i64) -> DbResult<()> {
    for &(version, name, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }

        log::info!("applying migration {} ({})", version, name);

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| DbError::Transaction(format!("migration {}: {}", version, e)))?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("migration {} ({}) failed: {}", version, name, e)))?;

        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(version)
            .bind(name)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("failed to record migration {}: {}", version, e)))?;

        tx.commit()
            .await
            .map_err(|e| DbError::Transaction(format!("migration {} commit: {}", version, e)))?;
    }

    Ok(())
}

/// Add any known column that is absent from the live schema.
async fn repair_missing_columns(pool: &SqlitePool) -> DbResult<()> {
    for &(table, column, ddl_type) in COLUMN_REPAIRS {
        if !column_exists(pool, table, column).await? {
            log::warn!("adding missing column {}.{}", table, column);
            let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, ddl_type);
            sqlx::query(&sql)
                .execute(pool)
                .await
                .map_err(|e| DbError::Migration(format!("failed to add {}.{}: {}", table, column, e)))?;
        }
    }
    Ok(())
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> DbResult<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| DbError::Migration(format!("table_info({}) failed: {}", table, e)))?;

    for row in rows {
        let name: String = row
            .try_get("name")
            .map_err(|e| DbError::Migration(format!("table_info({}) row: {}", table, e)))?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
