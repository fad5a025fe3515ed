//! SQLite connection pool and migration runner (spec 6 persistence layout).
//!
//! Mirrors the donor codebase's `StateDb::open`: WAL journal mode, a
//! handful of pragmas tuned for a single-writer workload, and migrations
//! applied ascending by filename inside one transaction per file, tracked
//! in a `schema_migrations` table.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

/// Migration files applied in ascending order on startup.
///
/// Each tuple is `(version, name, sql)`. Embedding the SQL via
/// `include_str!` keeps the migration text next to the crate instead of
/// requiring a runtime asset directory.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "messages", include_str!("../migrations/001_messages.sql")),
    (2, "memories", include_str!("../migrations/002_memories.sql")),
    (3, "jobs", include_str!("../migrations/003_jobs.sql")),
    (4, "schedule", include_str!("../migrations/004_schedule.sql")),
    (5, "tools", include_str!("../migrations/005_tools.sql")),
];

/// Open the SQLite pool at `path`, creating parent directories and the
/// file itself if missing, then run any pending migrations.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or a migration
/// fails to apply.
pub async fn open(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .with_context(|| format!("invalid database path {}", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("failed to open sqlite pool")?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("failed to create schema_migrations table")?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await
        .context("failed to list applied migrations")?;

    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        let mut tx = pool.begin().await.context("failed to open migration transaction")?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("migration {version}_{name} failed"))?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, datetime('now'))")
            .bind(version)
            .bind(name)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to record migration {version}_{name}"))?;
        tx.commit().await.with_context(|| format!("failed to commit migration {version}_{name}"))?;

        tracing::info!(version, name, "applied migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_file_and_applies_migrations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.sqlite3");

        let pool = open(&path).await.expect("open");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runtime.sqlite3");

        open(&path).await.expect("first open");
        let pool = open(&path).await.expect("second open");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, MIGRATIONS.len() as i64);
    }
}
