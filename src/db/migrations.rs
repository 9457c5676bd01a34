use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM _schema_version")
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: identity index tables");

    let mut tx = pool.begin().await?;

    // Normalized URL key -> content hash (a function: one hash per key)
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS url_to_hash (
            url_key TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL
        )
        ",
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create url_to_hash table")?;

    // One row per distinct content hash
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS contents (
            content_hash TEXT PRIMARY KEY,
            size INTEGER,
            etag TEXT,
            first_seen_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create contents table")?;

    // Content hash -> local paths (multi-valued, insert-only)
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS hash_to_paths (
            content_hash TEXT NOT NULL,
            path TEXT NOT NULL,
            added_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (content_hash, path)
        )
        ",
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create hash_to_paths table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_hash_to_paths_hash ON hash_to_paths(content_hash)")
        .execute(&mut *tx)
        .await
        .context("Failed to create hash_to_paths index")?;

    // HTTP validator -> content hash (best-effort accelerator)
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS etag_to_hash (
            etag TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL
        )
        ",
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create etag_to_hash table")?;

    // Partial fingerprint (prefix hash + declared size) -> content hash
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS fp_to_hash (
            fingerprint TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL
        )
        ",
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create fp_to_hash table")?;

    tx.commit().await?;
    Ok(())
}

async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v2: failure ledger");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS failed_tasks (
            task_key TEXT PRIMARY KEY,
            source_url TEXT NOT NULL,
            normalized_key TEXT NOT NULL,
            target_path TEXT NOT NULL,
            post_id TEXT NOT NULL,
            expected_kind TEXT NOT NULL,
            reason TEXT NOT NULL,
            retryable INTEGER NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create failed_tasks table")?;

    Ok(())
}
