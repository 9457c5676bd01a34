use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{ContentRow, FailedTaskRow, NewDownload, PathEntry};
use crate::task::MediaTask;

// ========== Identity lookups ==========

/// Get the content hash mapped to a normalized URL key.
pub async fn get_hash_for_url(pool: &SqlitePool, url_key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT content_hash FROM url_to_hash WHERE url_key = ?")
            .bind(url_key)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch hash for url")?;

    Ok(row.map(|(h,)| h))
}

/// Get the content hash last observed with an ETag.
pub async fn get_hash_for_etag(pool: &SqlitePool, etag: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT content_hash FROM etag_to_hash WHERE etag = ?")
            .bind(etag)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch hash for etag")?;

    Ok(row.map(|(h,)| h))
}

/// Get the content hash mapped to a partial fingerprint.
pub async fn get_hash_for_fingerprint(
    pool: &SqlitePool,
    fingerprint: &str,
) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT content_hash FROM fp_to_hash WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch hash for fingerprint")?;

    Ok(row.map(|(h,)| h))
}

/// Get the `contents` row for a hash.
pub async fn get_content(pool: &SqlitePool, content_hash: &str) -> Result<Option<ContentRow>> {
    sqlx::query_as("SELECT * FROM contents WHERE content_hash = ?")
        .bind(content_hash)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch content row")
}

/// Get every local path recorded for a hash, oldest first.
pub async fn get_paths_for_hash(pool: &SqlitePool, content_hash: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT path FROM hash_to_paths WHERE content_hash = ? ORDER BY added_at, path",
    )
    .bind(content_hash)
    .fetch_all(pool)
    .await
    .context("Failed to fetch paths for hash")?;

    Ok(rows.into_iter().map(|(p,)| p).collect())
}

/// List known paths whose content size is `size` or was never recorded.
pub async fn get_paths_with_size(pool: &SqlitePool, size: u64) -> Result<Vec<PathEntry>> {
    sqlx::query_as(
        r"
        SELECT p.content_hash, p.path, c.size
        FROM hash_to_paths p
        LEFT JOIN contents c ON c.content_hash = p.content_hash
        WHERE c.size IS NULL OR c.size = ?
        ORDER BY p.content_hash
        ",
    )
    .bind(size as i64)
    .fetch_all(pool)
    .await
    .context("Failed to fetch paths by size")
}

/// Check whether any identity rows exist.
pub async fn index_is_empty(pool: &SqlitePool) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as(
        r"
        SELECT (SELECT COUNT(*) FROM url_to_hash)
             + (SELECT COUNT(*) FROM contents)
             + (SELECT COUNT(*) FROM hash_to_paths)
             + (SELECT COUNT(*) FROM etag_to_hash)
        ",
    )
    .fetch_one(pool)
    .await
    .context("Failed to count index rows")?;

    Ok(count == 0)
}

// ========== Identity writes ==========

/// Record a completed download in a single transaction.
///
/// Every statement is an upsert or insert-or-ignore, so repeating the call
/// with identical arguments leaves the store unchanged.
pub async fn record_download(pool: &SqlitePool, download: &NewDownload) -> Result<()> {
    let path = download.path.to_string_lossy().into_owned();
    let size = download.size.map(|s| s as i64);

    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin download transaction")?;

    sqlx::query(
        r"
        INSERT INTO url_to_hash (url_key, content_hash) VALUES (?, ?)
        ON CONFLICT(url_key) DO UPDATE SET content_hash = excluded.content_hash
        ",
    )
    .bind(&download.url_key)
    .bind(&download.content_hash)
    .execute(&mut *tx)
    .await
    .context("Failed to upsert url mapping")?;

    sqlx::query(
        r"
        INSERT INTO contents (content_hash, size, etag) VALUES (?, ?, ?)
        ON CONFLICT(content_hash) DO UPDATE SET
            size = COALESCE(excluded.size, contents.size),
            etag = COALESCE(excluded.etag, contents.etag)
        ",
    )
    .bind(&download.content_hash)
    .bind(size)
    .bind(&download.etag)
    .execute(&mut *tx)
    .await
    .context("Failed to upsert content row")?;

    sqlx::query("INSERT OR IGNORE INTO hash_to_paths (content_hash, path) VALUES (?, ?)")
        .bind(&download.content_hash)
        .bind(&path)
        .execute(&mut *tx)
        .await
        .context("Failed to insert content path")?;

    if let Some(etag) = &download.etag {
        upsert_etag(&mut tx, etag, &download.content_hash).await?;
    }

    if let Some(fingerprint) = &download.fingerprint {
        upsert_fingerprint(&mut tx, fingerprint, &download.content_hash).await?;
    }

    tx.commit()
        .await
        .context("Failed to commit download transaction")?;
    Ok(())
}

/// Map a URL key (and optionally an ETag) to an already known hash.
pub async fn record_alias(
    pool: &SqlitePool,
    url_key: &str,
    content_hash: &str,
    etag: Option<&str>,
) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin alias transaction")?;

    sqlx::query(
        r"
        INSERT INTO url_to_hash (url_key, content_hash) VALUES (?, ?)
        ON CONFLICT(url_key) DO UPDATE SET content_hash = excluded.content_hash
        ",
    )
    .bind(url_key)
    .bind(content_hash)
    .execute(&mut *tx)
    .await
    .context("Failed to upsert url alias")?;

    if let Some(etag) = etag {
        upsert_etag(&mut tx, etag, content_hash).await?;
    }

    tx.commit()
        .await
        .context("Failed to commit alias transaction")?;
    Ok(())
}

/// Add a local path for an existing hash.
pub async fn add_path_for_hash(pool: &SqlitePool, content_hash: &str, path: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO hash_to_paths (content_hash, path) VALUES (?, ?)")
        .bind(content_hash)
        .bind(path)
        .execute(pool)
        .await
        .context("Failed to insert content path")?;
    Ok(())
}

/// Map a partial fingerprint to a hash.
pub async fn set_fingerprint(pool: &SqlitePool, fingerprint: &str, content_hash: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    upsert_fingerprint(&mut tx, fingerprint, content_hash).await?;
    tx.commit().await?;
    Ok(())
}

async fn upsert_etag(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    etag: &str,
    content_hash: &str,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO etag_to_hash (etag, content_hash) VALUES (?, ?)
        ON CONFLICT(etag) DO UPDATE SET content_hash = excluded.content_hash
        ",
    )
    .bind(etag)
    .bind(content_hash)
    .execute(&mut **tx)
    .await
    .context("Failed to upsert etag mapping")?;
    Ok(())
}

async fn upsert_fingerprint(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    fingerprint: &str,
    content_hash: &str,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO fp_to_hash (fingerprint, content_hash) VALUES (?, ?)
        ON CONFLICT(fingerprint) DO UPDATE SET content_hash = excluded.content_hash
        ",
    )
    .bind(fingerprint)
    .bind(content_hash)
    .execute(&mut **tx)
    .await
    .context("Failed to upsert fingerprint mapping")?;
    Ok(())
}

// ========== Failure ledger ==========

/// Insert or update a failure, adding `attempts` to any previous count.
pub async fn upsert_failed_task(
    pool: &SqlitePool,
    task: &MediaTask,
    reason: &str,
    retryable: bool,
    attempts: u32,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO failed_tasks (
            task_key, source_url, normalized_key, target_path, post_id,
            expected_kind, reason, retryable, attempt_count, last_attempt_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(task_key) DO UPDATE SET
            source_url = excluded.source_url,
            reason = excluded.reason,
            retryable = excluded.retryable,
            attempt_count = failed_tasks.attempt_count + excluded.attempt_count,
            last_attempt_at = excluded.last_attempt_at
        ",
    )
    .bind(task.ledger_key())
    .bind(&task.source_url)
    .bind(&task.normalized_key)
    .bind(task.target_path.to_string_lossy().into_owned())
    .bind(&task.post_id)
    .bind(task.expected_kind.as_str())
    .bind(reason)
    .bind(retryable)
    .bind(i64::from(attempts))
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .context("Failed to upsert failed task")?;

    Ok(())
}

/// Get a failure by ledger key.
pub async fn get_failed_task(pool: &SqlitePool, task_key: &str) -> Result<Option<FailedTaskRow>> {
    sqlx::query_as("SELECT * FROM failed_tasks WHERE task_key = ?")
        .bind(task_key)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch failed task")
}

/// Get every recorded failure, oldest attempt first.
pub async fn get_failed_tasks(pool: &SqlitePool) -> Result<Vec<FailedTaskRow>> {
    sqlx::query_as("SELECT * FROM failed_tasks ORDER BY last_attempt_at, task_key")
        .fetch_all(pool)
        .await
        .context("Failed to fetch failed tasks")
}

/// Delete a failure by ledger key, returning whether a row was removed.
pub async fn delete_failed_task(pool: &SqlitePool, task_key: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM failed_tasks WHERE task_key = ?")
        .bind(task_key)
        .execute(pool)
        .await
        .context("Failed to delete failed task")?;

    Ok(result.rows_affected() > 0)
}

/// Count recorded failures.
pub async fn count_failed_tasks(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM failed_tasks")
        .fetch_one(pool)
        .await
        .context("Failed to count failed tasks")?;
    Ok(count)
}

/// Delete every recorded failure, returning the number removed.
pub async fn clear_failed_tasks(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM failed_tasks")
        .execute(pool)
        .await
        .context("Failed to clear failed tasks")?;
    Ok(result.rows_affected())
}
