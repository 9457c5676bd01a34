//! One-time import of the single-blob JSON index used by older versions.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::queries::index_is_empty;

/// Shape of `.md5_index.json`.
///
/// Older files stored a bare string instead of a list of paths, so both are
/// accepted.
#[derive(Debug, Default, Deserialize)]
pub struct LegacyIndex {
    #[serde(default)]
    pub url_to_md5: HashMap<String, String>,
    #[serde(default)]
    pub md5_to_paths: HashMap<String, LegacyPaths>,
    #[serde(default)]
    pub etag_to_md5: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LegacyPaths {
    Many(Vec<String>),
    One(String),
}

impl LegacyPaths {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::Many(paths) => paths,
            Self::One(path) => vec![path],
        }
    }
}

/// Import a legacy JSON index into an empty store.
///
/// Returns `Ok(false)` when nothing was imported: no blob exists or the store
/// already holds rows (the import is treated as done and never merged). The
/// import runs in one transaction, so a failure leaves the store untouched;
/// the blob itself is never modified.
///
/// # Errors
///
/// Returns an error if the blob cannot be read or parsed, or the transaction
/// fails.
pub async fn import_legacy_index(pool: &SqlitePool, json_path: &Path) -> Result<bool> {
    if !tokio::fs::try_exists(json_path).await.unwrap_or(false) {
        return Ok(false);
    }

    if !index_is_empty(pool).await? {
        return Ok(false);
    }

    info!(path = %json_path.display(), "Importing legacy index");

    let raw = tokio::fs::read(json_path)
        .await
        .with_context(|| format!("Failed to read legacy index: {}", json_path.display()))?;
    let legacy: LegacyIndex = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse legacy index: {}", json_path.display()))?;

    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin legacy import")?;

    for (url, hash) in &legacy.url_to_md5 {
        sqlx::query("INSERT OR REPLACE INTO url_to_hash (url_key, content_hash) VALUES (?, ?)")
            .bind(url)
            .bind(hash)
            .execute(&mut *tx)
            .await
            .context("Failed to import url mapping")?;
        insert_content(&mut tx, hash).await?;
    }

    let mut path_count = 0usize;
    for (hash, paths) in legacy.md5_to_paths {
        insert_content(&mut tx, &hash).await?;
        for path in paths.into_vec() {
            sqlx::query("INSERT OR IGNORE INTO hash_to_paths (content_hash, path) VALUES (?, ?)")
                .bind(&hash)
                .bind(&path)
                .execute(&mut *tx)
                .await
                .context("Failed to import path")?;
            path_count += 1;
        }
    }

    for (etag, hash) in &legacy.etag_to_md5 {
        sqlx::query("INSERT OR REPLACE INTO etag_to_hash (etag, content_hash) VALUES (?, ?)")
            .bind(etag)
            .bind(hash)
            .execute(&mut *tx)
            .await
            .context("Failed to import etag mapping")?;
    }

    tx.commit().await.context("Failed to commit legacy import")?;

    info!(
        urls = legacy.url_to_md5.len(),
        paths = path_count,
        etags = legacy.etag_to_md5.len(),
        "Legacy index imported"
    );
    if legacy.url_to_md5.is_empty() && path_count == 0 {
        warn!(path = %json_path.display(), "Legacy index contained no mappings");
    }

    Ok(true)
}

async fn insert_content(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, hash: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO contents (content_hash) VALUES (?)")
        .bind(hash)
        .execute(&mut **tx)
        .await
        .context("Failed to import content row")?;
    Ok(())
}
