//! Durable identity index: URL key, ETag and fingerprint to content hash,
//! content hash to local paths.
//!
//! All mutations go through single SQLite transactions, so concurrent workers
//! never observe a hash without its path or a half-written row. Readers may
//! see slightly stale data.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{self, CheckpointMode, ContentIdentity, Database, NewDownload, PathEntry};

#[derive(Debug)]
pub struct IdentityIndex {
    db: Database,
    save_interval: u64,
    updates: AtomicU64,
}

impl IdentityIndex {
    /// Open the index for an output directory, importing a legacy blob when
    /// the store is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the output directory cannot be created or the
    /// store cannot be opened. A failed legacy import is logged, not returned.
    pub async fn open(config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create output directory: {}",
                    config.output_dir.display()
                )
            })?;

        let index = Self::open_at(&config.index_path(), config.save_interval).await?;

        match db::import_legacy_index(index.db.pool(), &config.legacy_index_path()).await {
            Ok(true) => index.checkpoint().await?,
            Ok(false) => {}
            Err(e) => {
                warn!(
                    path = %config.legacy_index_path().display(),
                    "Legacy index import aborted, continuing with an empty index; \
                     previously downloaded media may be fetched again: {e:#}"
                );
            }
        }

        Ok(index)
    }

    /// Open the store at an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    pub async fn open_at(path: &Path, save_interval: u64) -> Result<Self> {
        let db = Database::new(path).await.context("Failed to open identity index")?;
        info!(path = %path.display(), "Identity index opened");
        Ok(Self {
            db,
            save_interval: save_interval.max(1),
            updates: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Look up what is known about the content at a URL key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn lookup_by_url(&self, url_key: &str) -> Result<Option<ContentIdentity>> {
        match db::get_hash_for_url(self.db.pool(), url_key).await? {
            Some(hash) => Ok(Some(self.identity(&hash).await?)),
            None => Ok(None),
        }
    }

    /// Look up the hash last stored with an ETag.
    ///
    /// A hit is a probabilistic signal, not a proof of identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn lookup_by_etag(&self, etag: &str) -> Result<Option<String>> {
        db::get_hash_for_etag(self.db.pool(), etag).await
    }

    /// Look up the hash recorded for a partial fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn lookup_by_fingerprint(&self, fingerprint: &str) -> Result<Option<String>> {
        db::get_hash_for_fingerprint(self.db.pool(), fingerprint).await
    }

    /// Assemble the full identity of a hash.
    ///
    /// A hash with no `contents` row (possible after importing a partial
    /// legacy blob) yields an identity with no size and no paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn identity(&self, content_hash: &str) -> Result<ContentIdentity> {
        let content = db::get_content(self.db.pool(), content_hash).await?;
        let paths = db::get_paths_for_hash(self.db.pool(), content_hash).await?;

        Ok(ContentIdentity {
            content_hash: content_hash.to_string(),
            size: content
                .as_ref()
                .and_then(|c| c.size)
                .map(|s| s.max(0) as u64),
            known_paths: paths.into_iter().map(PathBuf::from).collect(),
            etag: content.and_then(|c| c.etag),
        })
    }

    /// Record a completed download. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be committed.
    pub async fn record_download(&self, download: &NewDownload) -> Result<()> {
        db::record_download(self.db.pool(), download).await?;
        debug!(
            key = %download.url_key,
            hash = %download.content_hash,
            path = %download.path.display(),
            "Recorded download"
        );
        self.note_update().await;
        Ok(())
    }

    /// Point a URL key (and ETag) at a hash matched without a download.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be committed.
    pub async fn record_alias(
        &self,
        url_key: &str,
        content_hash: &str,
        etag: Option<&str>,
    ) -> Result<()> {
        db::record_alias(self.db.pool(), url_key, content_hash, etag).await?;
        self.note_update().await;
        Ok(())
    }

    /// Add another local path for a hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn add_path(&self, content_hash: &str, path: &Path) -> Result<()> {
        db::add_path_for_hash(self.db.pool(), content_hash, &path.to_string_lossy()).await?;
        self.note_update().await;
        Ok(())
    }

    /// Persist a fingerprint found by scanning local files.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn remember_fingerprint(&self, fingerprint: &str, content_hash: &str) -> Result<()> {
        db::set_fingerprint(self.db.pool(), fingerprint, content_hash).await
    }

    /// True iff at least one recorded path for the hash is still a file.
    ///
    /// Paths may disappear at any time; this is a point-in-time check.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn has_local_copy(&self, content_hash: &str) -> Result<bool> {
        Ok(self.existing_path(content_hash).await?.is_some())
    }

    /// First recorded path for the hash that still exists on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn existing_path(&self, content_hash: &str) -> Result<Option<PathBuf>> {
        let paths = db::get_paths_for_hash(self.db.pool(), content_hash).await?;
        Ok(first_existing(&paths).await)
    }

    /// Known local copies whose content has the given size (or an unknown one).
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn candidates_with_size(&self, size: u64) -> Result<Vec<PathEntry>> {
        db::get_paths_with_size(self.db.pool(), size).await
    }

    /// Force a WAL checkpoint now.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint fails.
    pub async fn checkpoint(&self) -> Result<()> {
        self.db.checkpoint(CheckpointMode::Passive).await
    }

    /// Flush the log and close the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint fails.
    pub async fn close(&self) -> Result<()> {
        self.db.close().await
    }

    /// Number of committed updates since the index was opened.
    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    async fn note_update(&self) {
        let n = self.updates.fetch_add(1, Ordering::AcqRel) + 1;
        if n % self.save_interval == 0 {
            // The commit is already durable in the WAL; a failed checkpoint
            // only delays compaction.
            if let Err(e) = self.checkpoint().await {
                warn!("Periodic index checkpoint failed: {e:#}");
            }
        }
    }
}

/// Return the first path that is an existing regular file.
pub async fn first_existing<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Option<PathBuf> {
    for path in paths {
        let path = path.as_ref();
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.is_file() {
                return Some(path.to_path_buf());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_index(dir: &TempDir, save_interval: u64) -> IdentityIndex {
        IdentityIndex::open_at(&dir.path().join("index.sqlite"), save_interval)
            .await
            .expect("Failed to open index")
    }

    fn download(key: &str, hash: &str, path: &Path) -> NewDownload {
        NewDownload {
            url_key: key.to_string(),
            content_hash: hash.to_string(),
            path: path.to_path_buf(),
            size: Some(3),
            etag: None,
            fingerprint: None,
        }
    }

    #[tokio::test]
    async fn test_update_count_tracks_commits() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir, 2).await;
        let path = dir.path().join("a.bin");

        for _ in 0..5 {
            index.record_download(&download("u1", "h1", &path)).await.unwrap();
        }
        assert_eq!(index.update_count(), 5);
    }

    #[tokio::test]
    async fn test_unknown_url_is_none() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir, 10).await;
        assert!(index.lookup_by_url("missing").await.unwrap().is_none());
        assert!(index.lookup_by_etag("\"nope\"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_existing_skips_missing_and_dirs() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("real.bin");
        tokio::fs::write(&file, b"x").await.unwrap();
        let missing = dir.path().join("gone.bin");

        let found = first_existing([missing.as_path(), dir.path(), file.as_path()]).await;
        assert_eq!(found, Some(file));
    }
}
