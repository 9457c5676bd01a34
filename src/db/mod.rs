mod legacy;
mod migrations;
mod models;
mod queries;

pub use legacy::{import_legacy_index, LegacyIndex};
pub use models::*;
pub use queries::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

/// WAL checkpoint strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Copy as much of the log as possible without waiting on readers.
    Passive,
    /// Copy the whole log and truncate it to zero bytes.
    Truncate,
}

impl CheckpointMode {
    fn pragma(self) -> &'static str {
        match self {
            Self::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            Self::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the index database, running migrations if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails, the file fails an integrity
    /// check, or migrations fail.
    pub async fn new(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Workers commit concurrently; writes are serialized by SQLite, so
            // wait for the lock instead of failing with SQLITE_BUSY.
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // Checkpoints are driven by the save interval, not by page count.
                    sqlx::query("PRAGMA wal_autocheckpoint = 0")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA temp_store = MEMORY")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open index database: {}", path.display()))?;

        let db = Self { pool };
        db.verify_integrity(path).await?;
        db.run_migrations().await?;
        db.verify_writable(path).await?;

        Ok(db)
    }

    async fn verify_integrity(&self, path: &Path) -> Result<()> {
        let (status,): (String,) = sqlx::query_as("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Index database is unreadable: {}", path.display()))?;

        if status != "ok" {
            bail!(
                "Index database failed integrity check ({status}): {}",
                path.display()
            );
        }
        Ok(())
    }

    async fn verify_writable(&self, path: &Path) -> Result<()> {
        // Starting a transaction requires write capability on SQLite.
        let tx = self.pool.begin().await.with_context(|| {
            format!(
                "Index database is not writable (path: {}). Check directory permissions",
                path.display()
            )
        })?;

        tx.commit()
            .await
            .context("Failed to commit index writability check")?;
        Ok(())
    }

    /// Run all pending migrations.
    async fn run_migrations(&self) -> Result<()> {
        migrations::run(&self.pool).await?;
        debug!("Index migrations complete");
        Ok(())
    }

    /// Fold the write-ahead log into the main database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint statement fails.
    pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        let (busy, log_frames, checkpointed): (i64, i64, i64) = sqlx::query_as(mode.pragma())
            .fetch_one(&self.pool)
            .await
            .context("Failed to checkpoint index WAL")?;

        debug!(
            ?mode,
            busy, log_frames, checkpointed, "Checkpointed index WAL"
        );
        Ok(())
    }

    /// Checkpoint and close every pooled connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint fails; the pool is closed
    /// regardless.
    pub async fn close(&self) -> Result<()> {
        let result = self.checkpoint(CheckpointMode::Truncate).await;
        self.pool.close().await;
        info!("Index database closed");
        result
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
