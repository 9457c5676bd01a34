//! Persistent record of tasks that did not complete, for later retry.

use anyhow::Result;
use tracing::debug;

use crate::db::{self, Database, FailureRecord};
use crate::task::MediaTask;

/// Failed tasks keyed by normalized key plus target path.
///
/// Shares the index store, so a failure and the absence of a download are
/// never observed in disagreement after a crash.
#[derive(Debug, Clone)]
pub struct FailureLedger {
    db: Database,
}

impl FailureLedger {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record or update a failure. Attempts accumulate across runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn record_failure(
        &self,
        task: &MediaTask,
        reason: &str,
        retryable: bool,
        attempts: u32,
    ) -> Result<()> {
        db::upsert_failed_task(self.db.pool(), task, reason, retryable, attempts).await?;
        debug!(key = %task.normalized_key, retryable, attempts, "Recorded failure");
        Ok(())
    }

    /// Forget a task after it succeeded or was skipped. Returns whether a
    /// record existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn clear(&self, task: &MediaTask) -> Result<bool> {
        db::delete_failed_task(self.db.pool(), &task.ledger_key()).await
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn get(&self, task: &MediaTask) -> Result<Option<FailureRecord>> {
        Ok(db::get_failed_task(self.db.pool(), &task.ledger_key())
            .await?
            .map(FailureRecord::from))
    }

    /// Every recorded failure, oldest attempt first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn failed_tasks(&self) -> Result<Vec<FailureRecord>> {
        Ok(db::get_failed_tasks(self.db.pool())
            .await?
            .into_iter()
            .map(FailureRecord::from)
            .collect())
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn count(&self) -> Result<u64> {
        let count = db::count_failed_tasks(self.db.pool()).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Drop every record. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn clear_all(&self) -> Result<u64> {
        db::clear_failed_tasks(self.db.pool()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IdentityIndex;
    use tempfile::TempDir;

    async fn ledger(dir: &TempDir) -> FailureLedger {
        let index = IdentityIndex::open_at(&dir.path().join("index.sqlite"), 50)
            .await
            .unwrap();
        FailureLedger::new(index.database().clone())
    }

    #[tokio::test]
    async fn test_attempts_accumulate() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir).await;
        let task = MediaTask::new("https://i.redd.it/a.jpg", "/out/a.jpg", "p1");

        ledger.record_failure(&task, "timeout", true, 3).await.unwrap();
        ledger.record_failure(&task, "HTTP 404", false, 1).await.unwrap();

        let record = ledger.get(&task).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 4);
        assert_eq!(record.reason, "HTTP 404");
        assert!(!record.retryable);
        assert_eq!(record.task, task);
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_url_different_targets() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir).await;
        let a = MediaTask::new("https://i.redd.it/a.jpg", "/out/p1/a.jpg", "p1");
        let b = MediaTask::new("https://i.redd.it/a.jpg", "/out/p2/a.jpg", "p2");

        ledger.record_failure(&a, "timeout", true, 1).await.unwrap();
        ledger.record_failure(&b, "timeout", true, 1).await.unwrap();
        assert_eq!(ledger.count().await.unwrap(), 2);

        assert!(ledger.clear(&a).await.unwrap());
        assert!(!ledger.clear(&a).await.unwrap());
        let remaining = ledger.failed_tasks().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task.post_id, "p2");
    }

    #[tokio::test]
    async fn test_clear_all() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir).await;
        for i in 0..3 {
            let task = MediaTask::new(&format!("https://i.redd.it/{i}.jpg"), format!("/out/{i}.jpg"), "p");
            ledger.record_failure(&task, "HTTP 503", true, 1).await.unwrap();
        }

        assert_eq!(ledger.clear_all().await.unwrap(), 3);
        assert_eq!(ledger.count().await.unwrap(), 0);
    }
}
