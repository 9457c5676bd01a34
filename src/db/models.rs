use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{MediaKind, MediaTask};

/// Everything the index knows about one piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentIdentity {
    pub content_hash: String,
    /// `None` for rows imported from the legacy index, which never recorded sizes.
    pub size: Option<u64>,
    pub known_paths: BTreeSet<PathBuf>,
    pub etag: Option<String>,
}

/// A row in the `contents` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentRow {
    pub content_hash: String,
    pub size: Option<i64>,
    pub etag: Option<String>,
    pub first_seen_at: String,
}

/// A known local copy joined with the declared size of its content.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PathEntry {
    pub content_hash: String,
    pub path: String,
    pub size: Option<i64>,
}

/// Data for recording a completed download.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub url_key: String,
    pub content_hash: String,
    pub path: PathBuf,
    pub size: Option<u64>,
    pub etag: Option<String>,
    pub fingerprint: Option<String>,
}

/// A row in the `failed_tasks` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailedTaskRow {
    pub task_key: String,
    pub source_url: String,
    pub normalized_key: String,
    pub target_path: String,
    pub post_id: String,
    pub expected_kind: String,
    pub reason: String,
    pub retryable: bool,
    pub attempt_count: i64,
    pub last_attempt_at: String,
}

/// A persisted failure, carrying enough of the task to resubmit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub task: MediaTask,
    pub reason: String,
    pub retryable: bool,
    pub attempt_count: u32,
    pub last_attempt_time: DateTime<Utc>,
}

impl From<FailedTaskRow> for FailureRecord {
    fn from(row: FailedTaskRow) -> Self {
        let last_attempt_time = DateTime::parse_from_rfc3339(&row.last_attempt_at)
            .map_or_else(|_| DateTime::<Utc>::UNIX_EPOCH, |t| t.with_timezone(&Utc));

        Self {
            task: MediaTask {
                source_url: row.source_url,
                normalized_key: row.normalized_key,
                target_path: PathBuf::from(row.target_path),
                post_id: row.post_id,
                expected_kind: MediaKind::from_str(&row.expected_kind),
            },
            reason: row.reason,
            retryable: row.retryable,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(u32::MAX),
            last_attempt_time,
        }
    }
}
