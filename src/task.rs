//! Units of work and their terminal outcomes.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::normalize::normalize_media_url;

/// One media asset to materialise on disk.
///
/// Tasks are produced by the post enumerator and are never mutated once
/// queued. `normalized_key` is the dedup lookup key and must be stable across
/// runs for the same logical resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTask {
    pub source_url: String,
    pub normalized_key: String,
    pub target_path: PathBuf,
    pub post_id: String,
    #[serde(default)]
    pub expected_kind: MediaKind,
}

impl MediaTask {
    /// Build a task, deriving the key with the default URL canonicaliser.
    #[must_use]
    pub fn new(source_url: &str, target_path: impl Into<PathBuf>, post_id: &str) -> Self {
        Self {
            source_url: source_url.to_string(),
            normalized_key: normalize_media_url(source_url),
            target_path: target_path.into(),
            post_id: post_id.to_string(),
            expected_kind: MediaKind::from_url(source_url),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: &str) -> Self {
        self.normalized_key = key.to_string();
        self
    }

    /// Key used by the failure ledger.
    ///
    /// The same URL may be destined for several posts, so the target path is
    /// part of the identity of a task.
    #[must_use]
    pub fn ledger_key(&self) -> String {
        format!("{}\n{}", self.normalized_key, self.target_path.display())
    }

    /// Resolve a relative target path against the output directory.
    #[must_use]
    pub fn rooted_at(mut self, output_dir: &Path) -> Self {
        if self.target_path.is_relative() {
            self.target_path = output_dir.join(&self.target_path);
        }
        self
    }
}

/// Task line as it appears in a tasks file, where the key is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskLine {
    pub source_url: String,
    #[serde(default)]
    pub normalized_key: Option<String>,
    pub target_path: PathBuf,
    #[serde(default)]
    pub post_id: String,
    #[serde(default)]
    pub expected_kind: Option<MediaKind>,
}

impl From<TaskLine> for MediaTask {
    fn from(line: TaskLine) -> Self {
        let mut task = MediaTask::new(&line.source_url, line.target_path, &line.post_id);
        if let Some(key) = line.normalized_key.filter(|k| !k.is_empty()) {
            task.normalized_key = key;
        }
        if let Some(kind) = line.expected_kind {
            task.expected_kind = kind;
        }
        task
    }
}

/// Read a JSON-lines task file.
///
/// Relative targets are kept as written; the orchestrator resolves them
/// against the output directory when planning the run.
///
/// Blank lines and `#` comments are ignored. Malformed lines are logged and
/// skipped so one bad entry does not sink the whole batch.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn load_task_file(path: &Path) -> Result<Vec<MediaTask>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read tasks file: {}", path.display()))?;

    let mut tasks = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<TaskLine>(line) {
            Ok(parsed) => tasks.push(MediaTask::from(parsed)),
            Err(e) => warn!(path = %path.display(), line = i + 1, "Skipping malformed task: {e}"),
        }
    }

    Ok(tasks)
}

/// Broad media category, used for logging and summaries only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    #[default]
    Other,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s {
            "image" => Self::Image,
            "video" => Self::Video,
            _ => Self::Other,
        }
    }

    /// Guess the kind from the URL path extension.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
        let ext = path.rsplit_once('.').map_or("", |(_, ext)| ext);
        match ext {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" => Self::Image,
            "mp4" | "webm" | "mov" | "mkv" | "m3u8" | "gifv" => Self::Video,
            _ => Self::Other,
        }
    }
}

/// Why a task did not need a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The URL key maps to a hash that still has a local copy.
    AlreadyKnown,
    /// The HEAD ETag maps to a hash that still has a local copy.
    ValidatorMatch,
    /// The prefix hash plus declared size maps to a hash with a local copy.
    FingerprintMatch,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyKnown => "already_known",
            Self::ValidatorMatch => "validator_match",
            Self::FingerprintMatch => "fingerprint_match",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged result of processing one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Skipped {
        reason: SkipReason,
        content_hash: String,
        /// Set when the skipped task's own target was restored from another
        /// known copy.
        recovered_to: Option<PathBuf>,
    },
    Downloaded {
        content_hash: String,
        bytes: u64,
    },
    Failed {
        reason: String,
        retryable: bool,
        attempts: u32,
    },
}

impl FetchOutcome {
    #[must_use]
    pub fn skipped(reason: SkipReason, content_hash: impl Into<String>) -> Self {
        Self::Skipped {
            reason,
            content_hash: content_hash.into(),
            recovered_to: None,
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    #[must_use]
    pub fn content_hash(&self) -> Option<&str> {
        match self {
            Self::Skipped { content_hash, .. } | Self::Downloaded { content_hash, .. } => {
                Some(content_hash)
            }
            Self::Failed { .. } => None,
        }
    }
}

/// Per-task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Probing,
    Skipped,
    Fetching,
    Completed,
    Failed,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Fetching -> Queued` is the in-run retry edge.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Probing)
                | (Self::Probing, Self::Skipped | Self::Fetching)
                | (Self::Fetching, Self::Completed | Self::Failed | Self::Queued)
        )
    }
}
