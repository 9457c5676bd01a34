//! Drives tasks end to end: dedup ladder, download with in-run retries,
//! index and ledger bookkeeping, run summary.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::constants::MAX_RETRY_DELAY_MS;
use crate::db::NewDownload;
use crate::fetch::{materialize_copy, FetchError, Fetcher};
use crate::fingerprint::{Evidence, FingerprintEngine, LadderSettings, Verdict};
use crate::index::{first_existing, IdentityIndex};
use crate::ledger::FailureLedger;
use crate::rate_limiter::RateLimiter;
use crate::scheduler::WorkerPool;
use crate::task::{FetchOutcome, MediaTask, SkipReason, TaskState};

pub struct Orchestrator {
    config: Config,
    index: Arc<IdentityIndex>,
    ledger: FailureLedger,
    fetcher: Arc<Fetcher>,
    engine: FingerprintEngine,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Open the index for `config.output_dir` and wire up the shared limiter
    /// and HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be opened or the HTTP client
    /// cannot be built.
    pub async fn open(config: Config, cancel: CancellationToken) -> Result<Self> {
        let index = Arc::new(IdentityIndex::open(&config).await?);
        let ledger = FailureLedger::new(index.database().clone());
        let limiter = Arc::new(RateLimiter::new(config.requests_per_second));
        let fetcher = Arc::new(Fetcher::new(&config, limiter, cancel.clone())?);
        let engine = FingerprintEngine::new(
            Arc::clone(&index),
            Arc::clone(&fetcher),
            LadderSettings::from(&config),
        );

        info!(
            output_dir = %config.output_dir.display(),
            workers = config.parallel_downloads,
            rps = config.requests_per_second,
            request_interval = ?fetcher.limiter().interval(),
            head_check = config.head_check_enabled,
            partial_fingerprint = config.partial_fingerprint_enabled,
            force = config.force,
            "Downloader ready"
        );

        Ok(Self {
            config,
            index,
            ledger,
            fetcher,
            engine,
            cancel,
        })
    }

    #[must_use]
    pub fn index(&self) -> &IdentityIndex {
        &self.index
    }

    #[must_use]
    pub const fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    #[must_use]
    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Build the run queue: ledger tasks first when retrying failures, then
    /// `tasks` resolved against the output directory, without duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub async fn plan(&self, tasks: Vec<MediaTask>) -> Result<Vec<MediaTask>> {
        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(tasks.len());

        if self.config.retry_failed {
            for record in self.ledger.failed_tasks().await? {
                if seen.insert(record.task.ledger_key()) {
                    planned.push(record.task);
                }
            }
            info!(count = planned.len(), "Queued previously failed tasks");
        }

        for task in tasks {
            let task = task.rooted_at(&self.config.output_dir);
            if seen.insert(task.ledger_key()) {
                planned.push(task);
            } else {
                debug!(key = %task.normalized_key, "Dropping duplicate task");
            }
        }

        Ok(planned)
    }

    /// Process every task on the worker pool and summarise the outcomes.
    ///
    /// # Errors
    ///
    /// Returns the first index or ledger failure; such a failure cancels the
    /// rest of the run.
    pub async fn run(self: &Arc<Self>, tasks: Vec<MediaTask>) -> Result<RunSummary> {
        let tasks = self.plan(tasks).await?;
        let total = tasks.len();
        info!(tasks = total, "Starting run");

        let pool = WorkerPool::new(self.config.parallel_downloads, self.cancel.clone());
        let this = Arc::clone(self);
        let report = pool
            .run(tasks, move |task| {
                let this = Arc::clone(&this);
                async move {
                    let result = this.process(&task).await;
                    if let Err(e) = &result {
                        error!(url = %task.source_url, "Index failure, stopping run: {e:#}");
                        this.cancel.cancel();
                    }
                    (task, result)
                }
            })
            .await;

        let mut summary = RunSummary {
            total,
            ..RunSummary::default()
        };
        let mut fatal = None;
        for (task, result) in report.results {
            match result {
                Ok(Some(outcome)) => summary.record(&task, &outcome),
                Ok(None) => summary.cancelled += 1,
                Err(e) => {
                    summary.cancelled += 1;
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        summary.cancelled += report.not_started.len() + report.panicked;

        if let Some(e) = fatal {
            return Err(e);
        }

        if let Err(e) = self.index.checkpoint().await {
            warn!("End-of-run checkpoint failed: {e:#}");
        }

        summary.pending_failures = self.ledger.count().await?;

        Ok(summary)
    }

    /// Drive one task to a terminal outcome.
    ///
    /// Returns `Ok(None)` if the run was cancelled before the task finished;
    /// such tasks are not recorded as failures.
    ///
    /// # Errors
    ///
    /// Returns an error only if the index or ledger cannot be used.
    pub async fn process(&self, task: &MediaTask) -> Result<Option<FetchOutcome>> {
        let mut state = TaskState::Queued;
        advance(&mut state, TaskState::Probing, task);

        match self.engine.evaluate(task).await? {
            Verdict::Cancelled => Ok(None),
            Verdict::Skip {
                reason,
                content_hash,
                evidence,
            } => {
                advance(&mut state, TaskState::Skipped, task);
                self.finish_skip(task, reason, content_hash, &evidence)
                    .await
                    .map(Some)
            }
            Verdict::Fetch(evidence) => {
                advance(&mut state, TaskState::Fetching, task);
                self.fetch_with_retries(task, evidence, &mut state).await
            }
        }
    }

    async fn finish_skip(
        &self,
        task: &MediaTask,
        reason: SkipReason,
        content_hash: String,
        evidence: &Evidence,
    ) -> Result<FetchOutcome> {
        if reason != SkipReason::AlreadyKnown {
            self.index
                .record_alias(&task.normalized_key, &content_hash, evidence.etag.as_deref())
                .await?;
        }

        let recovered_to = self.restore_target(task, &content_hash).await?;
        self.ledger.clear(task).await?;

        debug!(url = %task.source_url, %reason, hash = %content_hash, "Skipped");
        Ok(FetchOutcome::Skipped {
            reason,
            content_hash,
            recovered_to,
        })
    }

    /// Copy a surviving local file to the task's own target if it is missing.
    async fn restore_target(&self, task: &MediaTask, content_hash: &str) -> Result<Option<PathBuf>> {
        let target = task.target_path.as_path();
        if first_existing([target]).await.is_some() {
            return Ok(None);
        }

        let Some(source) = self.index.existing_path(content_hash).await? else {
            return Ok(None);
        };

        match materialize_copy(&source, target).await {
            Ok(bytes) => {
                self.index.add_path(content_hash, target).await?;
                info!(
                    from = %source.display(),
                    to = %target.display(),
                    bytes,
                    "Restored missing file from local copy"
                );
                Ok(Some(target.to_path_buf()))
            }
            Err(e) => {
                warn!(
                    from = %source.display(),
                    to = %target.display(),
                    "Could not restore missing file: {e}"
                );
                Ok(None)
            }
        }
    }

    async fn fetch_with_retries(
        &self,
        task: &MediaTask,
        evidence: Evidence,
        state: &mut TaskState,
    ) -> Result<Option<FetchOutcome>> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.fetcher.download(&task.source_url, &task.target_path).await {
                Ok(downloaded) => {
                    self.index
                        .record_download(&NewDownload {
                            url_key: task.normalized_key.clone(),
                            content_hash: downloaded.content_hash.clone(),
                            path: task.target_path.clone(),
                            size: Some(downloaded.bytes),
                            etag: downloaded.etag.or_else(|| evidence.etag.clone()),
                            fingerprint: Some(downloaded.fingerprint),
                        })
                        .await?;
                    self.ledger.clear(task).await?;
                    advance(state, TaskState::Completed, task);

                    info!(
                        url = %task.source_url,
                        path = %task.target_path.display(),
                        bytes = downloaded.bytes,
                        attempts,
                        "Downloaded"
                    );
                    return Ok(Some(FetchOutcome::Downloaded {
                        content_hash: downloaded.content_hash,
                        bytes: downloaded.bytes,
                    }));
                }
                Err(FetchError::Cancelled) => return Ok(None),
                Err(e) => e,
            };

            let retryable = error.is_retryable();
            if retryable && attempts < max_attempts {
                let delay = retry_delay(attempts, self.config.retry_base_delay);
                warn!(
                    url = %task.source_url,
                    attempt = attempts,
                    max_attempts,
                    kind = error.kind(),
                    "Download failed, retrying in {delay:?}: {error}"
                );
                advance(state, TaskState::Queued, task);

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.cancel.cancelled() => return Ok(None),
                }
                advance(state, TaskState::Probing, task);
                advance(state, TaskState::Fetching, task);
                continue;
            }

            let reason = error.to_string();
            self.ledger
                .record_failure(task, &reason, retryable, attempts)
                .await?;
            advance(state, TaskState::Failed, task);

            warn!(
                url = %task.source_url,
                path = %task.target_path.display(),
                attempts,
                retryable,
                kind = error.kind(),
                "Download failed: {reason}"
            );
            return Ok(Some(FetchOutcome::Failed {
                reason,
                retryable,
                attempts,
            }));
        }
    }

    /// Flush the index and close it.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint fails.
    pub async fn shutdown(&self) -> Result<()> {
        self.index.close().await
    }
}

fn advance(state: &mut TaskState, next: TaskState, task: &MediaTask) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal task transition {state:?} -> {next:?}"
    );
    trace!(key = %task.normalized_key, from = ?state, to = ?next, "Task state");
    *state = next;
}

/// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped, plus up to 10% jitter.
#[must_use]
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
    let capped = base
        .saturating_mul(multiplier)
        .min(Duration::from_millis(MAX_RETRY_DELAY_MS));

    let max_jitter = u64::try_from(capped.as_millis() / 10).unwrap_or(0);
    let jitter = if max_jitter == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_jitter)
    };

    capped + Duration::from_millis(jitter)
}

/// A terminal failure, as reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    pub url: String,
    pub target_path: PathBuf,
    pub reason: String,
    pub retryable: bool,
    pub attempts: u32,
}

/// Counts per outcome category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub downloaded: usize,
    pub skipped_known: usize,
    pub skipped_validator: usize,
    pub skipped_fingerprint: usize,
    /// Skips whose own target was restored from another local copy.
    pub recovered: usize,
    pub failed_retryable: usize,
    pub failed_permanent: usize,
    /// Tasks that never reached an outcome: cut short by cancellation or a
    /// worker panic, or still queued when the run stopped.
    pub cancelled: usize,
    pub bytes_downloaded: u64,
    pub failures: Vec<FailureSummary>,
    /// Ledger entries left after the run, from this run or earlier ones.
    pub pending_failures: u64,
}

impl RunSummary {
    pub fn record(&mut self, task: &MediaTask, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Downloaded { bytes, .. } => {
                self.downloaded += 1;
                self.bytes_downloaded += bytes;
            }
            FetchOutcome::Skipped {
                reason,
                recovered_to,
                ..
            } => {
                match reason {
                    SkipReason::AlreadyKnown => self.skipped_known += 1,
                    SkipReason::ValidatorMatch => self.skipped_validator += 1,
                    SkipReason::FingerprintMatch => self.skipped_fingerprint += 1,
                }
                if recovered_to.is_some() {
                    self.recovered += 1;
                }
            }
            FetchOutcome::Failed {
                reason,
                retryable,
                attempts,
            } => {
                if *retryable {
                    self.failed_retryable += 1;
                } else {
                    self.failed_permanent += 1;
                }
                self.failures.push(FailureSummary {
                    url: task.source_url.clone(),
                    target_path: task.target_path.clone(),
                    reason: reason.clone(),
                    retryable: *retryable,
                    attempts: *attempts,
                });
            }
        }
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped_known + self.skipped_validator + self.skipped_fingerprint
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed_retryable + self.failed_permanent
    }

    /// Emit the summary and each failure through `tracing`.
    pub fn log(&self) {
        info!(
            total = self.total,
            downloaded = self.downloaded,
            skipped_known = self.skipped_known,
            skipped_validator = self.skipped_validator,
            skipped_fingerprint = self.skipped_fingerprint,
            recovered = self.recovered,
            failed_retryable = self.failed_retryable,
            failed_permanent = self.failed_permanent,
            cancelled = self.cancelled,
            bytes = self.bytes_downloaded,
            pending_failures = self.pending_failures,
            "Run complete"
        );
        for failure in &self.failures {
            warn!(
                url = %failure.url,
                path = %failure.target_path.display(),
                attempts = failure.attempts,
                retryable = failure.retryable,
                "Failed: {}",
                failure.reason
            );
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks: {} downloaded ({} bytes), {} skipped ({} known, {} validator, {} fingerprint, {} restored), {} failed ({} retryable), {} cancelled",
            self.total,
            self.downloaded,
            self.bytes_downloaded,
            self.skipped(),
            self.skipped_known,
            self.skipped_validator,
            self.skipped_fingerprint,
            self.recovered,
            self.failed(),
            self.failed_retryable,
            self.cancelled,
        )
    }
}
