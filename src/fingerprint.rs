//! The dedup ladder.
//!
//! Each task climbs at most three rungs before a full transfer:
//!
//! 1. URL key: the normalized URL maps to a hash with a surviving local copy.
//! 2. Validators: a HEAD request's ETag maps to such a hash.
//! 3. Partial fingerprint: the hash of the first `partial_size` bytes plus the
//!    declared total size maps to such a hash.
//!
//! The stage decisions are pure functions of the evidence so they can be
//! tested without a network. [`FingerprintEngine`] gathers the evidence.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::fetch::{FetchError, Fetcher};
use crate::index::{first_existing, IdentityIndex};
use crate::task::{MediaTask, SkipReason};

/// `sha256(prefix):total_size`.
///
/// The size is part of the key so two resources sharing a header but not a
/// length never collide.
#[must_use]
pub fn partial_fingerprint(prefix: &[u8], total_size: u64) -> String {
    format!("{}:{total_size}", hex::encode(Sha256::digest(prefix)))
}

/// Outcome of one rung.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip {
        reason: SkipReason,
        content_hash: String,
    },
    Escalate,
}

/// A hash the index associates with the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub content_hash: String,
    pub has_local_copy: bool,
}

fn decide(reason: SkipReason, force: bool, matched: Option<&Match>) -> Decision {
    match matched {
        Some(m) if !force && m.has_local_copy => Decision::Skip {
            reason,
            content_hash: m.content_hash.clone(),
        },
        _ => Decision::Escalate,
    }
}

/// Rung 1. A known key whose content vanished from disk escalates.
#[must_use]
pub fn url_stage(force: bool, known: Option<&Match>) -> Decision {
    decide(SkipReason::AlreadyKnown, force, known)
}

/// Rung 2. ETag equality is probabilistic evidence; it is trusted only
/// together with a surviving local copy.
#[must_use]
pub fn validator_stage(force: bool, matched: Option<&Match>) -> Decision {
    decide(SkipReason::ValidatorMatch, force, matched)
}

/// Rung 3.
#[must_use]
pub fn fingerprint_stage(force: bool, matched: Option<&Match>) -> Decision {
    decide(SkipReason::FingerprintMatch, force, matched)
}

/// Bytes to request for the range probe, or `None` when rung 3 cannot apply.
#[must_use]
pub fn probe_len(partial_size: u64, declared_size: Option<u64>) -> Option<u64> {
    match declared_size {
        Some(0) => None,
        Some(size) => Some(size.min(partial_size)),
        None => Some(partial_size),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LadderSettings {
    pub force: bool,
    pub head_check_enabled: bool,
    pub partial_fingerprint_enabled: bool,
    pub partial_size: u64,
}

impl From<&Config> for LadderSettings {
    fn from(config: &Config) -> Self {
        Self {
            force: config.force,
            head_check_enabled: config.head_check_enabled,
            partial_fingerprint_enabled: config.partial_fingerprint_enabled,
            partial_size: config.partial_size,
        }
    }
}

/// What the probes learned about a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evidence {
    pub etag: Option<String>,
    pub declared_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Skip {
        reason: SkipReason,
        content_hash: String,
        evidence: Evidence,
    },
    Fetch(Evidence),
    Cancelled,
}

pub struct FingerprintEngine {
    index: Arc<IdentityIndex>,
    fetcher: Arc<Fetcher>,
    settings: LadderSettings,
    // content hash -> fingerprint of a local copy, computed at most once per run
    local_fingerprints: Mutex<HashMap<String, String>>,
}

impl FingerprintEngine {
    #[must_use]
    pub fn new(index: Arc<IdentityIndex>, fetcher: Arc<Fetcher>, settings: LadderSettings) -> Self {
        Self {
            index,
            fetcher,
            settings,
            local_fingerprints: Mutex::new(HashMap::new()),
        }
    }

    /// Climb the ladder for one task.
    ///
    /// Probe failures are inconclusive and escalate; only index failures are
    /// returned as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or written.
    pub async fn evaluate(&self, task: &MediaTask) -> Result<Verdict> {
        let mut evidence = Evidence::default();
        if self.settings.force {
            return Ok(Verdict::Fetch(evidence));
        }

        let known = match self.index.lookup_by_url(&task.normalized_key).await? {
            Some(identity) => Some(Match {
                has_local_copy: first_existing(&identity.known_paths)
                    .await
                    .is_some(),
                content_hash: identity.content_hash,
            }),
            None => None,
        };
        if let Decision::Skip {
            reason,
            content_hash,
        } = url_stage(false, known.as_ref())
        {
            debug!(key = %task.normalized_key, hash = %content_hash, "Already downloaded");
            return Ok(Verdict::Skip {
                reason,
                content_hash,
                evidence,
            });
        }
        if let Some(m) = &known {
            debug!(
                key = %task.normalized_key,
                hash = %m.content_hash,
                "Known URL has no local copy left, probing"
            );
        }

        if self.settings.head_check_enabled {
            match self.fetcher.head(&task.source_url).await {
                Ok(head) => {
                    evidence.etag = head.etag;
                    evidence.declared_size = head.content_length;
                }
                Err(FetchError::Cancelled) => return Ok(Verdict::Cancelled),
                Err(e) => debug!(url = %task.source_url, "HEAD probe inconclusive: {e}"),
            }

            if let Some(etag) = &evidence.etag {
                let hash = self.index.lookup_by_etag(etag).await?;
                let matched = self.with_local_state(hash).await?;
                if let Decision::Skip {
                    reason,
                    content_hash,
                } = validator_stage(false, matched.as_ref())
                {
                    info!(
                        url = %task.source_url,
                        etag = %etag,
                        hash = %content_hash,
                        "Skipping download, ETag matches known content"
                    );
                    return Ok(Verdict::Skip {
                        reason,
                        content_hash,
                        evidence,
                    });
                }
            }
        }

        if self.settings.partial_fingerprint_enabled {
            match self.fingerprint_match(task, &mut evidence).await? {
                FingerprintProbe::Matched(m) => {
                    if let Decision::Skip {
                        reason,
                        content_hash,
                    } = fingerprint_stage(false, Some(&m))
                    {
                        info!(
                            url = %task.source_url,
                            hash = %content_hash,
                            "Skipping download, partial fingerprint matches known content"
                        );
                        return Ok(Verdict::Skip {
                            reason,
                            content_hash,
                            evidence,
                        });
                    }
                }
                FingerprintProbe::Cancelled => return Ok(Verdict::Cancelled),
                FingerprintProbe::NoMatch => {}
            }
        }

        Ok(Verdict::Fetch(evidence))
    }

    async fn fingerprint_match(
        &self,
        task: &MediaTask,
        evidence: &mut Evidence,
    ) -> Result<FingerprintProbe> {
        let partial_size = self.settings.partial_size;
        let Some(len) = probe_len(partial_size, evidence.declared_size) else {
            return Ok(FingerprintProbe::NoMatch);
        };

        let probe = match self.fetcher.range_probe(&task.source_url, len).await {
            Ok(probe) => probe,
            Err(FetchError::Cancelled) => return Ok(FingerprintProbe::Cancelled),
            Err(e) => {
                debug!(url = %task.source_url, "Range probe inconclusive: {e}");
                return Ok(FingerprintProbe::NoMatch);
            }
        };

        let Some(total) = probe.total_size.or(evidence.declared_size).filter(|&t| t > 0) else {
            debug!(url = %task.source_url, "No declared size, fingerprint stage skipped");
            return Ok(FingerprintProbe::NoMatch);
        };
        evidence.declared_size = Some(total);

        let k = usize::try_from(partial_size.min(total)).unwrap_or(usize::MAX);
        if probe.prefix.len() < k {
            debug!(
                url = %task.source_url,
                got = probe.prefix.len(),
                wanted = k,
                "Range probe returned a short prefix"
            );
            return Ok(FingerprintProbe::NoMatch);
        }

        let fingerprint = partial_fingerprint(&probe.prefix[..k], total);
        let hash = match self.index.lookup_by_fingerprint(&fingerprint).await? {
            Some(hash) => Some(hash),
            None => self.scan_local_copies(&fingerprint, total).await?,
        };

        Ok(match self.with_local_state(hash).await? {
            Some(m) => FingerprintProbe::Matched(m),
            None => FingerprintProbe::NoMatch,
        })
    }

    /// Compare against fingerprints of local files with the same size.
    ///
    /// A match is written back to the index so later runs hit the table
    /// directly.
    async fn scan_local_copies(&self, fingerprint: &str, total: u64) -> Result<Option<String>> {
        let k = self.settings.partial_size.min(total);

        for entry in self.index.candidates_with_size(total).await? {
            let cached = self
                .local_fingerprints
                .lock()
                .await
                .get(&entry.content_hash)
                .cloned();

            let local = match cached {
                Some(fp) => fp,
                None => {
                    let Some(fp) = local_fingerprint(Path::new(&entry.path), k, total).await else {
                        continue;
                    };
                    self.local_fingerprints
                        .lock()
                        .await
                        .insert(entry.content_hash.clone(), fp.clone());
                    fp
                }
            };

            if local == fingerprint {
                self.index
                    .remember_fingerprint(fingerprint, &entry.content_hash)
                    .await?;
                debug!(hash = %entry.content_hash, path = %entry.path, "Fingerprint matched a local file");
                return Ok(Some(entry.content_hash));
            }
        }

        Ok(None)
    }

    async fn with_local_state(&self, hash: Option<String>) -> Result<Option<Match>> {
        match hash {
            Some(content_hash) => Ok(Some(Match {
                has_local_copy: self.index.has_local_copy(&content_hash).await?,
                content_hash,
            })),
            None => Ok(None),
        }
    }
}

enum FingerprintProbe {
    Matched(Match),
    NoMatch,
    Cancelled,
}

/// Fingerprint of a local file, if it exists with exactly `total` bytes.
async fn local_fingerprint(path: &Path, k: u64, total: u64) -> Option<String> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() || meta.len() != total {
        return None;
    }

    let file = tokio::fs::File::open(path).await.ok()?;
    let mut prefix = Vec::new();
    file.take(k).read_to_end(&mut prefix).await.ok()?;
    if prefix.len() as u64 != k {
        return None;
    }

    Some(partial_fingerprint(&prefix, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(hash: &str, local: bool) -> Match {
        Match {
            content_hash: hash.to_string(),
            has_local_copy: local,
        }
    }

    #[test]
    fn test_url_stage() {
        assert_eq!(
            url_stage(false, Some(&found("h", true))),
            Decision::Skip {
                reason: SkipReason::AlreadyKnown,
                content_hash: "h".into()
            }
        );
        assert_eq!(url_stage(false, Some(&found("h", false))), Decision::Escalate);
        assert_eq!(url_stage(false, None), Decision::Escalate);
    }

    #[test]
    fn test_force_always_escalates() {
        let m = found("h", true);
        assert_eq!(url_stage(true, Some(&m)), Decision::Escalate);
        assert_eq!(validator_stage(true, Some(&m)), Decision::Escalate);
        assert_eq!(fingerprint_stage(true, Some(&m)), Decision::Escalate);
    }

    #[test]
    fn test_validator_needs_local_copy() {
        assert_eq!(validator_stage(false, Some(&found("h", false))), Decision::Escalate);
        assert!(matches!(
            validator_stage(false, Some(&found("h", true))),
            Decision::Skip {
                reason: SkipReason::ValidatorMatch,
                ..
            }
        ));
    }

    #[test]
    fn test_fingerprint_stage_reason() {
        assert!(matches!(
            fingerprint_stage(false, Some(&found("h", true))),
            Decision::Skip {
                reason: SkipReason::FingerprintMatch,
                ..
            }
        ));
    }

    #[test]
    fn test_probe_len() {
        assert_eq!(probe_len(65_536, Some(1_000)), Some(1_000));
        assert_eq!(probe_len(65_536, Some(10_000_000)), Some(65_536));
        assert_eq!(probe_len(65_536, None), Some(65_536));
        assert_eq!(probe_len(65_536, Some(0)), None);
    }

    #[test]
    fn test_fingerprint_includes_size() {
        let a = partial_fingerprint(b"same header", 100);
        let b = partial_fingerprint(b"same header", 101);
        assert_ne!(a, b);
        assert!(a.ends_with(":100"));
        assert_eq!(a.split(':').next().map(str::len), Some(64));
    }

    #[tokio::test]
    async fn test_local_fingerprint_requires_exact_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        assert_eq!(
            local_fingerprint(&path, 4, 10).await,
            Some(partial_fingerprint(b"0123", 10))
        );
        assert_eq!(local_fingerprint(&path, 4, 11).await, None);
        assert_eq!(local_fingerprint(&dir.path().join("missing"), 4, 10).await, None);
    }
}
