//! HTTP transfers: HEAD probes, range probes and streamed downloads.
//!
//! Every request made here takes a slot from the shared [`RateLimiter`]
//! first, so all workers together stay under the configured rate no matter
//! which dedup stage issued the call.

mod error;

use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, RANGE, REFERER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use error::{is_retryable_status, FetchError};

use crate::config::Config;
use crate::constants::REDDIT_REFERER;
use crate::fingerprint::partial_fingerprint;
use crate::rate_limiter::RateLimiter;

/// Validators and size reported by a HEAD request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadInfo {
    pub etag: Option<String>,
    pub content_length: Option<u64>,
}

/// Leading bytes of a resource plus its total size, if the server said.
#[derive(Debug, Clone)]
pub struct RangeProbe {
    pub prefix: Vec<u8>,
    pub total_size: Option<u64>,
}

/// A body written to its target path.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub content_hash: String,
    pub bytes: u64,
    pub etag: Option<String>,
    pub fingerprint: String,
}

pub struct Fetcher {
    client: Client,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    timeout: Duration,
    partial_size: u64,
}

impl Fetcher {
    /// Build a fetcher sharing `limiter` with every other fetcher of the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        config: &Config,
        limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            limiter,
            cancel,
            timeout: config.request_timeout,
            partial_size: config.partial_size,
        })
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Fetch validators without a body.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn head(&self, url: &str) -> Result<HeadInfo, FetchError> {
        let response = self.send(self.request(Method::HEAD, url)?).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        // `Response::content_length` reports the (empty) HEAD body, so read
        // the header directly.
        Ok(HeadInfo {
            etag: header_str(response.headers(), &ETAG),
            content_length: header_u64(response.headers(), &CONTENT_LENGTH),
        })
    }

    /// Read up to `len` leading bytes with a single `Range` request.
    ///
    /// Servers that ignore the range answer 200 with the whole body; the
    /// transfer is abandoned once `len` bytes have arrived.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn range_probe(&self, url: &str, len: u64) -> Result<RangeProbe, FetchError> {
        let request = self
            .request(Method::GET, url)?
            .header(RANGE, format!("bytes=0-{}", len.saturating_sub(1)));
        let response = self.send(request).await?;
        let status = response.status();

        let total_size = match status {
            StatusCode::PARTIAL_CONTENT => header_str(response.headers(), &CONTENT_RANGE)
                .as_deref()
                .and_then(content_range_total),
            s if s.is_success() => header_u64(response.headers(), &CONTENT_LENGTH),
            s => return Err(FetchError::Status(s)),
        };

        let wanted = usize::try_from(len).unwrap_or(usize::MAX);
        let mut prefix = Vec::with_capacity(wanted.min(1 << 20));
        let mut stream = pin!(response.bytes_stream());
        while prefix.len() < wanted {
            match self.next_chunk(&mut stream).await? {
                Some(chunk) => prefix.extend_from_slice(chunk.as_ref()),
                None => break,
            }
        }
        prefix.truncate(wanted);

        Ok(RangeProbe { prefix, total_size })
    }

    /// Stream a resource to `target`, hashing it on the way.
    ///
    /// The body goes to a temporary file beside the target and is renamed
    /// into place only after the last byte is flushed. Any failure, including
    /// cancellation, drops the temporary file.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a non-success status, an HTML
    /// response, a truncated body or a local filesystem error.
    pub async fn download(&self, url: &str, target: &Path) -> Result<Downloaded, FetchError> {
        let dir = parent_dir(target);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FetchError::io(&dir, e))?;

        let response = self.send(self.request(Method::GET, url)?).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        if let Some(content_type) = header_str(response.headers(), &CONTENT_TYPE) {
            if is_html(&content_type) {
                return Err(FetchError::HtmlResponse { content_type });
            }
        }

        let declared = header_u64(response.headers(), &CONTENT_LENGTH);
        let etag = header_str(response.headers(), &ETAG);

        let (file, temp_path) = tempfile::Builder::new()
            .prefix(".")
            .suffix(".part")
            .tempfile_in(&dir)
            .map_err(|e| FetchError::io(&dir, e))?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let prefix_cap = usize::try_from(self.partial_size).unwrap_or(usize::MAX);
        let mut prefix = Vec::new();
        let mut hasher = Sha256::new();
        let mut bytes = 0u64;

        let mut stream = pin!(response.bytes_stream());
        while let Some(chunk) = self.next_chunk(&mut stream).await? {
            let data: &[u8] = chunk.as_ref();
            hasher.update(data);
            if prefix.len() < prefix_cap {
                let take = (prefix_cap - prefix.len()).min(data.len());
                prefix.extend_from_slice(&data[..take]);
            }
            file.write_all(data)
                .await
                .map_err(|e| FetchError::io(&*temp_path, e))?;
            bytes += data.len() as u64;
        }

        if let Some(expected) = declared {
            if expected != bytes {
                return Err(FetchError::Body(format!(
                    "received {bytes} of {expected} bytes"
                )));
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::io(&*temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| FetchError::io(&*temp_path, e))?;
        drop(file);

        temp_path
            .persist(target)
            .map_err(|e| FetchError::io(target, e.error))?;

        let content_hash = hex::encode(hasher.finalize());
        debug!(url = %url, path = %target.display(), bytes, hash = %content_hash, "Download complete");

        Ok(Downloaded {
            content_hash,
            bytes,
            etag,
            fingerprint: partial_fingerprint(&prefix, bytes),
        })
    }

    fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!(
                "{url}: unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let is_reddit = parsed
            .host_str()
            .is_some_and(|h| h == "redd.it" || h.ends_with(".redd.it"));

        let mut request = self.client.request(method, parsed);
        if is_reddit {
            request = request.header(REFERER, REDDIT_REFERER);
        }
        Ok(request)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, FetchError> {
        self.limiter
            .acquire(&self.cancel)
            .await
            .map_err(|_| FetchError::Cancelled)?;

        let sent = tokio::select! {
            sent = tokio::time::timeout(self.timeout, request.send()) => sent,
            () = self.cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        let response = sent.map_err(|_| FetchError::Timeout(self.timeout))??;
        Ok(response)
    }

    /// Next body chunk, bounded by the per-read timeout.
    async fn next_chunk<S, B>(&self, stream: &mut S) -> Result<Option<B>, FetchError>
    where
        S: Stream<Item = reqwest::Result<B>> + Unpin,
    {
        let next = tokio::select! {
            next = tokio::time::timeout(self.timeout, stream.next()) => next,
            () = self.cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        match next {
            Err(_) => Err(FetchError::Timeout(self.timeout)),
            Ok(None) => Ok(None),
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(e))) => Err(FetchError::Body(e.to_string())),
        }
    }
}

/// Place a copy of a local file at `target`, atomically.
///
/// # Errors
///
/// Returns an error if the source cannot be read or the target written.
pub async fn materialize_copy(source: &Path, target: &Path) -> Result<u64, FetchError> {
    let dir = parent_dir(target);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| FetchError::io(&dir, e))?;

    let temp_path = tempfile::Builder::new()
        .prefix(".")
        .suffix(".part")
        .tempfile_in(&dir)
        .map_err(|e| FetchError::io(&dir, e))?
        .into_temp_path();

    let copied = tokio::fs::copy(source, &temp_path)
        .await
        .map_err(|e| FetchError::io(source, e))?;

    temp_path
        .persist(target)
        .map_err(|e| FetchError::io(target, e.error))?;

    Ok(copied)
}

fn parent_dir(target: &Path) -> PathBuf {
    match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn header_str(headers: &HeaderMap, name: &reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn header_u64(headers: &HeaderMap, name: &reqwest::header::HeaderName) -> Option<u64> {
    header_str(headers, name).and_then(|s| s.parse().ok())
}

/// Total length from `Content-Range: bytes 0-99/1234`. `*` means unknown.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

fn is_html(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "text/html" || mime == "application/xhtml+xml"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 0-99/1234"), Some(1234));
        assert_eq!(content_range_total("bytes 0-99/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }

    #[test]
    fn test_is_html() {
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("TEXT/HTML"));
        assert!(is_html("application/xhtml+xml"));
        assert!(!is_html("image/jpeg"));
        assert!(!is_html("video/mp4"));
    }

    #[test]
    fn test_parent_dir_of_bare_name() {
        assert_eq!(parent_dir(Path::new("a.jpg")), PathBuf::from("."));
        assert_eq!(parent_dir(Path::new("/out/p/a.jpg")), PathBuf::from("/out/p"));
    }

    #[tokio::test]
    async fn test_materialize_copy_creates_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("src.bin");
        tokio::fs::write(&source, b"payload").await.unwrap();
        let target = dir.path().join("nested/deeper/copy.bin");

        let copied = materialize_copy(&source, &target).await.unwrap();

        assert_eq!(copied, 7);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"payload");
    }
}
