//! Shared constants used across the application.

/// User agent string sent with every media request.
///
/// Reddit's CDN rejects requests that look like anonymous scripts, so this
/// identifies the tool the way the API guidelines ask.
pub const DEFAULT_USER_AGENT: &str = "linux:reddit-media-dl:v0.1.0 (media archiver)";

/// Index database file name inside the output directory.
pub const INDEX_DB_FILE: &str = ".md5_index.sqlite";

/// Legacy single-blob index file name inside the output directory.
pub const LEGACY_INDEX_FILE: &str = ".md5_index.json";

/// Default number of bytes read by the partial-range probe.
pub const DEFAULT_PARTIAL_SIZE: u64 = 65_536;

/// Default number of index updates between WAL checkpoints.
pub const DEFAULT_SAVE_INTERVAL: u64 = 50;

/// Default number of attempts per task within one run.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Upper bound on a single backoff sleep.
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Referer sent to Reddit-hosted media, which sometimes rejects requests without it.
pub const REDDIT_REFERER: &str = "https://www.reddit.com/";
