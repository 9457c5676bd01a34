use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::constants::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PARTIAL_SIZE, DEFAULT_SAVE_INTERVAL, DEFAULT_USER_AGENT,
    INDEX_DB_FILE, LEGACY_INDEX_FILE,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as number: {source}")]
    ParseFloat {
        name: String,
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Downloader configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub output_dir: PathBuf,

    // Workers
    pub parallel_downloads: usize,
    pub requests_per_second: f64,

    // Dedup ladder
    pub head_check_enabled: bool,
    pub partial_fingerprint_enabled: bool,
    pub partial_size: u64,

    // Index
    pub save_interval: u64,

    // Run mode
    pub force: bool,
    pub retry_failed: bool,
    pub tasks_file: Option<PathBuf>,

    // Network
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub user_agent: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Storage
            output_dir: PathBuf::from(env_or_default("OUTPUT_DIR", "./downloads")),

            // Workers
            parallel_downloads: parse_env_usize("PARALLEL_DOWNLOADS", 4)?,
            requests_per_second: parse_env_f64("REQUESTS_PER_SECOND", 4.0)?,

            // Dedup ladder
            head_check_enabled: parse_env_bool("HEAD_CHECK_ENABLED", true)?,
            partial_fingerprint_enabled: parse_env_bool("PARTIAL_FINGERPRINT_ENABLED", false)?,
            partial_size: parse_env_u64("PARTIAL_SIZE", DEFAULT_PARTIAL_SIZE)?,

            // Index
            save_interval: parse_env_u64("SAVE_INTERVAL", DEFAULT_SAVE_INTERVAL)?,

            // Run mode
            force: parse_env_bool("FORCE", false)?,
            retry_failed: parse_env_bool("RETRY_FAILED", false)?,
            tasks_file: optional_env("TASKS_FILE").map(PathBuf::from),

            // Network
            request_timeout: Duration::from_secs(parse_env_u64("REQUEST_TIMEOUT_SECS", 25)?),
            max_attempts: parse_env_u32("MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            retry_base_delay: Duration::from_millis(parse_env_u64("RETRY_BASE_DELAY_MS", 1000)?),
            user_agent: env_or_default("USER_AGENT", DEFAULT_USER_AGENT),
        })
    }

    /// Default configuration rooted at `output_dir`.
    #[must_use]
    pub fn for_output_dir(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            parallel_downloads: 4,
            requests_per_second: 4.0,
            head_check_enabled: true,
            partial_fingerprint_enabled: false,
            partial_size: DEFAULT_PARTIAL_SIZE,
            save_interval: DEFAULT_SAVE_INTERVAL,
            force: false,
            retry_failed: false,
            tasks_file: None,
            request_timeout: Duration::from_secs(25),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_secs(1),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_downloads == 0 {
            return Err(invalid("PARALLEL_DOWNLOADS", "must be at least 1"));
        }
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(invalid(
                "REQUESTS_PER_SECOND",
                "must be a positive, finite number",
            ));
        }
        if self.partial_size == 0 {
            return Err(invalid("PARTIAL_SIZE", "must be at least 1 byte"));
        }
        if self.save_interval == 0 {
            return Err(invalid("SAVE_INTERVAL", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("REQUEST_TIMEOUT_SECS", "must be at least 1"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(invalid("OUTPUT_DIR", "cannot be empty"));
        }
        Ok(())
    }

    /// Path of the index database, scoped to the output directory.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.output_dir.join(INDEX_DB_FILE)
    }

    /// Path of the legacy JSON index, if one was left by an older version.
    #[must_use]
    pub fn legacy_index_path(&self) -> PathBuf {
        self.output_dir.join(LEGACY_INDEX_FILE)
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseFloat {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_env_bool("NONEXISTENT_VAR", true).unwrap());
        assert!(!parse_env_bool("NONEXISTENT_VAR", false).unwrap());
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config::for_output_dir(Path::new("/tmp/out"));
        assert!(config.validate().is_ok());
        assert_eq!(config.index_path(), PathBuf::from("/tmp/out/.md5_index.sqlite"));
        assert_eq!(
            config.legacy_index_path(),
            PathBuf::from("/tmp/out/.md5_index.json")
        );
    }

    #[test]
    fn test_validate_rejects_zero_partial_size() {
        let config = Config {
            partial_size: 0,
            ..Config::for_output_dir(Path::new("/tmp/out"))
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { name, .. }) if name == "PARTIAL_SIZE"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_rate() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = Config {
                requests_per_second: rate,
                ..Config::for_output_dir(Path::new("/tmp/out"))
            };
            assert!(config.validate().is_err(), "rate {rate} should be rejected");
        }
    }
}
