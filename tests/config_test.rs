//! Integration tests for environment-driven configuration.

use std::path::PathBuf;
use std::time::Duration;

use reddit_media_dl::config::{Config, ConfigError};
use serial_test::serial;

const VARS: &[&str] = &[
    "OUTPUT_DIR",
    "PARALLEL_DOWNLOADS",
    "REQUESTS_PER_SECOND",
    "HEAD_CHECK_ENABLED",
    "PARTIAL_FINGERPRINT_ENABLED",
    "PARTIAL_SIZE",
    "SAVE_INTERVAL",
    "FORCE",
    "RETRY_FAILED",
    "TASKS_FILE",
    "REQUEST_TIMEOUT_SECS",
    "MAX_ATTEMPTS",
    "RETRY_BASE_DELAY_MS",
    "USER_AGENT",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_defaults_when_unset() {
    clear_env();

    let config = Config::from_env().expect("Failed to load config");

    assert_eq!(config.output_dir, PathBuf::from("./downloads"));
    assert_eq!(config.parallel_downloads, 4);
    assert!((config.requests_per_second - 4.0).abs() < f64::EPSILON);
    assert!(config.head_check_enabled);
    assert!(!config.partial_fingerprint_enabled);
    assert_eq!(config.partial_size, 65_536);
    assert_eq!(config.save_interval, 50);
    assert!(!config.force);
    assert!(!config.retry_failed);
    assert!(config.tasks_file.is_none());
    assert_eq!(config.request_timeout, Duration::from_secs(25));
    assert_eq!(config.max_attempts, 3);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_overrides_from_env() {
    clear_env();
    std::env::set_var("OUTPUT_DIR", "/data/reddit");
    std::env::set_var("PARALLEL_DOWNLOADS", "8");
    std::env::set_var("REQUESTS_PER_SECOND", "1.5");
    std::env::set_var("HEAD_CHECK_ENABLED", "off");
    std::env::set_var("PARTIAL_FINGERPRINT_ENABLED", "yes");
    std::env::set_var("PARTIAL_SIZE", "4096");
    std::env::set_var("FORCE", "1");
    std::env::set_var("TASKS_FILE", "/data/tasks.jsonl");
    std::env::set_var("RETRY_BASE_DELAY_MS", "250");

    let config = Config::from_env().expect("Failed to load config");
    clear_env();

    assert_eq!(config.output_dir, PathBuf::from("/data/reddit"));
    assert_eq!(config.parallel_downloads, 8);
    assert!((config.requests_per_second - 1.5).abs() < f64::EPSILON);
    assert!(!config.head_check_enabled);
    assert!(config.partial_fingerprint_enabled);
    assert_eq!(config.partial_size, 4096);
    assert!(config.force);
    assert_eq!(config.tasks_file, Some(PathBuf::from("/data/tasks.jsonl")));
    assert_eq!(config.retry_base_delay, Duration::from_millis(250));
    assert_eq!(
        config.index_path(),
        PathBuf::from("/data/reddit/.md5_index.sqlite")
    );
}

#[test]
#[serial]
fn test_unparseable_values_are_errors() {
    clear_env();

    std::env::set_var("PARALLEL_DOWNLOADS", "many");
    assert!(matches!(
        Config::from_env(),
        Err(ConfigError::ParseInt { name, .. }) if name == "PARALLEL_DOWNLOADS"
    ));
    clear_env();

    std::env::set_var("REQUESTS_PER_SECOND", "fast");
    assert!(matches!(
        Config::from_env(),
        Err(ConfigError::ParseFloat { .. })
    ));
    clear_env();

    std::env::set_var("FORCE", "maybe");
    assert!(matches!(
        Config::from_env(),
        Err(ConfigError::ParseBool { value, .. }) if value == "maybe"
    ));
    clear_env();
}

#[test]
#[serial]
fn test_zero_workers_fail_validation() {
    clear_env();
    std::env::set_var("PARALLEL_DOWNLOADS", "0");

    let config = Config::from_env().expect("Parsing should succeed");
    clear_env();

    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidValue { name, .. }) if name == "PARALLEL_DOWNLOADS"
    ));
}

#[test]
#[serial]
fn test_empty_values_use_defaults() {
    clear_env();
    std::env::set_var("SAVE_INTERVAL", "");
    std::env::set_var("TASKS_FILE", "");

    let config = Config::from_env().expect("Failed to load config");
    clear_env();

    assert_eq!(config.save_interval, 50);
    assert!(config.tasks_file.is_none());
}
