//! Unit tests for configuration layering.

use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use once_cell::sync::Lazy;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const LAYERED_VARS: &[&str] = &[
    CONFIG_PATH_ENV,
    LOG_FILTER_ENV,
    LOG_FORMAT_ENV,
    MAX_MSG_SIZE_ENV,
    MONITOR_POLL_INTERVAL_ENV,
    DEFAULT_WALL_TIME_LIMIT_ENV,
];

/// Holds the environment lock and restores every `WARDEN_*` variable on drop.
struct EnvGuard {
    saved: Vec<(&'static str, Option<OsString>)>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvGuard {
    fn set(&self, key: &'static str, value: &str) {
        // Environment mutation is unsafe under edition 2024; the lock keeps
        // tests in this binary from racing on it.
        unsafe { std::env::set_var(key, value) };
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..) {
            match value {
                Some(value) => unsafe { std::env::set_var(key, value) },
                None => unsafe { std::env::remove_var(key) },
            }
        }
    }
}

#[fixture]
fn env() -> EnvGuard {
    let lock = ENV_MUTEX.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let saved = LAYERED_VARS
        .iter()
        .map(|key| (*key, std::env::var_os(key)))
        .collect();
    for key in LAYERED_VARS {
        unsafe { std::env::remove_var(key) };
    }
    EnvGuard { saved, _lock: lock }
}

fn load(args: &[&str]) -> Result<Config, ConfigError> {
    Config::from_args(std::iter::once("warden").chain(args.iter().copied()))
}

fn file_paths(error: &OrthoError) -> Vec<PathBuf> {
    match error {
        OrthoError::File { path, .. } => vec![path.clone()],
        OrthoError::Aggregate(aggregate) => aggregate.iter().flat_map(file_paths).collect(),
        _ => Vec::new(),
    }
}

#[rstest]
fn defaults_apply_without_sources(env: EnvGuard) {
    let config = load(&[]).expect("defaults load");
    drop(env);
    assert_eq!(config, Config::default());
    assert_eq!(config.log_filter(), DEFAULT_LOG_FILTER);
    assert_eq!(config.max_msg_size(), DEFAULT_MAX_MSG_SIZE);
    assert_eq!(config.default_wall_time_limit(), None);
}

#[rstest]
fn environment_layers_are_applied(env: EnvGuard) {
    env.set(MAX_MSG_SIZE_ENV, "4096");
    env.set(MONITOR_POLL_INTERVAL_ENV, "5");
    env.set(DEFAULT_WALL_TIME_LIMIT_ENV, "30");
    env.set(LOG_FORMAT_ENV, "json");

    let config = load(&[]).expect("environment parses");

    assert_eq!(config.max_msg_size(), 4096);
    assert_eq!(config.monitor_poll_interval(), Duration::from_millis(5));
    assert_eq!(config.default_wall_time_limit(), Some(Duration::from_secs(30)));
    assert_eq!(config.log_format(), LogFormat::Json);
}

#[rstest]
fn flags_override_the_environment(env: EnvGuard) {
    env.set(LOG_FILTER_ENV, "info");
    env.set(MAX_MSG_SIZE_ENV, "4096");

    let config = load(&["--log-filter", "trace", "--max-msg-size", "512"]).expect("flags parse");

    assert_eq!(config.log_filter(), "trace");
    assert_eq!(config.max_msg_size(), 512);
}

#[rstest]
fn file_named_by_flag_is_layered_under_the_environment(env: EnvGuard) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("warden.toml");
    fs::write(&path, "log_filter = \"debug\"\nmax_msg_size = 1024\n").expect("write config");
    env.set(MAX_MSG_SIZE_ENV, "2048");

    let path_arg = path.display().to_string();
    let config = load(&["--config-path", &path_arg]).expect("file loads");

    assert_eq!(config.log_filter(), "debug");
    assert_eq!(config.max_msg_size(), 2048);
}

#[rstest]
fn malformed_file_reports_its_path(env: EnvGuard) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("warden.toml");
    fs::write(&path, "max_msg_size = \"lots\"\n").expect("write config");
    env.set(CONFIG_PATH_ENV, &path.display().to_string());

    let error = load(&[]).expect_err("must fail");

    match error {
        ConfigError::Load(source) => assert!(
            file_paths(&source).contains(&path),
            "expected {} in {source:?}",
            path.display()
        ),
        ConfigError::Invalid { .. } => panic!("expected a load error, got {error:?}"),
    }
}

#[rstest]
#[case::message_size("--max-msg-size", "max_msg_size")]
#[case::poll_interval("--monitor-poll-interval-ms", "monitor_poll_interval_ms")]
fn zero_limits_fail_validation(
    env: EnvGuard,
    #[case] flag: &str,
    #[case] expected: &'static str,
) {
    let error = load(&[flag, "0"]).expect_err("must fail");
    drop(env);
    assert!(matches!(error, ConfigError::Invalid { field, .. } if field == expected));
}

#[rstest]
#[case::compact("compact", LogFormat::Compact)]
#[case::json("JSON", LogFormat::Json)]
#[case::full("Full", LogFormat::Full)]
fn log_format_parses_case_insensitively(#[case] raw: &str, #[case] expected: LogFormat) {
    assert_eq!(raw.parse::<LogFormat>().expect("known format"), expected);
}

#[rstest]
fn only_json_is_structured() {
    assert!(LogFormat::Json.is_structured());
    assert!(!LogFormat::Compact.is_structured());
    assert!(!LogFormat::Full.is_structured());
}

#[rstest]
fn builder_style_setters_round_trip() {
    let config = Config::default()
        .with_log_filter("debug")
        .with_max_msg_size(64)
        .with_default_wall_time_limit(Some(Duration::from_secs(2)));
    assert_eq!(config.log_filter(), "debug");
    assert_eq!(config.max_msg_size(), 64);
    assert_eq!(config.default_wall_time_limit(), Some(Duration::from_secs(2)));
}
