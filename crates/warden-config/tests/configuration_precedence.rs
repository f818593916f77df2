//! Behaviour tests for configuration layering.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use warden_config::{CONFIG_PATH_ENV, Config};

struct Harness {
    temp_dir: TempDir,
    cli_args: RefCell<Vec<OsString>>,
    env_overrides: RefCell<Vec<(String, Option<OsString>)>>,
    outcome: RefCell<Option<Result<Config, String>>>,
}

impl Harness {
    fn new() -> Self {
        let temp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("failed to create temporary directory: {error}"),
        };
        let harness = Self {
            temp_dir,
            cli_args: RefCell::new(vec![OsString::from("warden")]),
            env_overrides: RefCell::new(Vec::new()),
            outcome: RefCell::new(None),
        };
        // Scenarios start from a clean slate even when the host exports one.
        harness.clear_env(CONFIG_PATH_ENV);
        harness
    }

    fn write_config(&self, contents: &str) {
        let path = self.temp_dir.path().join("warden.toml");
        if let Err(error) = fs::write(&path, contents) {
            panic!("failed to write configuration: {error}");
        }
        let mut args = self.cli_args.borrow_mut();
        args.push(OsString::from("--config-path"));
        args.push(path.into_os_string());
    }

    fn set_env(&self, key: &str, value: &str) {
        let previous = std::env::var_os(key);
        // Environment mutation is unsafe under edition 2024. Scenarios in this
        // binary run one at a time and `Drop` restores the previous values.
        unsafe { std::env::set_var(key, value) };
        self.env_overrides
            .borrow_mut()
            .push((key.to_owned(), previous));
    }

    fn clear_env(&self, key: &str) {
        let previous = std::env::var_os(key);
        unsafe { std::env::remove_var(key) };
        self.env_overrides
            .borrow_mut()
            .push((key.to_owned(), previous));
    }

    fn loaded(&self) -> Config {
        match self.outcome.borrow().as_ref() {
            Some(Ok(config)) => config.clone(),
            Some(Err(error)) => panic!("configuration failed to load: {error}"),
            None => panic!("configuration was not loaded"),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let mut overrides = self.env_overrides.borrow_mut();
        while let Some((key, value)) = overrides.pop() {
            match value {
                Some(value) => unsafe { std::env::set_var(&key, value) },
                None => unsafe { std::env::remove_var(&key) },
            }
        }
    }
}

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

#[given("a configuration file setting the log filter to {filter}")]
fn given_file_log_filter(harness: &Harness, filter: String) {
    harness.write_config(&format!("log_filter = {filter}\n"));
}

#[given("a configuration file containing {line}")]
fn given_file_line(harness: &Harness, line: String) {
    let body = line
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(&line)
        .replace("\\\"", "\"");
    harness.write_config(&format!("{body}\n"));
}

#[given("the environment sets {variable} to {value}")]
fn given_env(harness: &Harness, variable: String, value: String) {
    harness.set_env(&variable, value.trim_matches('"'));
}

#[given("the command line passes {flag}")]
fn given_flag(harness: &Harness, flag: String) {
    harness
        .cli_args
        .borrow_mut()
        .push(OsString::from(flag.trim_matches('"')));
}

#[when("the configuration loads")]
fn when_load(harness: &Harness) {
    let args = harness.cli_args.borrow().clone();
    *harness.outcome.borrow_mut() = Some(Config::from_args(args).map_err(|error| {
        let mut message = error.to_string();
        let mut source = std::error::Error::source(&error);
        while let Some(inner) = source {
            message.push_str(&format!(": {inner}"));
            source = inner.source();
        }
        message
    }));
}

#[then("the log filter is {filter}")]
fn then_log_filter(harness: &Harness, filter: String) {
    assert_eq!(harness.loaded().log_filter(), filter.trim_matches('"'));
}

#[then("the maximum message size is {size}")]
fn then_max_msg_size(harness: &Harness, size: u32) {
    assert_eq!(harness.loaded().max_msg_size(), size);
}

#[then("loading fails mentioning {needle}")]
fn then_fails(harness: &Harness, needle: String) {
    let needle = needle.trim_matches('"');
    match harness.outcome.borrow().as_ref() {
        Some(Err(error)) => assert!(error.contains(needle), "unexpected error: {error}"),
        Some(Ok(_)) => panic!("configuration unexpectedly loaded"),
        None => panic!("configuration was not loaded"),
    }
}

#[scenario(path = "tests/features/configuration_precedence.feature")]
fn configuration_precedence(harness: Harness) {
    let _ = harness;
}
