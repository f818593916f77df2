//! Splits leading configuration flags from the subcommand and loads
//! [`Config`] from them.

use std::ffi::{OsStr, OsString};

use warden_config::{CONFIG_CLI_FLAGS, Config};

use crate::AppError;

pub(crate) trait ConfigLoader {
    /// Loads configuration from `args`, program name first.
    ///
    /// Only flags in [`CONFIG_CLI_FLAGS`] placed before the subcommand
    /// reach the loader.
    fn load(&self, args: &[OsString]) -> Result<Config, AppError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        Ok(Config::from_args(args.iter().cloned())?)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) command_arguments: Vec<OsString>,
}

/// Returns whether a recognised flag still needs its value from the next
/// argument, or `None` for anything else.
fn config_flag(argument: &OsStr) -> Option<bool> {
    let text = argument.to_str()?;
    if !text.starts_with("--") {
        return None;
    }
    let (flag, inline) = text
        .split_once('=')
        .map_or((text, false), |(flag, _)| (flag, true));
    CONFIG_CLI_FLAGS.contains(&flag).then_some(!inline)
}

/// Both halves start with the program name.
pub(crate) fn split_config_arguments(args: Vec<OsString>) -> ConfigArgumentSplit {
    let mut remaining = args.into_iter().peekable();
    let program = remaining.next().unwrap_or_else(|| OsString::from("warden"));
    let mut config_arguments = vec![program.clone()];

    while let Some(needs_value) = remaining.peek().and_then(|argument| config_flag(argument)) {
        config_arguments.extend(remaining.next());
        if needs_value {
            config_arguments.extend(remaining.next());
        }
    }

    ConfigArgumentSplit {
        config_arguments,
        command_arguments: std::iter::once(program).chain(remaining).collect(),
    }
}
