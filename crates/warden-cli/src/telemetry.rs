//! Tracing subscriber setup driven by [`Config`].
//!
//! Events go to stderr so stdout stays free for command output. The
//! subscriber is a registry with one filtered `fmt` layer; which layer
//! depends on [`LogFormat`].

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use warden_config::{Config, LogFormat};

static INSTALLED: OnceCell<TelemetryHandle> = OnceCell::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// What the process-wide subscriber was installed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
    filter: String,
}

impl TelemetryHandle {
    /// Output format of the installed subscriber.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }

    /// Filter directive of the installed subscriber.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Errors raised while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The filter directive does not parse.
    #[error("invalid log filter '{filter}': {message}")]
    Filter {
        /// Directive as configured.
        filter: String,
        /// Parser diagnostic.
        message: String,
    },
    /// A subscriber from elsewhere already owns the process.
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Installs the subscriber once per process and returns what it was
/// installed with. Later calls ignore `config`.
///
/// # Errors
///
/// Fails when the filter is invalid or another subscriber is installed.
pub fn initialise(config: &Config) -> Result<&'static TelemetryHandle, TelemetryError> {
    INSTALLED.get_or_try_init(|| {
        let filter = parse_filter(config.log_filter())?;
        tracing_subscriber::registry()
            .with(fmt_layer(config.log_format()).with_filter(filter))
            .try_init()?;
        Ok(TelemetryHandle {
            format: config.log_format(),
            filter: config.log_filter().to_owned(),
        })
    })
}

pub(crate) fn parse_filter(directive: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directive).map_err(|error| TelemetryError::Filter {
        filter: directive.to_owned(),
        message: error.to_string(),
    })
}

fn fmt_layer(format: LogFormat) -> BoxedLayer {
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(!format.is_structured() && io::stderr().is_terminal())
        .with_timer(UtcTime::rfc_3339());
    match format {
        LogFormat::Json => layer.json().flatten_event(true).boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Full => layer.boxed(),
    }
}
