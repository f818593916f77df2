use crate::logging::LogFormat;

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Largest payload a comms channel accepts unless configured otherwise.
pub const DEFAULT_MAX_MSG_SIZE: u32 = 0x7FFF_FFFF;

/// How often the monitor re-checks deadlines and kill requests while the
/// sandboxee runs.
pub const DEFAULT_MONITOR_POLL_INTERVAL_MS: u64 = 20;

/// Wall time limit applied to sandboxes that set none. Zero disables it.
pub const DEFAULT_WALL_TIME_LIMIT_SECS: u64 = 0;

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

pub(crate) const fn max_msg_size() -> u32 {
    DEFAULT_MAX_MSG_SIZE
}

pub(crate) const fn monitor_poll_interval_ms() -> u64 {
    DEFAULT_MONITOR_POLL_INTERVAL_MS
}

pub(crate) const fn default_wall_time_limit_secs() -> u64 {
    DEFAULT_WALL_TIME_LIMIT_SECS
}
