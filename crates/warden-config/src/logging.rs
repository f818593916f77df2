use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Output formats the tracing subscriber can render.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event, fields flattened.
    Json,
    /// Single line per event without span context.
    #[default]
    Compact,
    /// Single line per event with the enclosing spans.
    Full,
}

impl LogFormat {
    /// Returns `true` for formats meant for machines rather than terminals.
    #[must_use]
    pub const fn is_structured(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Errors encountered while parsing a [`LogFormat`] from text.
pub type LogFormatParseError = strum::ParseError;
