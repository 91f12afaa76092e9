use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Structured JSON suitable for ingestion by logging stacks.
    #[default]
    Json,
    /// Human-readable single line output.
    Compact,
}

/// Whether a language server that exits unexpectedly is restarted.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum RestartMode {
    /// Restart after crashes, within the restart budget.
    #[default]
    OnUnexpectedExit,
    /// Never restart automatically.
    Never,
}

/// Errors encountered while parsing a format or mode from text.
pub type FormatParseError = strum::ParseError;
