//! Core types shared across the pipeline stages.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Render an internal target id in its on-disk form.
///
/// The id is zero-padded to a fixed width so that byte-wise sorting of
/// candidate and match records equals numeric sorting on the id column.
pub fn format_target_id(id: u32) -> String {
    format!("{:011}", id)
}

/// Per-block match selection policy for the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Emit matches in encounter order, stop after K.
    First,
    /// Keep the K matches with the fewest mismatches.
    Best,
}

/// Error type for parsing a match mode from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMatchModeError;

impl fmt::Display for ParseMatchModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid match mode: expected 'first' or 'best'")
    }
}

impl std::error::Error for ParseMatchModeError {}

impl FromStr for MatchMode {
    type Err = ParseMatchModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first" => Ok(MatchMode::First),
            "best" => Ok(MatchMode::Best),
            _ => Err(ParseMatchModeError),
        }
    }
}

impl MatchMode {
    /// Convert the mode to its configuration string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::First => "first",
            MatchMode::Best => "best",
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
