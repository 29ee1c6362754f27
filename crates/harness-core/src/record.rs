//! Parsing of tool log output.
//!
//! The external tools write tab-separated log lines of the form
//! `timestamp \t severity \t origin \t message`. Lines with fewer fields
//! are kept as bare-message records; lines with an unparseable timestamp
//! or severity are dropped.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Severity reported by the external tools themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolLogSeverity {
    High,
    Medium,
    Low,
}

impl ToolLogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

/// One parsed line of tool output.
///
/// Bare-message records carry neither timestamp nor severity; they come
/// from lines the tool wrote outside its structured log format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolLogRecord {
    pub timestamp: Option<NaiveDateTime>,
    pub severity: Option<ToolLogSeverity>,
    pub origin: String,
    pub message: String,
}

impl ToolLogRecord {
    /// Parse one line of tool output. Returns `None` for lines that must
    /// be dropped (structured lines with a bad timestamp or severity).
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            return None;
        }

        let fields: Vec<&str> = trimmed.splitn(4, '\t').collect();
        if fields.len() < 4 {
            return Some(Self::bare(trimmed));
        }

        let timestamp = NaiveDateTime::parse_from_str(fields[0].trim(), TIMESTAMP_FORMAT).ok()?;
        let severity = ToolLogSeverity::parse(fields[1])?;
        Some(Self {
            timestamp: Some(timestamp),
            severity: Some(severity),
            origin: fields[2].trim().to_string(),
            message: fields[3].to_string(),
        })
    }

    /// A record for an unstructured output line.
    pub fn bare(message: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            severity: None,
            origin: String::new(),
            message: message.into(),
        }
    }

    /// Split a `key=value` message into its parts.
    pub fn key_value(&self) -> Option<(&str, &str)> {
        let (key, value) = self.message.split_once('=')?;
        Some((key.trim(), value.trim()))
    }
}

impl std::fmt::Display for ToolLogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.timestamp {
            Some(timestamp) => write!(
                f,
                "{} {} {}",
                timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                self.origin,
                self.message
            ),
            None => write!(f, "{}", self.message),
        }
    }
}
