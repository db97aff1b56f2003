use crate::attribute::Attributes;
use serde::{Deserialize, Serialize};

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Severity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    /// OpenTelemetry severity number (first value of each range).
    pub fn number(self) -> u8 {
        match self {
            Self::Trace => 1,
            Self::Debug => 5,
            Self::Info => 9,
            Self::Warn => 13,
            Self::Error => 17,
            Self::Fatal => 21,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

/// Correlation of a log record with the span active when it was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCorrelation {
    #[serde(with = "crate::context::hex_id::trace")]
    pub trace_id: u128,
    #[serde(with = "crate::context::hex_id::span")]
    pub span_id: u64,
}

/// A structured log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Event time (Unix nanoseconds)
    pub timestamp_unix_nano: u64,
    /// Time the engine observed the record (Unix nanoseconds)
    pub observed_timestamp_unix_nano: u64,
    pub severity: Severity,
    pub body: String,
    pub attributes: Attributes,
    /// Set automatically when a span is active in the context carrier
    pub trace_context: Option<LogCorrelation>,
}

impl LogRecord {
    pub fn new(severity: Severity, body: impl Into<String>, attributes: Attributes) -> Self {
        let now = crate::record::now_unix_nanos();
        Self {
            timestamp_unix_nano: now,
            observed_timestamp_unix_nano: now,
            severity,
            body: body.into(),
            attributes,
            trace_context: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_and_numbers() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Error > Severity::Warn);
        assert_eq!(Severity::Info.number(), 9);
        assert_eq!(Severity::Fatal.as_str(), "FATAL");
    }
}
