use crate::attribute::{AttributeValue, Attributes};
use crate::context::TraceContext;
use serde::{Deserialize, Serialize};

/// A timed unit of work within a trace.
///
/// While the span is open it lives inside a [`SpanHandle`](crate::SpanHandle);
/// once `end_time_unix_nano` is set it is moved out, masked and handed to the
/// export pipeline, and never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Trace correlation (trace id, span id, parent, baggage)
    pub context: TraceContext,
    /// Operation name
    pub name: String,
    /// Span kind
    pub kind: SpanKind,
    /// Span start time (Unix nanoseconds)
    pub start_time_unix_nano: u64,
    /// Span end time (Unix nanoseconds); `None` while open
    pub end_time_unix_nano: Option<u64>,
    /// Span attributes
    pub attributes: Attributes,
    /// Timestamped events, in the order they were added
    pub events: Vec<SpanEvent>,
    /// Span status
    pub status: SpanStatus,
    /// Last exception recorded on the span
    pub recorded_exception: Option<ExceptionRecord>,
    /// Attributes discarded because of span limits
    pub dropped_attributes_count: u32,
    /// Events discarded because of span limits
    pub dropped_events_count: u32,
}

/// Span execution status
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "code", content = "description")]
pub enum SpanStatus {
    /// Span status unknown
    #[default]
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error(String),
}

impl SpanStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    #[default]
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// Named point in time during a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub time_unix_nano: u64,
    pub name: String,
    pub attributes: Attributes,
}

/// Exception details captured by `record_exception`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub type_name: String,
    pub message: String,
}

impl ExceptionRecord {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Captures an error value; the type name is the concrete Rust type.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        Self::new(short_type_name::<E>(), error.to_string())
    }

    /// Attributes of the `exception` event, following OTel semantic conventions.
    pub(crate) fn event_attributes(&self) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(
            "exception.type".into(),
            AttributeValue::String(self.type_name.clone()),
        );
        attributes.insert(
            "exception.message".into(),
            AttributeValue::String(self.message.clone()),
        );
        attributes
    }
}

pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    // Drop the module path but keep generic arguments intact.
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => full[idx + 2..].to_string(),
        None => full.to_string(),
    }
}

impl Span {
    /// Creates an open span with the given context.
    pub fn new(context: TraceContext, name: String, kind: SpanKind) -> Self {
        Self {
            context,
            name,
            kind,
            start_time_unix_nano: crate::record::now_unix_nanos(),
            end_time_unix_nano: None,
            attributes: Attributes::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
            recorded_exception: None,
            dropped_attributes_count: 0,
            dropped_events_count: 0,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_time_unix_nano.is_some()
    }

    /// Duration of the span in nanoseconds (zero while open)
    pub fn duration_nanos(&self) -> u64 {
        self.end_time_unix_nano
            .map_or(0, |end| end.saturating_sub(self.start_time_unix_nano))
    }

    /// Finds the first event with the given name.
    pub fn event(&self, name: &str) -> Option<&SpanEvent> {
        self.events.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct DiskFull;

    impl std::fmt::Display for DiskFull {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "no space left")
        }
    }

    impl std::error::Error for DiskFull {}

    #[test]
    fn test_exception_from_error_uses_short_type_name() {
        let record = ExceptionRecord::from_error(&DiskFull);
        assert_eq!(record.type_name, "DiskFull");
        assert_eq!(record.message, "no space left");
        let attrs = record.event_attributes();
        assert_eq!(attrs["exception.type"].as_str(), Some("DiskFull"));
    }

    #[test]
    fn test_open_span_has_no_duration() {
        let span = Span::new(TraceContext::new_root(true), "op".into(), SpanKind::Internal);
        assert!(!span.is_ended());
        assert_eq!(span.duration_nanos(), 0);
    }

    #[test]
    fn test_status_serializes_with_code() {
        let json = serde_json::to_string(&SpanStatus::Error("bad".into())).unwrap();
        assert_eq!(json, r#"{"code":"Error","description":"bad"}"#);
    }
}
