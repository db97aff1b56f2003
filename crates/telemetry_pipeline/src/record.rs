use crate::attribute::{AttributeValue, Attributes};
use crate::log::LogRecord;
use crate::metric::MetricPoint;
use crate::span::Span;
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;

/// Current wall-clock time as Unix nanoseconds.
pub(crate) fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// A finished record queued for export.
///
/// Ownership moves into the pipeline on enqueue; the producer never sees it again.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum BatchItem {
    Span(Span),
    Metric(MetricPoint),
    Log(LogRecord),
}

impl BatchItem {
    pub fn as_span(&self) -> Option<&Span> {
        match self {
            Self::Span(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_metric(&self) -> Option<&MetricPoint> {
        match self {
            Self::Metric(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_log(&self) -> Option<&LogRecord> {
        match self {
            Self::Log(l) => Some(l),
            _ => None,
        }
    }
}

/// Entity producing the telemetry, attached to every batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub attributes: Attributes,
}

impl Resource {
    /// `service.name` always wins over a conflicting resource attribute.
    pub fn new(service_name: &str, mut attributes: Attributes) -> Self {
        attributes.insert(
            "service.name".into(),
            AttributeValue::String(service_name.to_string()),
        );
        Self { attributes }
    }

    pub fn service_name(&self) -> Option<&str> {
        self.attributes.get("service.name").and_then(AttributeValue::as_str)
    }
}

/// Batch of records for a single export call
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    /// Records in enqueue order
    pub items: Vec<BatchItem>,
    /// Shared resource description
    pub resource: Arc<Resource>,
    /// Batch creation timestamp
    #[serde(skip)]
    pub timestamp: SystemTime,
}

impl Batch {
    /// Creates a batch with the given items
    pub fn with_items(items: Vec<BatchItem>, resource: Arc<Resource>) -> Self {
        Self {
            items,
            resource,
            timestamp: SystemTime::now(),
        }
    }

    /// Returns the number of records in the batch
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.items.iter().filter_map(BatchItem::as_span)
    }

    pub fn metrics(&self) -> impl Iterator<Item = &MetricPoint> {
        self.items.iter().filter_map(BatchItem::as_metric)
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogRecord> {
        self.items.iter().filter_map(BatchItem::as_log)
    }
}
