//! In-process Telemetry Engine
//!
//! Instrumented code records spans, metrics and logs through a
//! [`TelemetryCollector`]; records are masked, queued without blocking and
//! exported in batches by a background flush loop with bounded retries.
//!
//! ```text
//!  Tracer ──┐                ┌──────────────┐           ┌──────────┐
//!  Meter  ──┼─► masking ─►   │ ExportQueue  │ ─batch─►  │ Exporter │
//!  log()  ──┘   (bounded,    │ (ArrayQueue) │  retry +  └──────────┘
//!               never blocks)└──────────────┘  timeout
//!                                  ▲
//!                 Aggregator ──────┘ (every metric_interval)
//! ```
//!
//! # Rust 2024 Edition Features
//!
//! Exporters use native async traits (no `#[async_trait]` macro); the
//! object-safe [`ExporterBoxed`] is derived through a blanket impl.

pub(crate) mod invariants;

pub mod adapter;
pub mod aggregator;
pub mod attribute;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod exporter;
pub mod global;
pub mod log;
pub mod masking;
pub mod metric;
pub mod pipeline;
pub mod propagation;
pub mod record;
pub mod retry;
pub mod sampler;
pub mod span;
pub mod tracer;

// Re-export main types
pub use adapter::{CallAdapter, CallInfo, CallScope, LibraryAdapter, Outcome, instrument_call, instrument_future};
pub use aggregator::{Aggregator, Counter, Histogram, Meter, Observation, UpDownCounter};
pub use attribute::{AttributeValue, Attributes};
pub use collector::TelemetryCollector;
pub use config::{SpanLimits, TelemetryConfig};
pub use context::{ContextGuard, FutureExt, TraceContext};
pub use error::{CallbackError, ConfigurationError, ExportError, Misuse};
pub use exporter::{ExportAck, Exporter, ExporterBoxed, JsonFileExporter, NullExporter, StdoutExporter};
pub use log::{LogCorrelation, LogRecord, Severity};
pub use masking::{MaskingRules, REDACTED, mask};
pub use metric::{HistogramData, InstrumentKind, MetricPoint, MetricValue, Temporality};
pub use pipeline::{PipelineMetrics, RecordSink};
pub use record::{Batch, BatchItem, Resource};
pub use retry::RetryPolicy;
pub use sampler::{AlwaysOff, AlwaysOn, ParentBased, Sampler, TraceIdRatio, TraceRules};
pub use span::{ExceptionRecord, Span, SpanEvent, SpanKind, SpanStatus};
pub use tracer::{SpanBuilder, SpanGuard, SpanHandle, Tracer, current_span};
