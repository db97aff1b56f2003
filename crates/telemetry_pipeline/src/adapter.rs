//! Library call instrumentation.
//!
//! A library integration wraps each outbound call in a `before`/`after` pair.
//! [`LibraryAdapter`] turns that pair into one span, a `.calls` counter, a
//! `.duration_ms` histogram and a log record, all sharing the same base
//! attributes:
//!
//! ```text
//! before(info) ──► span "{prefix}.{name}" (unless trace rules reject it)
//!      │
//!   call runs with the span's context active
//!      │
//! after(scope, outcome) ──► counter + histogram {outcome, exception.type}
//!                       ──► log Info / Error {exception.message}
//!                       ──► span ends
//! ```

use crate::attribute::{AttributeValue, Attributes};
use crate::collector::TelemetryCollector;
use crate::context::{ContextGuard, FutureExt, TraceContext};
use crate::span::{ExceptionRecord, SpanKind};
use crate::tracer::SpanHandle;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_ERROR: &str = "error";

/// Describes one call site.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Library layer (`database`, `http`, `framework`, ...). Trace rules are keyed by it.
    pub layer: String,
    /// Operation name, used for span and metric names and `code.function`.
    pub name: String,
    /// Module or resource the call targets; matched by trace rules. Defaults to `name`.
    pub target: Option<String>,
    pub kind: SpanKind,
    pub attributes: Attributes,
}

impl CallInfo {
    pub fn new(layer: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            name: name.into(),
            target: None,
            kind: SpanKind::Client,
            attributes: Attributes::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn target(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.name)
    }
}

/// How the wrapped call finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    Error(ExceptionRecord),
}

impl Outcome {
    pub fn from_result<T, E: std::error::Error>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(e) => Outcome::Error(ExceptionRecord::from_error(e)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => OUTCOME_SUCCESS,
            Outcome::Error(_) => OUTCOME_ERROR,
        }
    }
}

/// State carried from `before` to `after`.
#[derive(Debug)]
pub struct CallScope {
    span_name: String,
    span: Option<SpanHandle>,
    base_attributes: Attributes,
    started: Instant,
}

impl CallScope {
    /// A scope with no span; only metrics and logs are produced.
    pub fn untraced(span_name: impl Into<String>, base_attributes: Attributes) -> Self {
        Self {
            span_name: span_name.into(),
            span: None,
            base_attributes,
            started: Instant::now(),
        }
    }

    pub fn span_name(&self) -> &str {
        &self.span_name
    }

    pub fn span(&self) -> Option<&SpanHandle> {
        self.span.as_ref()
    }

    /// Context to activate while the call runs.
    pub fn context(&self) -> Option<&TraceContext> {
        self.span.as_ref().and_then(SpanHandle::context)
    }

    pub fn enter(&self) -> Option<ContextGuard> {
        self.span.as_ref().and_then(SpanHandle::enter)
    }
}

/// Fixed contract every library integration implements.
pub trait CallAdapter: Send + Sync {
    fn before(&self, info: &CallInfo) -> CallScope;
    fn after(&self, scope: CallScope, outcome: Outcome);
}

/// Standard adapter bound to a collector handle.
#[derive(Clone)]
pub struct LibraryAdapter {
    collector: Arc<TelemetryCollector>,
    prefix: String,
}

impl LibraryAdapter {
    pub fn new(collector: Arc<TelemetryCollector>, prefix: impl Into<String>) -> Self {
        Self {
            collector,
            prefix: prefix.into(),
        }
    }

    pub fn collector(&self) -> &Arc<TelemetryCollector> {
        &self.collector
    }

    fn span_name(&self, info: &CallInfo) -> String {
        if self.prefix.is_empty() {
            info.name.clone()
        } else {
            format!("{}.{}", self.prefix, info.name)
        }
    }
}

impl CallAdapter for LibraryAdapter {
    fn before(&self, info: &CallInfo) -> CallScope {
        let span_name = self.span_name(info);
        let mut base = info.attributes.clone();
        base.insert("code.function".into(), AttributeValue::String(info.name.clone()));
        base.insert("telemetry.kind".into(), AttributeValue::String(info.layer.clone()));
        if let Some(target) = &info.target {
            base.insert("code.namespace".into(), AttributeValue::String(target.clone()));
        }

        let mut scope = CallScope::untraced(span_name, base);
        if self.collector.trace_rules().should_trace(&info.layer, info.target()) {
            let span = self
                .collector
                .span_builder(scope.span_name.clone())
                .with_kind(info.kind)
                .with_attributes(scope.base_attributes.clone())
                .start();
            scope.span = Some(span);
        } else {
            tracing::trace!(layer = %info.layer, target = info.target(), "call not traced by rules");
        }
        scope.started = Instant::now();
        scope
    }

    fn after(&self, scope: CallScope, outcome: Outcome) {
        let duration_ms = scope.started.elapsed().as_secs_f64() * 1000.0;
        let CallScope {
            span_name,
            span,
            base_attributes,
            ..
        } = scope;

        let mut labels = base_attributes;
        labels.insert("outcome".into(), AttributeValue::from(outcome.label()));
        if let Outcome::Error(exception) = &outcome {
            labels.insert(
                "exception.type".into(),
                AttributeValue::String(exception.type_name.clone()),
            );
        }

        let meter = self.collector.meter();
        meter
            .counter(format!("{span_name}.calls"))
            .build()
            .add(1.0, &labels);
        meter
            .histogram(format!("{span_name}.duration_ms"))
            .with_unit("ms")
            .build()
            .record(duration_ms, &labels);

        // Log inside the span's context so the record is correlated.
        let _entered = span.as_ref().and_then(SpanHandle::enter);
        let mut log_attributes = labels;
        log_attributes.insert("duration_ms".into(), AttributeValue::Float(duration_ms));
        match &outcome {
            Outcome::Success => {
                self.collector
                    .info(format!("{span_name} executed successfully"), log_attributes);
            }
            Outcome::Error(exception) => {
                log_attributes.insert(
                    "exception.message".into(),
                    AttributeValue::String(exception.message.clone()),
                );
                self.collector.error(format!("Error in {span_name}"), log_attributes);
            }
        }

        if let Some(span) = span {
            span.set_attribute("duration_ms", duration_ms);
            if let Outcome::Error(exception) = &outcome {
                span.record_exception(exception);
            }
            span.end();
        }
    }
}

/// Wraps a synchronous call. The span's context is active while `call` runs.
pub fn instrument_call<A, T, E, F>(adapter: &A, info: &CallInfo, call: F) -> Result<T, E>
where
    A: CallAdapter + ?Sized,
    E: std::error::Error,
    F: FnOnce() -> Result<T, E>,
{
    let scope = adapter.before(info);
    let result = {
        let _entered = scope.enter();
        call()
    };
    adapter.after(scope, Outcome::from_result(&result));
    result
}

/// Wraps an asynchronous call. The span's context is re-entered on every poll.
pub async fn instrument_future<A, T, E, F>(adapter: &A, info: &CallInfo, call: F) -> Result<T, E>
where
    A: CallAdapter + ?Sized,
    E: std::error::Error,
    F: Future<Output = Result<T, E>>,
{
    let scope = adapter.before(info);
    let result = match scope.span() {
        Some(span) => call.with_span(span).await,
        None => call.await,
    };
    adapter.after(scope, Outcome::from_result(&result));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::context;
    use crate::exporter::test_support::TestExporter;
    use crate::log::Severity;
    use crate::metric::{InstrumentKind, MetricValue};
    use crate::sampler::{LayerRuleSpec, TraceRulesSpec};
    use crate::span::SpanStatus;
    use std::time::Duration;

    #[derive(Debug)]
    struct QueryFailed;

    impl std::fmt::Display for QueryFailed {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("relation \"users\" does not exist")
        }
    }

    impl std::error::Error for QueryFailed {}

    fn start(config: TelemetryConfig) -> (Arc<TelemetryCollector>, Arc<TestExporter>) {
        let exporter = Arc::new(TestExporter::new());
        let config = config
            .with_flush_interval(Duration::from_secs(3600))
            .with_metric_interval(Duration::from_secs(3600))
            .with_self_metrics(false);
        let collector = TelemetryCollector::start(config, exporter.clone()).unwrap();
        (Arc::new(collector), exporter)
    }

    fn default_config() -> TelemetryConfig {
        TelemetryConfig::new("http://localhost:4318", "adapter-test")
    }

    #[tokio::test]
    async fn test_successful_call_produces_span_metrics_and_log() {
        let (collector, exporter) = start(default_config());
        let adapter = LibraryAdapter::new(Arc::clone(&collector), "db");
        let info = CallInfo::new("database", "select_user").with_attribute("db.system", "postgres");

        let inner_cx = instrument_call(&adapter, &info, || Ok::<_, QueryFailed>(context::current()))
            .unwrap();
        collector.shutdown().await;

        let items = exporter.items();
        let span = items.iter().find_map(|i| i.as_span()).unwrap();
        assert_eq!(span.name, "db.select_user");
        assert_eq!(span.kind, SpanKind::Client);
        assert_eq!(span.attributes["code.function"].as_str(), Some("select_user"));
        assert_eq!(span.attributes["telemetry.kind"].as_str(), Some("database"));
        assert_eq!(span.attributes["db.system"].as_str(), Some("postgres"));
        // The call ran inside the span's context
        assert_eq!(inner_cx.map(|cx| cx.span_id), Some(span.context.span_id));

        let log = items.iter().find_map(|i| i.as_log()).unwrap();
        assert_eq!(log.severity, Severity::Info);
        assert_eq!(log.body, "db.select_user executed successfully");
        assert_eq!(log.trace_context.map(|c| c.span_id), Some(span.context.span_id));

        let calls = items
            .iter()
            .filter_map(|i| i.as_metric())
            .find(|m| m.instrument_name == "db.select_user.calls")
            .unwrap();
        assert_eq!(calls.kind, InstrumentKind::Counter);
        assert_eq!(calls.value, MetricValue::Sum(1.0));
        assert_eq!(calls.attributes["outcome"].as_str(), Some(OUTCOME_SUCCESS));

        let duration = items
            .iter()
            .filter_map(|i| i.as_metric())
            .find(|m| m.instrument_name == "db.select_user.duration_ms")
            .unwrap();
        assert_eq!(duration.value.as_histogram().map(|h| h.count), Some(1));
    }

    #[tokio::test]
    async fn test_failed_call_records_exception_and_is_returned_unchanged() {
        let (collector, exporter) = start(default_config());
        let adapter = LibraryAdapter::new(Arc::clone(&collector), "db");
        let info = CallInfo::new("database", "select_user");

        let result: Result<(), _> = instrument_call(&adapter, &info, || Err(QueryFailed));
        assert!(result.is_err());
        collector.shutdown().await;

        let items = exporter.items();
        let span = items.iter().find_map(|i| i.as_span()).unwrap();
        assert!(span.status.is_error());
        let event = span.event("exception").unwrap();
        assert_eq!(event.attributes["exception.type"].as_str(), Some("QueryFailed"));

        let log = items.iter().find_map(|i| i.as_log()).unwrap();
        assert_eq!(log.severity, Severity::Error);
        assert_eq!(log.body, "Error in db.select_user");
        assert_eq!(
            log.attributes["exception.message"].as_str(),
            Some("relation \"users\" does not exist")
        );

        let calls = items
            .iter()
            .filter_map(|i| i.as_metric())
            .find(|m| m.instrument_name == "db.select_user.calls")
            .unwrap();
        assert_eq!(calls.attributes["outcome"].as_str(), Some(OUTCOME_ERROR));
        assert_eq!(calls.attributes["exception.type"].as_str(), Some("QueryFailed"));
    }

    #[tokio::test]
    async fn test_rejected_by_rules_skips_span_but_runs_call() {
        let mut rules = TraceRulesSpec::default();
        rules.layers.insert(
            "database".to_string(),
            LayerRuleSpec {
                include: vec![],
                exclude: vec!["health_*".to_string()],
            },
        );
        let (collector, exporter) = start(default_config().with_trace_rules(rules));
        let adapter = LibraryAdapter::new(Arc::clone(&collector), "db");

        let value = instrument_call(&adapter, &CallInfo::new("database", "health_check"), || {
            Ok::<_, QueryFailed>(42)
        })
        .unwrap();
        assert_eq!(value, 42);
        collector.shutdown().await;

        let items = exporter.items();
        assert!(items.iter().all(|i| i.as_span().is_none()));
        assert!(items.iter().any(|i| i.as_metric().is_some()));
        let log = items.iter().find_map(|i| i.as_log()).unwrap();
        assert!(log.trace_context.is_none());
    }

    #[tokio::test]
    async fn test_instrument_future_keeps_context_across_await() {
        let (collector, exporter) = start(default_config());
        let adapter = LibraryAdapter::new(Arc::clone(&collector), "http");
        let info = CallInfo::new("http", "get_profile");

        let seen = instrument_future(&adapter, &info, async {
            tokio::task::yield_now().await;
            if let Some(span) = crate::tracer::current_span() {
                span.set_attribute("http.status_code", 200);
            }
            Ok::<_, QueryFailed>(context::current())
        })
        .await
        .unwrap();
        assert!(context::current().is_none());
        collector.shutdown().await;

        let span = exporter.items().iter().find_map(|i| i.as_span().cloned()).unwrap();
        assert_eq!(span.status, SpanStatus::Unset);
        assert_eq!(seen.map(|cx| cx.span_id), Some(span.context.span_id));
        assert_eq!(span.attributes["http.status_code"], AttributeValue::Int(200));
    }

    #[tokio::test]
    async fn test_calls_counter_accumulates_across_outcomes() {
        let (collector, exporter) = start(default_config());
        let adapter = LibraryAdapter::new(Arc::clone(&collector), "db");
        let info = CallInfo::new("database", "insert");

        for _ in 0..3 {
            let _ = instrument_call(&adapter, &info, || Ok::<_, QueryFailed>(()));
        }
        let _ = instrument_call(&adapter, &info, || Err::<(), _>(QueryFailed));
        collector.shutdown().await;

        let totals: Vec<(String, f64)> = exporter
            .items()
            .iter()
            .filter_map(|i| i.as_metric())
            .filter(|m| m.instrument_name == "db.insert.calls")
            .map(|m| {
                (
                    m.attributes["outcome"].as_str().unwrap_or_default().to_string(),
                    m.value.as_f64().unwrap_or_default(),
                )
            })
            .collect();
        assert!(totals.contains(&(OUTCOME_SUCCESS.to_string(), 3.0)));
        assert!(totals.contains(&(OUTCOME_ERROR.to_string(), 1.0)));
    }
}
