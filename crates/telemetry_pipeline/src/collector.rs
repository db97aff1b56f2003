//! Collector Facade
//!
//! [`TelemetryCollector`] owns every piece of mutable engine state: the export
//! pipeline, the metric aggregator, the tracer and the background tasks.
//! Nothing is global unless the application opts into [`crate::global`].
//!
//! Lifecycle:
//!
//! ```text
//! start(config, exporter) ──► running ──shutdown()──► stopped
//!   │                           │                       │
//!   │ validate config           │ spans/metrics/logs    │ further records are
//!   │ spawn flush loop          │ flow to the pipeline  │ dropped and counted
//!   │ spawn metric ticker       │                       │
//! ```

use crate::aggregator::{Aggregator, Meter, Observation};
use crate::attribute::{AttributeValue, Attributes};
use crate::config::TelemetryConfig;
use crate::context;
use crate::error::ConfigurationError;
use crate::exporter::ExporterBoxed;
use crate::log::{LogCorrelation, LogRecord, Severity};
use crate::masking::{MaskingRules, mask};
use crate::metric::InstrumentKind;
use crate::pipeline::{Pipeline, PipelineConfig, PipelineMetrics, PipelineStats, RecordSink};
use crate::record::{BatchItem, Resource};
use crate::sampler::{ParentBased, Sampler, TraceIdRatio, TraceRules};
use crate::span::{ExceptionRecord, SpanStatus};
use crate::tracer::{self, SpanBuilder, SpanHandle, Tracer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Prefix of the pipeline's own metrics.
pub const SELF_METRICS_PREFIX: &str = "telemetry.pipeline";

struct MetricTicker {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Entry point for traces, metrics and logs.
///
/// Construct one per process (or per test) with [`TelemetryCollector::start`]
/// and call [`shutdown`](Self::shutdown) before exit to flush what is queued.
pub struct TelemetryCollector {
    config: TelemetryConfig,
    resource: Arc<Resource>,
    masking: MaskingRules,
    trace_rules: TraceRules,
    tracer: Tracer,
    meter: Meter,
    aggregator: Arc<Aggregator>,
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn RecordSink>,
    ticker: Mutex<Option<MetricTicker>>,
    shut_down: AtomicBool,
}

impl TelemetryCollector {
    /// Validates `config` and starts the background tasks on the current
    /// Tokio runtime. Sampling is `ParentBased(TraceIdRatio(sampling_ratio))`.
    pub fn start(
        config: TelemetryConfig,
        exporter: Arc<dyn ExporterBoxed>,
    ) -> Result<Self, ConfigurationError> {
        let sampler = Box::new(ParentBased::new(TraceIdRatio::new(config.sampling_ratio)));
        Self::start_with_sampler(config, exporter, sampler)
    }

    /// Like [`start`](Self::start) with a custom sampling strategy.
    pub fn start_with_sampler(
        config: TelemetryConfig,
        exporter: Arc<dyn ExporterBoxed>,
        sampler: Box<dyn Sampler>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let masking = config.compile_masking_rules()?;
        let trace_rules = config.compile_trace_rules()?;

        let resource_attributes: Attributes = config
            .resource_attributes
            .iter()
            .map(|(k, v)| (k.clone(), AttributeValue::String(v.clone())))
            .collect();
        let resource = Arc::new(Resource::new(&config.service_name, resource_attributes));

        let pipeline = Arc::new(Pipeline::spawn(
            PipelineConfig::from_config(&config),
            Arc::clone(&exporter),
            Arc::clone(&resource),
        )?);
        let sink = pipeline.sink();

        let tracer = Tracer::new(sampler, config.span_limits, masking.clone(), Arc::clone(&sink));
        let aggregator = Arc::new(Aggregator::new(
            config.temporality,
            masking.clone(),
            Arc::clone(pipeline.stats()),
        ));
        let meter = Meter::new(Arc::clone(&aggregator));
        if config.self_metrics {
            register_self_metrics(&meter, Arc::clone(pipeline.stats()));
        }

        let ticker = spawn_metric_ticker(
            config.metric_interval,
            Arc::clone(&aggregator),
            Arc::clone(&sink),
        );

        tracing::info!(
            service = %config.service_name,
            endpoint = %config.endpoint,
            exporter = exporter.name(),
            sampling_ratio = config.sampling_ratio,
            batch_size = config.batch_size,
            queue_capacity = config.queue_capacity,
            "telemetry collector started"
        );

        Ok(Self {
            config,
            resource,
            masking,
            trace_rules,
            tracer,
            meter,
            aggregator,
            pipeline,
            sink,
            ticker: Mutex::new(Some(ticker)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn trace_rules(&self) -> &TraceRules {
        &self.trace_rules
    }

    /// Starts a span as a child of the active context (or a new root).
    pub fn start_span(&self, name: impl Into<String>) -> SpanHandle {
        self.tracer.start_span(name)
    }

    pub fn span_builder(&self, name: impl Into<String>) -> SpanBuilder<'_> {
        self.tracer.span_builder(name)
    }

    /// Runs `f` inside a scoped span.
    pub fn in_span<R>(&self, name: impl Into<String>, f: impl FnOnce(&SpanHandle) -> R) -> R {
        self.tracer.in_span(name, f)
    }

    /// The span entered in the calling execution unit, if any.
    pub fn current_span(&self) -> Option<SpanHandle> {
        tracer::current_span()
    }

    // The helpers below act on the current span and are no-ops without one.

    pub fn add_event(&self, name: impl Into<String>, attributes: Attributes) {
        let name = name.into();
        tracer::with_current_span("add_event", |span| span.add_event(name, attributes));
    }

    pub fn update_attributes(&self, attributes: Attributes) {
        tracer::with_current_span("update_attributes", |span| span.set_attributes(attributes));
    }

    pub fn record_exception(&self, exception: &ExceptionRecord) {
        tracer::with_current_span("record_exception", |span| span.record_exception(exception));
    }

    pub fn set_span_status_ok(&self) {
        tracer::with_current_span("set_status", |span| span.set_status(SpanStatus::Ok));
    }

    pub fn set_span_status_error(&self, description: impl Into<String>) {
        let status = SpanStatus::Error(description.into());
        tracer::with_current_span("set_status", |span| span.set_status(status));
    }

    /// Records a value on the instrument `name`, creating it on first use.
    pub fn record_metric(
        &self,
        name: &str,
        kind: InstrumentKind,
        value: f64,
        attributes: &Attributes,
    ) {
        self.aggregator.record(name, kind, value, attributes);
    }

    /// Emits a log record, correlated with the active span if there is one.
    ///
    /// Records below `min_log_severity` are discarded here.
    pub fn log(&self, severity: Severity, body: impl Into<String>, attributes: Attributes) {
        if severity < self.config.min_log_severity {
            return;
        }
        let mut record = LogRecord::new(severity, body, mask(&attributes, &self.masking));
        record.trace_context = context::current().map(|cx| LogCorrelation {
            trace_id: cx.trace_id,
            span_id: cx.span_id,
        });
        self.sink.submit(BatchItem::Log(record));
    }

    pub fn debug(&self, body: impl Into<String>, attributes: Attributes) {
        self.log(Severity::Debug, body, attributes);
    }

    pub fn info(&self, body: impl Into<String>, attributes: Attributes) {
        self.log(Severity::Info, body, attributes);
    }

    pub fn warn(&self, body: impl Into<String>, attributes: Attributes) {
        self.log(Severity::Warn, body, attributes);
    }

    pub fn error(&self, body: impl Into<String>, attributes: Attributes) {
        self.log(Severity::Error, body, attributes);
    }

    /// Runs one metric collection tick now. Returns the number of points enqueued.
    pub fn collect_metrics(&self) -> usize {
        collect_into(&self.aggregator, self.sink.as_ref())
    }

    /// Collects metrics, then waits until everything queued has been handed
    /// to the exporter (or dropped).
    pub async fn force_flush(&self) {
        if self.is_shut_down() {
            return;
        }
        self.collect_metrics();
        self.pipeline.force_flush().await;
    }

    /// Snapshot of the drop/retry/export counters.
    pub fn pipeline_metrics(&self) -> PipelineMetrics {
        self.pipeline.stats().snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Final metric tick, bounded final drain, then stop. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            let _ = ticker.stop.send(());
            let _ = ticker.task.await;
        }
        self.collect_metrics();
        self.pipeline.shutdown().await;

        let metrics = self.pipeline_metrics();
        tracing::info!(
            service = %self.config.service_name,
            exported = metrics.exported_items,
            dropped = metrics.dropped_total(),
            "telemetry collector shut down"
        );
    }
}

impl Drop for TelemetryCollector {
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // Without an async context only the signal can be sent; the flush
        // loop still runs its bounded final drain if the runtime is alive.
        if let Some(ticker) = self.ticker.lock().take() {
            let _ = ticker.stop.send(());
        }
        self.pipeline.signal_shutdown();
    }
}

fn collect_into(aggregator: &Aggregator, sink: &dyn RecordSink) -> usize {
    let mut submitted = 0;
    for point in aggregator.collect() {
        if sink.submit(BatchItem::Metric(point)) {
            submitted += 1;
        }
    }
    submitted
}

fn spawn_metric_ticker(
    interval: Duration,
    aggregator: Arc<Aggregator>,
    sink: Arc<dyn RecordSink>,
) -> MetricTicker {
    let (stop, mut stop_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticks.tick().await;
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    let points = collect_into(&aggregator, sink.as_ref());
                    tracing::trace!(points, "metric collection tick");
                }
                _ = &mut stop_rx => break,
            }
        }
    });
    MetricTicker { stop, task }
}

fn register_self_metrics(meter: &Meter, stats: Arc<PipelineStats>) {
    type Read = fn(&PipelineMetrics) -> u64;
    let counters: [(&str, &str, Read); 8] = [
        ("enqueued", "Records accepted into the export queue", |m| m.enqueued),
        ("exported", "Records acknowledged by the exporter", |m| m.exported_items),
        ("batches", "Successful export calls", |m| m.exported_batches),
        ("export.attempts", "Export attempts, including retries", |m| m.export_attempts),
        ("export.retries", "Export attempts after the first", |m| m.export_retries),
        ("export.failed_attempts", "Export attempts that failed or timed out", |m| {
            m.failed_attempts
        }),
        ("export.timed_out_attempts", "Export attempts abandoned at the timeout", |m| {
            m.timed_out_attempts
        }),
        ("callback_failures", "Observable callbacks that failed or panicked", |m| {
            m.callback_failures
        }),
    ];
    for (suffix, description, read) in counters {
        let stats = Arc::clone(&stats);
        meter
            .observable_counter(format!("{SELF_METRICS_PREFIX}.{suffix}"), move || {
                Ok(vec![Observation::new(
                    read(&stats.snapshot()) as f64,
                    Attributes::new(),
                )])
            })
            .with_description(description)
            .register();
    }

    meter
        .observable_counter(format!("{SELF_METRICS_PREFIX}.dropped"), move || {
            let m = stats.snapshot();
            Ok([
                ("queue_full", m.dropped_queue_full),
                ("export_failed", m.dropped_export_failed),
                ("after_shutdown", m.dropped_after_shutdown),
            ]
            .into_iter()
            .map(|(reason, count)| {
                let mut attributes = Attributes::new();
                attributes.insert("reason".into(), AttributeValue::from(reason));
                Observation::new(count as f64, attributes)
            })
            .collect())
        })
        .with_description("Records lost, by reason")
        .register();
}
