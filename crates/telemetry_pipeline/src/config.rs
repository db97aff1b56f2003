//! Configuration for the telemetry collector.

use crate::error::ConfigurationError;
use crate::log::Severity;
use crate::masking::{DEFAULT_SENSITIVE_KEYS, MaskingRules};
use crate::metric::Temporality;
use crate::sampler::{TraceRules, TraceRulesSpec};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default histogram bucket boundaries.
pub const DEFAULT_HISTOGRAM_BOUNDARIES: &[f64] = &[0.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 2000.0];

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Caps on per-span attribute and event counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpanLimits {
    pub max_attributes: usize,
    pub max_events: usize,
}

impl Default for SpanLimits {
    fn default() -> Self {
        Self {
            max_attributes: 128,
            max_events: 256,
        }
    }
}

/// Configuration for the telemetry collector
///
/// `endpoint` and `service_name` are required; every other option has a
/// default. Durations are written in milliseconds (`flush_interval_ms`, ...)
/// in the serialized form.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Collector address handed to the exporter
    pub endpoint: String,
    /// Value of the `service.name` resource attribute
    pub service_name: String,
    /// Extra resource attributes attached to every batch
    pub resource_attributes: BTreeMap<String, String>,
    /// Fraction of root traces recorded, in `[0, 1]`
    pub sampling_ratio: f64,
    /// Sensitive-key rules (see [`crate::masking`])
    pub masking_rules: Vec<String>,
    /// Maximum records per export call; reaching it triggers a flush
    pub batch_size: usize,
    /// Time-based flush trigger
    #[serde(rename = "flush_interval_ms", with = "duration_ms")]
    pub flush_interval: Duration,
    /// Maximum export attempts per batch before it is dropped
    pub retry_ceiling: u32,
    /// Bounded export queue capacity; overflow is dropped and counted
    pub queue_capacity: usize,
    /// Delay before the second attempt
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff delay
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    /// Exponential growth factor between attempts
    pub backoff_multiplier: f64,
    /// Fraction of each delay randomized away, in `[0, 1]`
    pub jitter: f64,
    /// Per-attempt timeout; slower attempts are abandoned and count as failed
    #[serde(rename = "export_timeout_ms", with = "duration_ms")]
    pub export_timeout: Duration,
    /// Bound on the final drain at shutdown
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Maximum concurrent export calls
    pub max_concurrent_exports: usize,
    /// Metric collection tick
    #[serde(rename = "metric_interval_ms", with = "duration_ms")]
    pub metric_interval: Duration,
    /// Cumulative (default) or delta sums
    pub temporality: Temporality,
    pub span_limits: SpanLimits,
    /// Log records below this severity are discarded at the call site
    pub min_log_severity: Severity,
    /// Call-site filters consulted by instrumentation adapters
    pub trace_rules: TraceRulesSpec,
    /// Export the pipeline's own drop/retry counters as metrics
    pub self_metrics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            service_name: String::new(),
            resource_attributes: BTreeMap::new(),
            sampling_ratio: 1.0,
            masking_rules: DEFAULT_SENSITIVE_KEYS.iter().map(|k| (*k).to_string()).collect(),
            batch_size: 512,
            flush_interval: Duration::from_secs(5),
            retry_ceiling: 5,
            queue_capacity: 2048,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            export_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            max_concurrent_exports: 1,
            metric_interval: Duration::from_secs(60),
            temporality: Temporality::Cumulative,
            span_limits: SpanLimits::default(),
            min_log_severity: Severity::Trace,
            trace_rules: TraceRulesSpec::default(),
            self_metrics: true,
        }
    }
}

impl TelemetryConfig {
    /// Creates a configuration with the two required fields set.
    pub fn new(endpoint: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Parses a TOML document. Missing optional keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the first problem found, if any.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigurationError::MissingEndpoint);
        }
        if self.service_name.trim().is_empty() {
            return Err(ConfigurationError::MissingServiceName);
        }
        if !(0.0..=1.0).contains(&self.sampling_ratio) {
            return Err(ConfigurationError::InvalidSamplingRatio(self.sampling_ratio));
        }
        for (field, value) in [
            ("batch_size", self.batch_size),
            ("queue_capacity", self.queue_capacity),
            ("retry_ceiling", self.retry_ceiling as usize),
            ("max_concurrent_exports", self.max_concurrent_exports),
        ] {
            if value == 0 {
                return Err(ConfigurationError::ZeroValue { field });
            }
        }
        for (field, value) in [
            ("flush_interval", self.flush_interval),
            ("export_timeout", self.export_timeout),
            ("metric_interval", self.metric_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigurationError::ZeroDuration { field });
            }
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(ConfigurationError::InvalidBackoffMultiplier(
                self.backoff_multiplier,
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigurationError::InvalidJitter(self.jitter));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigurationError::InvalidBackoffRange);
        }
        self.compile_masking_rules()?;
        self.compile_trace_rules()?;
        Ok(())
    }

    pub(crate) fn compile_masking_rules(&self) -> Result<MaskingRules, ConfigurationError> {
        MaskingRules::from_rules(&self.masking_rules)
    }

    pub(crate) fn compile_trace_rules(&self) -> Result<TraceRules, ConfigurationError> {
        TraceRules::from_spec(&self.trace_rules)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_resource_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_sampling_ratio(mut self, ratio: f64) -> Self {
        self.sampling_ratio = ratio;
        self
    }

    /// Replaces the masking rules (the defaults are dropped).
    pub fn with_masking_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.masking_rules = rules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_retry_ceiling(mut self, attempts: u32) -> Self {
        self.retry_ceiling = attempts;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_exports(mut self, max: usize) -> Self {
        self.max_concurrent_exports = max;
        self
    }

    pub fn with_metric_interval(mut self, interval: Duration) -> Self {
        self.metric_interval = interval;
        self
    }

    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.temporality = temporality;
        self
    }

    pub fn with_span_limits(mut self, limits: SpanLimits) -> Self {
        self.span_limits = limits;
        self
    }

    pub fn with_min_log_severity(mut self, severity: Severity) -> Self {
        self.min_log_severity = severity;
        self
    }

    pub fn with_trace_rules(mut self, rules: TraceRulesSpec) -> Self {
        self.trace_rules = rules;
        self
    }

    pub fn with_self_metrics(mut self, enabled: bool) -> Self {
        self.self_metrics = enabled;
        self
    }
}
