use crate::attribute::Attributes;
use serde::{Deserialize, Serialize};

/// Kind of a metric instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    /// Monotonic sum, pushed by the application
    Counter,
    /// Bidirectional sum, pushed by the application
    UpDownCounter,
    /// Distribution over explicit bucket boundaries
    Histogram,
    /// Last value, pulled by callback at each collection tick
    ObservableGauge,
    /// Monotonic running total, pulled by callback at each collection tick
    ObservableCounter,
}

impl InstrumentKind {
    pub fn is_observable(self) -> bool {
        matches!(self, Self::ObservableGauge | Self::ObservableCounter)
    }
}

/// Whether sums restart at every collection tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temporality {
    /// Points report the total since the instrument was created (never resets)
    #[default]
    Cumulative,
    /// Points report only what changed since the previous tick
    Delta,
}

/// Export-ready bucketed distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramData {
    /// Upper bounds (inclusive) of every bucket except the last
    pub boundaries: Vec<f64>,
    /// `boundaries.len() + 1` counts; the last bucket is the overflow bucket
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl HistogramData {
    pub(crate) fn empty(boundaries: &[f64]) -> Self {
        Self {
            boundaries: boundaries.to_vec(),
            bucket_counts: vec![0; boundaries.len() + 1],
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
        }
    }

    /// Index of the bucket whose interval `(b[i-1], b[i]]` contains `value`.
    pub fn bucket_index(boundaries: &[f64], value: f64) -> usize {
        boundaries.partition_point(|bound| *bound < value)
    }

    pub(crate) fn record(&mut self, value: f64) {
        let idx = Self::bucket_index(&self.boundaries, value);
        self.bucket_counts[idx] += 1;
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }
}

/// Value carried by a metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Sum(f64),
    Gauge(f64),
    Histogram(HistogramData),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Sum(v) | Self::Gauge(v) => Some(*v),
            Self::Histogram(_) => None,
        }
    }

    pub fn as_histogram(&self) -> Option<&HistogramData> {
        match self {
            Self::Histogram(h) => Some(h),
            _ => None,
        }
    }
}

/// One aggregated data point for one attribute set of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub instrument_name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub kind: InstrumentKind,
    pub temporality: Temporality,
    pub value: MetricValue,
    pub attributes: Attributes,
    /// Start of the aggregation window (Unix nanoseconds)
    pub start_time_unix_nano: u64,
    /// Collection tick time (Unix nanoseconds)
    pub timestamp_unix_nano: u64,
}
