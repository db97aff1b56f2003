//! Metric Aggregator
//!
//! Synchronous instruments (counters, up/down counters, histograms) keep one
//! running accumulator per distinct attribute set. Observable instruments are
//! pulled: their callback runs once per collection tick and its observations
//! become that tick's points.
//!
//! Each instrument guards its own series map, so recording on two different
//! instruments never contends. The registry lock is only taken when an
//! instrument is created and once per collection tick.
//!
//! A failing or panicking callback skips that instrument for the tick, bumps
//! the `callback_failures` self-metric and is logged. Other instruments are
//! collected normally.

use crate::attribute::{Attributes, attribute_set_key};
use crate::config::DEFAULT_HISTOGRAM_BOUNDARIES;
use crate::error::{CallbackError, Misuse};
use crate::invariants::debug_assert_buckets_consistent;
use crate::masking::{MaskingRules, mask};
use crate::metric::{HistogramData, InstrumentKind, MetricPoint, MetricValue, Temporality};
use crate::pipeline::PipelineStats;
use crate::record::now_unix_nanos;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// One value reported by an observable callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub value: f64,
    pub attributes: Attributes,
}

impl Observation {
    pub fn new(value: f64, attributes: Attributes) -> Self {
        Self { value, attributes }
    }
}

/// Callback of an observable instrument, invoked once per collection tick.
pub type ObservableCallback =
    Box<dyn Fn() -> Result<Vec<Observation>, CallbackError> + Send + Sync + 'static>;

#[derive(Debug, Clone)]
struct Descriptor {
    name: String,
    description: Option<String>,
    unit: Option<String>,
    kind: InstrumentKind,
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(f64),
    Histogram(HistogramData),
}

#[derive(Debug)]
struct Series {
    attributes: Attributes,
    accumulator: Accumulator,
    start_time_unix_nano: u64,
    updated: bool,
}

struct SyncInstrument {
    descriptor: Descriptor,
    boundaries: Vec<f64>,
    series: Mutex<HashMap<String, Series>>,
}

impl SyncInstrument {
    fn new(descriptor: Descriptor, boundaries: Vec<f64>) -> Self {
        Self {
            descriptor,
            boundaries,
            series: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, value: f64, attributes: &Attributes) {
        if !value.is_finite() {
            Misuse::NonFiniteValue {
                instrument: self.descriptor.name.clone(),
                value,
            }
            .report();
            return;
        }
        if self.descriptor.kind == InstrumentKind::Counter && value < 0.0 {
            Misuse::NegativeIncrement {
                instrument: self.descriptor.name.clone(),
                value,
            }
            .report();
            return;
        }

        let key = attribute_set_key(attributes);
        let mut series = self.series.lock();
        let entry = series.entry(key).or_insert_with(|| Series {
            attributes: attributes.clone(),
            accumulator: match self.descriptor.kind {
                InstrumentKind::Histogram => {
                    Accumulator::Histogram(HistogramData::empty(&self.boundaries))
                }
                _ => Accumulator::Sum(0.0),
            },
            start_time_unix_nano: now_unix_nanos(),
            updated: false,
        });
        match &mut entry.accumulator {
            Accumulator::Sum(total) => *total += value,
            Accumulator::Histogram(data) => data.record(value),
        }
        entry.updated = true;
    }

    fn collect(&self, temporality: Temporality, now: u64, out: &mut Vec<MetricPoint>) {
        let mut series = self.series.lock();
        for s in series.values_mut() {
            if temporality == Temporality::Delta && !s.updated {
                continue;
            }
            let value = match &s.accumulator {
                Accumulator::Sum(total) => MetricValue::Sum(*total),
                Accumulator::Histogram(data) => {
                    debug_assert_buckets_consistent!(data);
                    MetricValue::Histogram(data.clone())
                }
            };
            out.push(point(&self.descriptor, temporality, value, s.attributes.clone(), s.start_time_unix_nano, now));

            s.updated = false;
            if temporality == Temporality::Delta {
                s.accumulator = match &s.accumulator {
                    Accumulator::Sum(_) => Accumulator::Sum(0.0),
                    Accumulator::Histogram(_) => {
                        Accumulator::Histogram(HistogramData::empty(&self.boundaries))
                    }
                };
                s.start_time_unix_nano = now;
            }
        }
    }
}

struct ObservableInstrument {
    descriptor: Descriptor,
    callback: ObservableCallback,
    // Last reported total and window start, per attribute set (observable counters).
    previous: Mutex<HashMap<String, (f64, u64)>>,
    created_unix_nano: u64,
}

impl ObservableInstrument {
    fn observe(&self) -> Result<Vec<Observation>, CallbackError> {
        match catch_unwind(AssertUnwindSafe(|| (self.callback)())) {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "callback panicked".to_string());
                Err(CallbackError::new(format!("panic: {reason}")))
            }
        }
    }

    fn collect(
        &self,
        temporality: Temporality,
        now: u64,
        out: &mut Vec<MetricPoint>,
    ) -> Result<(), CallbackError> {
        let observations = self.observe()?;
        let mut previous = self.previous.lock();
        for obs in observations {
            if !obs.value.is_finite() {
                Misuse::NonFiniteValue {
                    instrument: self.descriptor.name.clone(),
                    value: obs.value,
                }
                .report();
                continue;
            }
            match self.descriptor.kind {
                InstrumentKind::ObservableCounter => {
                    let key = attribute_set_key(&obs.attributes);
                    let (last_total, window_start) = previous
                        .get(&key)
                        .copied()
                        .unwrap_or((0.0, self.created_unix_nano));
                    let (value, start) = match temporality {
                        Temporality::Cumulative => (obs.value, self.created_unix_nano),
                        Temporality::Delta => (obs.value - last_total, window_start),
                    };
                    previous.insert(key, (obs.value, now));
                    out.push(point(&self.descriptor, temporality, MetricValue::Sum(value), obs.attributes, start, now));
                }
                _ => {
                    out.push(point(&self.descriptor, temporality, MetricValue::Gauge(obs.value), obs.attributes, now, now));
                }
            }
        }
        Ok(())
    }
}

fn point(
    descriptor: &Descriptor,
    temporality: Temporality,
    value: MetricValue,
    attributes: Attributes,
    start_time_unix_nano: u64,
    timestamp_unix_nano: u64,
) -> MetricPoint {
    MetricPoint {
        instrument_name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        unit: descriptor.unit.clone(),
        kind: descriptor.kind,
        temporality,
        value,
        attributes,
        start_time_unix_nano,
        timestamp_unix_nano,
    }
}

enum Registered {
    Sync(Arc<SyncInstrument>),
    Observable(Arc<ObservableInstrument>),
}

impl Registered {
    fn kind(&self) -> InstrumentKind {
        match self {
            Self::Sync(i) => i.descriptor.kind,
            Self::Observable(i) => i.descriptor.kind,
        }
    }
}

/// Owns every instrument and turns their state into [`MetricPoint`]s.
pub struct Aggregator {
    instruments: RwLock<HashMap<String, Registered>>,
    temporality: Temporality,
    masking: MaskingRules,
    stats: Arc<PipelineStats>,
}

impl Aggregator {
    pub fn new(temporality: Temporality, masking: MaskingRules, stats: Arc<PipelineStats>) -> Self {
        Self {
            instruments: RwLock::new(HashMap::new()),
            temporality,
            masking,
            stats,
        }
    }

    pub fn temporality(&self) -> Temporality {
        self.temporality
    }

    fn sync_instrument(&self, descriptor: Descriptor, boundaries: Vec<f64>) -> Arc<SyncInstrument> {
        if let Some(existing) = self.lookup_sync(&descriptor) {
            return existing;
        }
        let mut instruments = self.instruments.write();
        match instruments.get(&descriptor.name) {
            Some(Registered::Sync(existing)) if existing.descriptor.kind == descriptor.kind => {
                Arc::clone(existing)
            }
            Some(_) => {
                Misuse::KindConflict {
                    instrument: descriptor.name.clone(),
                }
                .report();
                // Detached: recordings go nowhere.
                Arc::new(SyncInstrument::new(descriptor, boundaries))
            }
            None => {
                let instrument = Arc::new(SyncInstrument::new(descriptor, boundaries));
                instruments.insert(
                    instrument.descriptor.name.clone(),
                    Registered::Sync(Arc::clone(&instrument)),
                );
                instrument
            }
        }
    }

    fn lookup_sync(&self, descriptor: &Descriptor) -> Option<Arc<SyncInstrument>> {
        match self.instruments.read().get(&descriptor.name) {
            Some(Registered::Sync(existing)) if existing.descriptor.kind == descriptor.kind => {
                Some(Arc::clone(existing))
            }
            _ => None,
        }
    }

    fn observable_instrument(&self, descriptor: Descriptor, callback: ObservableCallback) {
        let mut instruments = self.instruments.write();
        match instruments.get(&descriptor.name) {
            Some(existing) if existing.kind() == descriptor.kind => {
                tracing::debug!(
                    instrument = %descriptor.name,
                    "observable instrument already registered; keeping the first callback"
                );
            }
            Some(_) => Misuse::KindConflict {
                instrument: descriptor.name,
            }
            .report(),
            None => {
                let name = descriptor.name.clone();
                let instrument = ObservableInstrument {
                    descriptor,
                    callback,
                    previous: Mutex::new(HashMap::new()),
                    created_unix_nano: now_unix_nanos(),
                };
                instruments.insert(name, Registered::Observable(Arc::new(instrument)));
            }
        }
    }

    /// Records on the instrument named `name`, creating it on first use.
    pub fn record(&self, name: &str, kind: InstrumentKind, value: f64, attributes: &Attributes) {
        if kind.is_observable() {
            Misuse::RecordOnObservable {
                instrument: name.to_string(),
            }
            .report();
            return;
        }
        let boundaries = if kind == InstrumentKind::Histogram {
            DEFAULT_HISTOGRAM_BOUNDARIES.to_vec()
        } else {
            Vec::new()
        };
        let descriptor = Descriptor {
            name: name.to_string(),
            description: None,
            unit: None,
            kind,
        };
        self.sync_instrument(descriptor, boundaries).record(value, attributes);
    }

    /// Runs one collection tick over every instrument.
    ///
    /// Point attributes are masked; failing callbacks are skipped and counted.
    pub fn collect(&self) -> Vec<MetricPoint> {
        let now = now_unix_nanos();
        let snapshot: Vec<Registered> = self
            .instruments
            .read()
            .values()
            .map(|r| match r {
                Registered::Sync(i) => Registered::Sync(Arc::clone(i)),
                Registered::Observable(i) => Registered::Observable(Arc::clone(i)),
            })
            .collect();

        let mut points = Vec::new();
        for instrument in snapshot {
            match instrument {
                Registered::Sync(i) => i.collect(self.temporality, now, &mut points),
                Registered::Observable(i) => {
                    if let Err(error) = i.collect(self.temporality, now, &mut points) {
                        self.stats.record_callback_failure();
                        tracing::warn!(
                            instrument = %i.descriptor.name,
                            %error,
                            "skipping observable instrument for this tick"
                        );
                    }
                }
            }
        }

        if !self.masking.is_empty() {
            for p in &mut points {
                p.attributes = mask(&p.attributes, &self.masking);
            }
        }
        points
    }
}

/// Factory for instruments, bound to one [`Aggregator`]. Cheap to clone.
#[derive(Clone)]
pub struct Meter {
    aggregator: Arc<Aggregator>,
}

impl Meter {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }

    /// Monotonic counter; negative increments are ignored.
    pub fn counter(&self, name: impl Into<String>) -> InstrumentBuilder<'_, Counter> {
        InstrumentBuilder::new(self, name.into(), InstrumentKind::Counter)
    }

    pub fn up_down_counter(&self, name: impl Into<String>) -> InstrumentBuilder<'_, UpDownCounter> {
        InstrumentBuilder::new(self, name.into(), InstrumentKind::UpDownCounter)
    }

    /// Histogram with [`DEFAULT_HISTOGRAM_BOUNDARIES`] unless overridden.
    pub fn histogram(&self, name: impl Into<String>) -> InstrumentBuilder<'_, Histogram> {
        InstrumentBuilder::new(self, name.into(), InstrumentKind::Histogram)
    }

    /// Last-value instrument whose callback is polled every tick.
    pub fn observable_gauge<F>(&self, name: impl Into<String>, callback: F) -> ObservableBuilder<'_>
    where
        F: Fn() -> Result<Vec<Observation>, CallbackError> + Send + Sync + 'static,
    {
        ObservableBuilder::new(self, name.into(), InstrumentKind::ObservableGauge, Box::new(callback))
    }

    /// Monotonic instrument whose callback reports the running total every tick.
    pub fn observable_counter<F>(&self, name: impl Into<String>, callback: F) -> ObservableBuilder<'_>
    where
        F: Fn() -> Result<Vec<Observation>, CallbackError> + Send + Sync + 'static,
    {
        ObservableBuilder::new(self, name.into(), InstrumentKind::ObservableCounter, Box::new(callback))
    }
}

/// Builder returned by the [`Meter`] instrument constructors.
pub struct InstrumentBuilder<'a, I> {
    meter: &'a Meter,
    descriptor: Descriptor,
    boundaries: Option<Vec<f64>>,
    _instrument: PhantomData<I>,
}

impl<'a, I> InstrumentBuilder<'a, I> {
    fn new(meter: &'a Meter, name: String, kind: InstrumentKind) -> Self {
        Self {
            meter,
            descriptor: Descriptor {
                name,
                description: None,
                unit: None,
                kind,
            },
            boundaries: None,
            _instrument: PhantomData,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = Some(description.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.descriptor.unit = Some(unit.into());
        self
    }

    fn register(self) -> Arc<SyncInstrument> {
        let boundaries = match self.boundaries {
            Some(b) if valid_boundaries(&b) => b,
            Some(_) => {
                Misuse::InvalidBoundaries {
                    instrument: self.descriptor.name.clone(),
                }
                .report();
                DEFAULT_HISTOGRAM_BOUNDARIES.to_vec()
            }
            None if self.descriptor.kind == InstrumentKind::Histogram => {
                DEFAULT_HISTOGRAM_BOUNDARIES.to_vec()
            }
            None => Vec::new(),
        };
        self.meter.aggregator.sync_instrument(self.descriptor, boundaries)
    }
}

fn valid_boundaries(boundaries: &[f64]) -> bool {
    boundaries.iter().all(|b| b.is_finite()) && boundaries.windows(2).all(|w| w[0] < w[1])
}

impl InstrumentBuilder<'_, Counter> {
    pub fn build(self) -> Counter {
        Counter(self.register())
    }
}

impl InstrumentBuilder<'_, UpDownCounter> {
    pub fn build(self) -> UpDownCounter {
        UpDownCounter(self.register())
    }
}

impl InstrumentBuilder<'_, Histogram> {
    /// Explicit bucket boundaries, fixed for the instrument's lifetime.
    /// Invalid boundaries fall back to the defaults.
    pub fn with_boundaries(mut self, boundaries: Vec<f64>) -> Self {
        self.boundaries = Some(boundaries);
        self
    }

    pub fn build(self) -> Histogram {
        Histogram(self.register())
    }
}

/// Builder for observable instruments.
pub struct ObservableBuilder<'a> {
    meter: &'a Meter,
    descriptor: Descriptor,
    callback: ObservableCallback,
}

impl<'a> ObservableBuilder<'a> {
    fn new(meter: &'a Meter, name: String, kind: InstrumentKind, callback: ObservableCallback) -> Self {
        Self {
            meter,
            descriptor: Descriptor {
                name,
                description: None,
                unit: None,
                kind,
            },
            callback,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = Some(description.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.descriptor.unit = Some(unit.into());
        self
    }

    /// Registers the instrument. The first callback registered under a name wins.
    pub fn register(self) {
        self.meter
            .aggregator
            .observable_instrument(self.descriptor, self.callback);
    }
}

/// Monotonic sum instrument.
#[derive(Clone)]
pub struct Counter(Arc<SyncInstrument>);

impl Counter {
    pub fn add(&self, value: f64, attributes: &Attributes) {
        self.0.record(value, attributes);
    }

    pub fn name(&self) -> &str {
        &self.0.descriptor.name
    }
}

/// Sum instrument that accepts negative deltas.
#[derive(Clone)]
pub struct UpDownCounter(Arc<SyncInstrument>);

impl UpDownCounter {
    pub fn add(&self, value: f64, attributes: &Attributes) {
        self.0.record(value, attributes);
    }

    pub fn name(&self) -> &str {
        &self.0.descriptor.name
    }
}

/// Bucketed distribution instrument.
#[derive(Clone)]
pub struct Histogram(Arc<SyncInstrument>);

impl Histogram {
    pub fn record(&self, value: f64, attributes: &Attributes) {
        self.0.record(value, attributes);
    }

    pub fn name(&self) -> &str {
        &self.0.descriptor.name
    }

    pub fn boundaries(&self) -> &[f64] {
        &self.0.boundaries
    }
}
