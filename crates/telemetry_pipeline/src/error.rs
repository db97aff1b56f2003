//! Error taxonomy for the telemetry engine.
//!
//! Only [`ConfigurationError`] ever reaches application code. Export failures
//! are retried and eventually counted as drops, callback failures are isolated
//! per instrument, and instrumentation misuse is a logged no-op.

use thiserror::Error;

/// Invalid configuration detected while constructing the collector.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// The collector endpoint is required and was empty.
    #[error("endpoint must not be empty")]
    MissingEndpoint,
    /// The service name is required and was empty.
    #[error("service_name must not be empty")]
    MissingServiceName,
    /// Sampling ratio outside `[0, 1]`.
    #[error("sampling_ratio must be within [0, 1], got {0}")]
    InvalidSamplingRatio(f64),
    /// A count-like option that must be at least one.
    #[error("{field} must be at least 1")]
    ZeroValue {
        /// Name of the offending option.
        field: &'static str,
    },
    /// A duration option that must be non-zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Name of the offending option.
        field: &'static str,
    },
    /// Backoff multiplier below one would shrink delays.
    #[error("backoff_multiplier must be >= 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),
    /// Jitter fraction outside `[0, 1]`.
    #[error("jitter must be within [0, 1], got {0}")]
    InvalidJitter(f64),
    /// `max_backoff` smaller than `initial_backoff`.
    #[error("max_backoff must not be smaller than initial_backoff")]
    InvalidBackoffRange,
    /// A masking or trace-rule pattern failed to compile.
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The pattern as written in the configuration.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Configuration text could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// The background flush loop needs a Tokio runtime.
    #[error("no tokio runtime available to host the flush loop")]
    NoRuntime,
}

/// Error types for batch export operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Transport-layer error (network, gRPC, HTTP)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The collector answered but refused the batch
    #[error("batch rejected by collector: {0}")]
    Rejected(String),
    /// A single attempt exceeded the per-attempt timeout
    #[error("export attempt timed out")]
    Timeout,
    /// All retry attempts exhausted
    #[error("all retry attempts exhausted after {attempts} tries")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Failure raised by an observable instrument callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("observable callback failed: {0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Instrumentation misuse. Reported as a diagnostic, never returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Misuse {
    #[error("span {name:?} already ended; {operation} ignored")]
    SpanEnded {
        name: String,
        operation: &'static str,
    },
    #[error("span not started; {operation} ignored")]
    SpanNotStarted { operation: &'static str },
    #[error("no active span; {operation} ignored")]
    NoActiveSpan { operation: &'static str },
    #[error("counter {instrument:?} received negative increment {value}")]
    NegativeIncrement { instrument: String, value: f64 },
    #[error("non-finite value {value} recorded on {instrument:?}")]
    NonFiniteValue { instrument: String, value: f64 },
    #[error("instrument {instrument:?} already registered with a different kind")]
    KindConflict { instrument: String },
    #[error("histogram {instrument:?} boundaries must be finite and strictly increasing")]
    InvalidBoundaries { instrument: String },
    #[error("observable instrument {instrument:?} is reported by its callback, not recorded")]
    RecordOnObservable { instrument: String },
}

impl Misuse {
    /// Emits the diagnostic. Misuse never propagates into caller code.
    pub(crate) fn report(&self) {
        tracing::debug!(target: "telemetry_pipeline::misuse", misuse = %self, "instrumentation misuse");
    }
}
