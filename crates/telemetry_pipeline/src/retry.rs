//! Bounded retry with exponential backoff and jitter.
//!
//! Every attempt is bounded by `export_timeout`; a slow exporter is abandoned
//! and the attempt counts as failed. After `retry_ceiling` attempts the batch
//! is given up on and [`ExportError::RetriesExhausted`] is returned.

use crate::config::TelemetryConfig;
use crate::error::ExportError;
use crate::exporter::{ExportAck, ExporterBoxed};
use crate::invariants::{debug_assert_attempts_bounded, debug_assert_delay_capped};
use crate::pipeline::PipelineStats;
use crate::record::Batch;
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Retry behavior for a single batch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts (caps exponential growth)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double delay each retry)
    pub backoff_multiplier: f64,
    /// Fraction of each delay that may be randomly shaved off
    pub jitter: f64,
    /// Per-attempt timeout
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TelemetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            max_attempts: config.retry_ceiling.max(1),
            initial_delay: config.initial_backoff,
            max_delay: config.max_backoff,
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            attempt_timeout: config.export_timeout,
        }
    }

    /// Un-jittered delay before `attempt` (0-indexed); zero for the first attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }

    /// Delay before `attempt`, with jitter applied.
    ///
    /// Jitter only ever shortens the delay, so the cap still holds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let delay = if base.is_zero() || self.jitter <= 0.0 {
            base
        } else {
            let shave = rand::thread_rng().gen_range(0.0..=self.jitter);
            base.mul_f64(1.0 - shave)
        };
        debug_assert_delay_capped!(delay, self.max_delay);
        delay
    }

    /// Exports `batch`, retrying on any error until the attempt ceiling.
    pub async fn run(
        &self,
        exporter: &dyn ExporterBoxed,
        batch: Batch,
        stats: &PipelineStats,
    ) -> Result<ExportAck, ExportError> {
        for attempt in 0..self.max_attempts {
            debug_assert_attempts_bounded!(attempt + 1, self.max_attempts);

            let delay = self.delay_for_attempt(attempt);
            if attempt > 0 {
                stats.record_retry();
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }

            stats.record_attempt();
            match timeout(self.attempt_timeout, exporter.export_boxed(batch.clone())).await {
                Ok(Ok(ack)) => {
                    if attempt > 0 {
                        tracing::debug!(
                            exporter = exporter.name(),
                            attempt = attempt + 1,
                            "export recovered after retry"
                        );
                    }
                    return Ok(ack);
                }
                Ok(Err(error)) => {
                    stats.record_failed_attempt();
                    tracing::debug!(
                        exporter = exporter.name(),
                        attempt = attempt + 1,
                        %error,
                        "export attempt failed"
                    );
                }
                Err(_elapsed) => {
                    stats.record_timed_out_attempt();
                    tracing::debug!(
                        exporter = exporter.name(),
                        attempt = attempt + 1,
                        timeout_ms = self.attempt_timeout.as_millis() as u64,
                        "export attempt timed out"
                    );
                }
            }
        }

        Err(ExportError::RetriesExhausted {
            attempts: self.max_attempts,
        })
    }
}
