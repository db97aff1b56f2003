//! Debug assertion macros for pipeline invariants.
//!
//! Active only with `debug_assertions`; release builds compile them away.

/// A span handed to the export pipeline must carry an end timestamp.
///
/// Used in: `SpanHandle::end()` right before enqueue
macro_rules! debug_assert_span_ended {
    ($span:expr) => {
        debug_assert!(
            $span.end_time_unix_nano.is_some(),
            "open span {:?} reached the export pipeline",
            $span.name
        )
    };
}

/// A batch never holds more records than `batch_size`.
///
/// Used in: flush loop, after draining the queue into a batch
macro_rules! debug_assert_batch_bounded {
    ($len:expr, $batch_size:expr) => {
        debug_assert!(
            $len <= $batch_size,
            "batch of {} records exceeds batch_size {}",
            $len,
            $batch_size
        )
    };
}

/// Export attempts for one batch never exceed the retry ceiling.
///
/// Used in: `RetryPolicy::run()` before every attempt
macro_rules! debug_assert_attempts_bounded {
    ($attempt:expr, $ceiling:expr) => {
        debug_assert!(
            $attempt <= $ceiling,
            "attempt {} exceeds retry ceiling {}",
            $attempt,
            $ceiling
        )
    };
}

/// Backoff delays are capped.
///
/// Used in: `RetryPolicy::delay_for_attempt()`
macro_rules! debug_assert_delay_capped {
    ($delay:expr, $max:expr) => {
        debug_assert!(
            $delay <= $max,
            "backoff delay {:?} exceeds max_backoff {:?}",
            $delay,
            $max
        )
    };
}

/// Histogram bucket counts add up to the recorded count.
///
/// Used in: histogram accumulator snapshot
macro_rules! debug_assert_buckets_consistent {
    ($data:expr) => {
        debug_assert_eq!(
            $data.bucket_counts.iter().sum::<u64>(),
            $data.count,
            "histogram bucket counts do not sum to count"
        )
    };
}

pub(crate) use debug_assert_attempts_bounded;
pub(crate) use debug_assert_batch_bounded;
pub(crate) use debug_assert_buckets_consistent;
pub(crate) use debug_assert_delay_capped;
pub(crate) use debug_assert_span_ended;
