//! Batching Exporter Pipeline
//!
//! Producers push finished records into a bounded [`ExportQueue`] without ever
//! blocking; when it is full the record is dropped and counted. A background
//! flush loop drains the queue into batches of at most `batch_size` records and
//! hands them to the exporter through the [`RetryPolicy`].
//!
//! ```text
//!  producers ──try push──► ExportQueue (ArrayQueue, bounded)
//!                               │  batch_size reached ─► Notify
//!                               ▼
//!                     flush loop (tokio::select!)
//!                      ├─ interval tick      → drain everything
//!                      ├─ ready notification → drain full batches
//!                      ├─ force_flush        → drain + wait for in-flight
//!                      └─ shutdown           → bounded final drain
//!                               │  (interrupts any pending permit wait)
//!                               │
//!                  JoinSet + Semaphore(max_concurrent_exports)
//!                               ▼
//!                   RetryPolicy::run(exporter, batch)
//! ```
//!
//! Records from one producer keep their enqueue order inside a batch. With
//! `max_concurrent_exports == 1` (the default) batches are also exported in
//! order; with more, batches may complete out of order.
//!
//! A batch leaves the queue only once an export permit is held, so every
//! record is either still queued, in flight, exported or counted as dropped.

use crate::config::TelemetryConfig;
use crate::error::ConfigurationError;
use crate::exporter::ExporterBoxed;
use crate::invariants::debug_assert_batch_bounded;
use crate::record::{Batch, BatchItem, Resource};
use crate::retry::RetryPolicy;
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Thread-safe pipeline counters (uses atomics)
///
/// Each counter sits on its own cache line; producers on different cores
/// bump `enqueued` while the flush loop bumps the export counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    enqueued: CachePadded<AtomicU64>,
    exported_items: CachePadded<AtomicU64>,
    exported_batches: CachePadded<AtomicU64>,
    dropped_queue_full: CachePadded<AtomicU64>,
    dropped_export_failed: CachePadded<AtomicU64>,
    dropped_after_shutdown: CachePadded<AtomicU64>,
    export_attempts: CachePadded<AtomicU64>,
    export_retries: CachePadded<AtomicU64>,
    failed_attempts: CachePadded<AtomicU64>,
    timed_out_attempts: CachePadded<AtomicU64>,
    callback_failures: CachePadded<AtomicU64>,
    inflight_items: CachePadded<AtomicU64>,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineMetrics {
        PipelineMetrics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            exported_items: self.exported_items.load(Ordering::Relaxed),
            exported_batches: self.exported_batches.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_export_failed: self.dropped_export_failed.load(Ordering::Relaxed),
            dropped_after_shutdown: self.dropped_after_shutdown.load(Ordering::Relaxed),
            export_attempts: self.export_attempts.load(Ordering::Relaxed),
            export_retries: self.export_retries.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            timed_out_attempts: self.timed_out_attempts.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.export_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.export_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// A timed-out attempt is also a failed attempt.
    pub(crate) fn record_timed_out_attempt(&self) {
        self.timed_out_attempts.fetch_add(1, Ordering::Relaxed);
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_callback_failure(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_exported(&self, items: u64) {
        self.exported_items.fetch_add(items, Ordering::Relaxed);
        self.exported_batches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_export_dropped(&self, items: u64) {
        self.dropped_export_failed.fetch_add(items, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the pipeline's self-metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineMetrics {
    /// Records accepted into the queue
    pub enqueued: u64,
    /// Records acknowledged by the exporter
    pub exported_items: u64,
    /// Successful export calls
    pub exported_batches: u64,
    /// Records rejected because the queue was full
    pub dropped_queue_full: u64,
    /// Records given up on after the retry ceiling (or rejected by the backend)
    pub dropped_export_failed: u64,
    /// Records offered after shutdown, or left over when the final drain timed out
    pub dropped_after_shutdown: u64,
    pub export_attempts: u64,
    pub export_retries: u64,
    pub failed_attempts: u64,
    pub timed_out_attempts: u64,
    /// Observable callbacks that failed or panicked
    pub callback_failures: u64,
}

impl PipelineMetrics {
    /// Total records lost for any reason.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_queue_full + self.dropped_export_failed + self.dropped_after_shutdown
    }
}

/// Bounded multi-producer queue feeding the flush loop.
pub struct ExportQueue {
    items: ArrayQueue<BatchItem>,
    // Held shared by producers across the closed-check and push, exclusively by close().
    closed: RwLock<bool>,
    batch_size: usize,
    ready: Notify,
    stats: Arc<PipelineStats>,
}

impl ExportQueue {
    pub fn new(capacity: usize, batch_size: usize, stats: Arc<PipelineStats>) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            closed: RwLock::new(false),
            batch_size: batch_size.max(1),
            ready: Notify::new(),
            stats,
        }
    }

    /// Non-blocking enqueue. Returns `false` if the record was dropped.
    pub fn enqueue(&self, item: BatchItem) -> bool {
        let closed = self.closed.read();
        if *closed {
            self.stats.dropped_after_shutdown.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.items.push(item).is_err() {
            self.stats.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        drop(closed);
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        if self.items.len() >= self.batch_size {
            self.ready.notify_one();
        }
        true
    }

    /// Pops up to `max` records in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<BatchItem> {
        let mut batch = Vec::with_capacity(max.min(self.items.len()));
        while batch.len() < max {
            match self.items.pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    /// Stops accepting records. Records already queued stay drainable.
    pub fn close(&self) {
        *self.closed.write() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }
}

/// Destination for finished records.
pub trait RecordSink: Send + Sync {
    /// Hands `item` over without blocking. Returns `false` if it was dropped.
    fn submit(&self, item: BatchItem) -> bool;
}

impl RecordSink for ExportQueue {
    fn submit(&self, item: BatchItem) -> bool {
        self.enqueue(item)
    }
}

/// Settings for the flush loop, taken from [`TelemetryConfig`].
#[derive(Debug, Clone)]
pub(crate) struct PipelineConfig {
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub flush_interval: Duration,
    pub max_concurrent_exports: usize,
    pub shutdown_timeout: Duration,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub(crate) fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            queue_capacity: config.queue_capacity,
            flush_interval: config.flush_interval,
            max_concurrent_exports: config.max_concurrent_exports,
            shutdown_timeout: config.shutdown_timeout,
            retry: RetryPolicy::from_config(config),
        }
    }

    /// A zero interval would panic inside the flush loop.
    fn validate(&self) -> Result<(), ConfigurationError> {
        for (field, value) in [
            ("batch_size", self.batch_size),
            ("queue_capacity", self.queue_capacity),
            ("max_concurrent_exports", self.max_concurrent_exports),
        ] {
            if value == 0 {
                return Err(ConfigurationError::ZeroValue { field });
            }
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigurationError::ZeroDuration {
                field: "flush_interval",
            });
        }
        Ok(())
    }
}

/// Handle on the bounded queue plus its background flush loop.
pub struct Pipeline {
    queue: Arc<ExportQueue>,
    stats: Arc<PipelineStats>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Spawns the flush loop on the current Tokio runtime.
    pub(crate) fn spawn(
        config: PipelineConfig,
        exporter: Arc<dyn ExporterBoxed>,
        resource: Arc<Resource>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConfigurationError::NoRuntime)?;

        let stats = Arc::new(PipelineStats::default());
        let queue = Arc::new(ExportQueue::new(
            config.queue_capacity,
            config.batch_size,
            Arc::clone(&stats),
        ));
        let (flush_tx, flush_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let flush_loop = FlushLoop {
            queue: Arc::clone(&queue),
            stats: Arc::clone(&stats),
            exporter,
            resource,
            retry: Arc::new(config.retry.clone()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_exports.max(1))),
            tasks: JoinSet::new(),
            batch_size: config.batch_size,
            shutdown_rx,
        };
        let flush_task = runtime.spawn(flush_loop.run(
            config.flush_interval,
            config.shutdown_timeout,
            flush_rx,
        ));

        Ok(Self {
            queue,
            stats,
            flush_tx,
            shutdown_tx,
            flush_task: Mutex::new(Some(flush_task)),
        })
    }

    /// The queue as a producer-side sink.
    pub fn sink(&self) -> Arc<dyn RecordSink> {
        Arc::clone(&self.queue) as Arc<dyn RecordSink>
    }

    pub fn queue(&self) -> &Arc<ExportQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Non-blocking; see [`ExportQueue::enqueue`].
    pub fn enqueue(&self, item: BatchItem) -> bool {
        self.queue.enqueue(item)
    }

    /// Drains the queue and waits for every in-flight export to finish.
    pub async fn force_flush(&self) {
        if self.queue.is_closed() {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stops intake, runs the bounded final drain and waits for the loop to exit.
    ///
    /// Only the first call does any work.
    pub async fn shutdown(&self) {
        self.signal_shutdown();
        let task = self.flush_task.lock().take();
        if let Some(task) = task
            && let Err(error) = task.await
        {
            tracing::warn!(%error, "flush loop terminated abnormally");
        }
    }

    /// Closes the queue and tells the flush loop to finish, without waiting.
    pub fn signal_shutdown(&self) {
        self.queue.close();
        self.shutdown_tx.send_replace(true);
    }
}

/// How much of the queue a dispatch pass takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    /// Only full batches; the remainder waits for the next tick.
    FullBatches,
    /// Everything, including a trailing partial batch.
    Everything,
    /// Everything, ignoring the shutdown signal (already observed).
    Final,
}

struct FlushLoop {
    queue: Arc<ExportQueue>,
    stats: Arc<PipelineStats>,
    exporter: Arc<dyn ExporterBoxed>,
    resource: Arc<Resource>,
    retry: Arc<RetryPolicy>,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    batch_size: usize,
    shutdown_rx: watch::Receiver<bool>,
}

impl FlushLoop {
    async fn run(
        mut self,
        flush_interval: Duration,
        shutdown_timeout: Duration,
        mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        let mut interval = tokio::time::interval(flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        let queue = Arc::clone(&self.queue);
        loop {
            let flow = tokio::select! {
                // Reap completed export tasks (non-blocking)
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    Self::reap(result);
                    ControlFlow::Continue(())
                }

                _ = interval.tick() => self.dispatch(Drain::Everything).await,

                () = queue.ready.notified() => self.dispatch(Drain::FullBatches).await,

                Some(ack) = flush_rx.recv() => {
                    let flow = match self.dispatch(Drain::Everything).await {
                        ControlFlow::Continue(()) => self.wait_inflight_or_stop().await,
                        stopped => stopped,
                    };
                    let _ = ack.send(());
                    flow
                }

                () = Self::stopped(&mut self.shutdown_rx) => ControlFlow::Break(()),
            };
            if flow.is_break() {
                break;
            }
        }

        self.final_drain(shutdown_timeout).await;
        // Anyone still waiting on force_flush is released by dropping flush_rx.
        drop(flush_rx);
    }

    /// Resolves once shutdown has been signalled (or the pipeline handle is gone).
    async fn stopped(shutdown_rx: &mut watch::Receiver<bool>) {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
    }

    /// Moves batches from the queue into export tasks.
    ///
    /// Each batch is drained only after its permit is acquired. Unless `mode`
    /// is [`Drain::Final`], a shutdown signal interrupts the permit wait and
    /// leaves the remaining records queued for the final drain.
    async fn dispatch(&mut self, mode: Drain) -> ControlFlow<()> {
        loop {
            let ready = self.queue.len();
            if ready == 0 || (mode == Drain::FullBatches && ready < self.batch_size) {
                return ControlFlow::Continue(());
            }

            let acquire = Arc::clone(&self.semaphore).acquire_owned();
            let permit = if mode == Drain::Final {
                acquire.await
            } else {
                tokio::select! {
                    biased;
                    () = Self::stopped(&mut self.shutdown_rx) => return ControlFlow::Break(()),
                    permit = acquire => permit,
                }
            };
            let Ok(permit) = permit else {
                return ControlFlow::Continue(());
            };

            let items = self.queue.drain(self.batch_size);
            if items.is_empty() {
                return ControlFlow::Continue(());
            }
            self.spawn_export(items, permit);
        }
    }

    fn spawn_export(&mut self, items: Vec<BatchItem>, permit: OwnedSemaphorePermit) {
        debug_assert_batch_bounded!(items.len(), self.batch_size);

        let count = items.len() as u64;
        let batch = Batch::with_items(items, Arc::clone(&self.resource));
        let exporter = Arc::clone(&self.exporter);
        let retry = Arc::clone(&self.retry);
        let stats = Arc::clone(&self.stats);
        stats.inflight_items.fetch_add(count, Ordering::Relaxed);

        self.tasks.spawn(async move {
            let result = retry.run(exporter.as_ref(), batch, &stats).await;
            stats.inflight_items.fetch_sub(count, Ordering::Relaxed);
            match result {
                Ok(ack) => {
                    let accepted = (ack.accepted as u64).min(count);
                    stats.record_exported(accepted);
                    if accepted < count {
                        stats.record_export_dropped(count - accepted);
                        tracing::warn!(
                            exporter = exporter.name(),
                            items = count - accepted,
                            "collector rejected part of a batch"
                        );
                    }
                }
                Err(error) => {
                    stats.record_export_dropped(count);
                    tracing::warn!(
                        exporter = exporter.name(),
                        items = count,
                        %error,
                        "dropping batch after failed export"
                    );
                }
            }
            drop(permit); // Release semaphore
        });
    }

    /// Waits for in-flight exports; a shutdown signal cuts the wait short.
    async fn wait_inflight_or_stop(&mut self) -> ControlFlow<()> {
        while !self.tasks.is_empty() {
            tokio::select! {
                biased;
                () = Self::stopped(&mut self.shutdown_rx) => return ControlFlow::Break(()),
                Some(result) = self.tasks.join_next() => Self::reap(result),
            }
        }
        ControlFlow::Continue(())
    }

    async fn wait_inflight(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            Self::reap(result);
        }
    }

    fn reap(result: Result<(), tokio::task::JoinError>) {
        if let Err(error) = result
            && !error.is_cancelled()
        {
            tracing::warn!(%error, "export task panicked");
        }
    }

    /// Exports whatever is left, bounded by `shutdown_timeout`. Records that
    /// could not be handed off in time are counted as drops.
    async fn final_drain(&mut self, shutdown_timeout: Duration) {
        let drained = tokio::time::timeout(shutdown_timeout, async {
            let _ = self.dispatch(Drain::Final).await;
            self.wait_inflight().await;
        })
        .await;

        if drained.is_err() {
            self.tasks.shutdown().await;
            let aborted = self.stats.inflight_items.swap(0, Ordering::Relaxed);
            self.stats.record_export_dropped(aborted);
            let leftover = self.queue.drain(usize::MAX).len() as u64;
            self.stats
                .dropped_after_shutdown
                .fetch_add(leftover, Ordering::Relaxed);
            tracing::warn!(
                in_flight = aborted,
                queued = leftover,
                timeout_ms = shutdown_timeout.as_millis() as u64,
                "final drain timed out"
            );
        }
    }
}
