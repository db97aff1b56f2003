//! # Telemetry Pipeline Demo
//!
//! End-to-end run of the in-process telemetry engine against a flaky backend.
//!
//! ## Features Demonstrated
//!
//! ### 1. Native Async Exporter (Rust 2024 Edition)
//! - `SimulatedBackendExporter` implements `Exporter` with `impl Future<...> + Send`
//! - Configurable failure rate and latency; the pipeline retries with jittered backoff
//!
//! ### 2. Multi-Producer Workflow
//! - Concurrent producer tasks, each handling simulated requests
//! - Nested spans (request → db query / cache lookup) via the context carrier
//! - Library calls wrapped with `LibraryAdapter` (span + calls counter + duration histogram + log)
//!
//! ### 3. Masking
//! - Request attributes carry `password` / `auth_token`; they leave the process as `[REDACTED]`
//!
//! ### 4. Backpressure & Self-Metrics
//! - Bounded export queue; drops are counted, never block producers
//! - Final statistics from `pipeline_metrics()`
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (4 producers, 25 requests each)
//! cargo run -p telemetry_pipeline --bin demo --release -- --quick
//!
//! # Print every exported record as a JSON line
//! cargo run -p telemetry_pipeline --bin demo --release -- --verbose
//!
//! # Engine diagnostics
//! RUST_LOG=telemetry_pipeline=debug cargo run -p telemetry_pipeline --bin demo
//! ```

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use telemetry_pipeline::{
    Batch, CallInfo, ExportAck, ExportError, Exporter, FutureExt, LibraryAdapter, SpanKind,
    StdoutExporter, TelemetryCollector, TelemetryConfig, attrs, instrument_call,
    instrument_future,
};
use tracing_subscriber::EnvFilter;

// =============================================================================
// CUSTOM EXPORTER (demonstrating the Exporter trait)
// =============================================================================

/// A simulated backend that occasionally fails or stalls.
struct SimulatedBackendExporter {
    failure_rate: f64,
    latency: Duration,
    verbose: Option<StdoutExporter>,
    export_attempts: AtomicU64,
    failed_exports: AtomicU64,
    records_received: AtomicU64,
}

impl SimulatedBackendExporter {
    fn new(failure_rate: f64, latency: Duration, verbose: bool) -> Self {
        Self {
            failure_rate,
            latency,
            verbose: verbose.then(|| StdoutExporter::new(true)),
            export_attempts: AtomicU64::new(0),
            failed_exports: AtomicU64::new(0),
            records_received: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> (u64, u64, u64) {
        (
            self.export_attempts.load(Ordering::Relaxed),
            self.failed_exports.load(Ordering::Relaxed),
            self.records_received.load(Ordering::Relaxed),
        )
    }
}

impl Exporter for SimulatedBackendExporter {
    fn export(&self, batch: Batch) -> impl Future<Output = Result<ExportAck, ExportError>> + Send {
        self.export_attempts.fetch_add(1, Ordering::Relaxed);
        let should_fail = rand::thread_rng().gen_range(0.0..1.0) < self.failure_rate;

        async move {
            tokio::time::sleep(self.latency).await;

            if should_fail {
                self.failed_exports.fetch_add(1, Ordering::Relaxed);
                return Err(ExportError::Transport(format!(
                    "simulated backend failure (batch of {} records)",
                    batch.len()
                )));
            }
            self.records_received
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            let ack = ExportAck::all(&batch);
            if let Some(stdout) = &self.verbose {
                stdout.export(batch).await?;
            }
            Ok(ack)
        }
    }

    fn name(&self) -> &str {
        "simulated-backend"
    }
}

// =============================================================================
// SIMULATED SERVICE
// =============================================================================

#[derive(Debug)]
struct CacheMiss(String);

impl std::fmt::Display for CacheMiss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cache miss for {}", self.0)
    }
}

impl std::error::Error for CacheMiss {}

#[derive(Debug, Default)]
struct ProducerStats {
    requests: u64,
    cache_misses: u64,
}

async fn run_producer(
    producer_id: usize,
    requests: usize,
    collector: Arc<TelemetryCollector>,
) -> ProducerStats {
    let db = LibraryAdapter::new(Arc::clone(&collector), "db");
    let cache = LibraryAdapter::new(Arc::clone(&collector), "cache");
    let requests_total = collector
        .meter()
        .counter("http.server.requests")
        .with_description("Requests handled by the demo service")
        .build();

    let mut stats = ProducerStats::default();
    for i in 0..requests {
        let span = collector
            .span_builder("GET /api/v1/users/{id}")
            .with_kind(SpanKind::Server)
            .with_attributes(attrs! {
                "http.method" => "GET",
                "http.route" => "/api/v1/users/{id}",
                "producer.id" => producer_id as i64,
                "password" => "hunter2",
                "auth_token" => format!("tok-{producer_id}-{i}"),
            })
            .start();

        let handle = async {
            let key = format!("user:{}", i % 50);
            let cached = instrument_call(
                &cache,
                &CallInfo::new("cache", "get").with_attribute("cache.key", key.clone()),
                || {
                    if i % 3 == 0 {
                        Err(CacheMiss(key.clone()))
                    } else {
                        Ok(())
                    }
                },
            );
            if cached.is_err() {
                stats.cache_misses += 1;
                let _ = instrument_future(
                    &db,
                    &CallInfo::new("database", "select_user")
                        .with_attribute("db.system", "postgresql"),
                    async {
                        tokio::time::sleep(Duration::from_micros(200)).await;
                        Ok::<_, CacheMiss>(())
                    },
                )
                .await;
            }
        };
        handle.with_span(&span).await;

        let status = if i % 10 == 9 { 500 } else { 200 };
        span.set_attribute("http.status_code", status);
        requests_total.add(1.0, &attrs! { "http.status_code" => status });
        if status == 500 {
            span.record_error(&CacheMiss(format!("user:{i}")));
        }
        span.end();
        stats.requests += 1;
    }
    stats
}

// =============================================================================
// MAIN APPLICATION
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("telemetry_pipeline=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose");
    let quick = args.iter().any(|a| a == "--quick");
    let (num_producers, requests_per_producer) = if quick { (4, 25) } else { (8, 200) };

    println!("📋 Demo Configuration:");
    println!("   Mode: {}", if quick { "quick" } else { "full" });
    println!("   Producers: {}", num_producers);
    println!("   Requests per producer: {}", requests_per_producer);
    println!();

    // =========================================================================
    // PHASE 1: Start the collector
    // =========================================================================

    let config = TelemetryConfig::new("http://localhost:4318", "demo-service")
        .with_resource_attribute("deployment.environment", "demo")
        .with_batch_size(200)
        .with_flush_interval(Duration::from_millis(200))
        .with_queue_capacity(4096)
        .with_retry_ceiling(4)
        .with_backoff(Duration::from_millis(10), Duration::from_millis(200))
        .with_export_timeout(Duration::from_millis(500))
        .with_metric_interval(Duration::from_secs(1));

    let backend = Arc::new(SimulatedBackendExporter::new(
        0.2,
        Duration::from_millis(5),
        verbose,
    ));
    let collector = Arc::new(TelemetryCollector::start(config, backend.clone())?);
    println!("🔧 Collector started (batch 200, flush 200ms, 4 attempts per batch)\n");

    // =========================================================================
    // PHASE 2: Run producers
    // =========================================================================

    let start = Instant::now();
    let mut producers = tokio::task::JoinSet::new();
    for producer_id in 0..num_producers {
        let collector = Arc::clone(&collector);
        producers.spawn(run_producer(producer_id, requests_per_producer, collector));
    }

    let mut requests = 0;
    let mut cache_misses = 0;
    while let Some(result) = producers.join_next().await {
        match result {
            Ok(stats) => {
                requests += stats.requests;
                cache_misses += stats.cache_misses;
            }
            Err(e) => eprintln!("   ❌ Producer panicked: {}", e),
        }
    }
    let generation_time = start.elapsed();
    println!("🚀 {} requests handled in {:?} ({} cache misses)\n", requests, generation_time, cache_misses);

    // =========================================================================
    // PHASE 3: Graceful shutdown
    // =========================================================================

    collector.shutdown().await;
    let metrics = collector.pipeline_metrics();
    let (attempts, failures, received) = backend.stats();

    println!("📊 Final Statistics");
    println!("   Records enqueued:        {:>8}", metrics.enqueued);
    println!("   Records exported:        {:>8}", metrics.exported_items);
    println!("   Batches exported:        {:>8}", metrics.exported_batches);
    println!("   Export attempts:         {:>8}", metrics.export_attempts);
    println!("   Retries:                 {:>8}", metrics.export_retries);
    println!("   Dropped (queue full):    {:>8}", metrics.dropped_queue_full);
    println!("   Dropped (export failed): {:>8}", metrics.dropped_export_failed);
    println!("   Dropped (after shutdown):{:>8}", metrics.dropped_after_shutdown);
    println!();
    println!("📡 Backend: {} attempts, {} failed, {} records received", attempts, failures, received);
    println!("\n✨ Demo completed in {:?}\n", start.elapsed());
    Ok(())
}
