//! Optional process-wide collector handle.
//!
//! The collector itself holds all state; this is only a place to park one
//! `Arc` so call sites without access to a handle can reach it.

use crate::collector::TelemetryCollector;
use std::sync::{Arc, OnceLock};

static COLLECTOR: OnceLock<Arc<TelemetryCollector>> = OnceLock::new();

/// Installs the process-wide collector. Returns the rejected handle if one is
/// already installed.
pub fn set_collector(collector: Arc<TelemetryCollector>) -> Result<(), Arc<TelemetryCollector>> {
    COLLECTOR.set(collector)
}

/// The installed collector, if any.
pub fn collector() -> Option<Arc<TelemetryCollector>> {
    COLLECTOR.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::exporter::NullExporter;

    #[tokio::test]
    async fn test_second_install_is_rejected() {
        let start = || {
            Arc::new(
                TelemetryCollector::start(
                    TelemetryConfig::new("http://localhost:4318", "global-test"),
                    Arc::new(NullExporter),
                )
                .unwrap(),
            )
        };
        let first = start();
        // Only this test installs a collector in the unit-test binary.
        assert!(set_collector(Arc::clone(&first)).is_ok());
        let second = start();
        assert!(set_collector(Arc::clone(&second)).is_err());
        assert!(Arc::ptr_eq(&collector().unwrap(), &first));
        second.shutdown().await;
    }
}
