use crate::error::ExportError;
use crate::record::{Batch, BatchItem};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;

/// Acknowledgement returned by a successful export call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportAck {
    /// Records the backend accepted
    pub accepted: usize,
}

impl ExportAck {
    pub fn all(batch: &Batch) -> Self {
        Self {
            accepted: batch.len(),
        }
    }
}

/// Trait for shipping batches of telemetry to a backend.
///
/// Uses native async fn in traits (Rust 2024 edition) instead of `#[async_trait]`.
/// A call may take arbitrarily long; the pipeline bounds each attempt with
/// its own timeout and retries on any error.
///
/// For dynamic dispatch, use [`ExporterBoxed`].
pub trait Exporter: Send + Sync {
    /// Exports one batch.
    fn export(&self, batch: Batch) -> impl Future<Output = Result<ExportAck, ExportError>> + Send;

    /// Returns the exporter name for diagnostics.
    fn name(&self) -> &str;
}

/// Boxed future returned by [`ExporterBoxed::export_boxed`].
pub type ExportFuture<'a> = Pin<Box<dyn Future<Output = Result<ExportAck, ExportError>> + Send + 'a>>;

/// Object-safe version of [`Exporter`] for dynamic dispatch.
pub trait ExporterBoxed: Send + Sync {
    /// Exports one batch (boxed future for object safety).
    fn export_boxed(&self, batch: Batch) -> ExportFuture<'_>;

    /// Returns the exporter name for diagnostics.
    fn name(&self) -> &str;
}

/// Blanket implementation: any Exporter can be used as ExporterBoxed
impl<T: Exporter> ExporterBoxed for T {
    fn export_boxed(&self, batch: Batch) -> ExportFuture<'_> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        Exporter::name(self)
    }
}

fn json_lines(batch: &Batch) -> Result<Vec<u8>, ExportError> {
    let mut out = Vec::with_capacity(batch.len() * 256);
    for item in &batch.items {
        let line = ExportLine {
            resource: batch.resource.as_ref(),
            item,
        };
        serde_json::to_writer(&mut out, &line)
            .map_err(|e| ExportError::Serialization(e.to_string()))?;
        out.push(b'\n');
    }
    Ok(out)
}

#[derive(serde::Serialize)]
struct ExportLine<'a> {
    resource: &'a crate::record::Resource,
    #[serde(flatten)]
    item: &'a BatchItem,
}

/// Stdout exporter for local debugging; one JSON object per record.
pub struct StdoutExporter {
    verbose: bool,
}

impl StdoutExporter {
    /// With `verbose == false` batches are counted but not printed.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

impl Exporter for StdoutExporter {
    async fn export(&self, batch: Batch) -> Result<ExportAck, ExportError> {
        if self.verbose {
            let bytes = json_lines(&batch)?;
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            lock.write_all(&bytes)
                .and_then(|()| lock.flush())
                .map_err(|e| ExportError::Transport(e.to_string()))?;
        }
        Ok(ExportAck::all(&batch))
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Appends JSON lines to a file, creating it on first use.
pub struct JsonFileExporter {
    file_path: PathBuf,
}

impl JsonFileExporter {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }
}

impl Exporter for JsonFileExporter {
    async fn export(&self, batch: Batch) -> Result<ExportAck, ExportError> {
        use tokio::io::AsyncWriteExt;

        let bytes = json_lines(&batch)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        Ok(ExportAck::all(&batch))
    }

    fn name(&self) -> &str {
        "json_file"
    }
}

/// Null exporter that discards everything (for benchmarking)
#[derive(Debug, Default)]
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Exporter for NullExporter {
    async fn export(&self, batch: Batch) -> Result<ExportAck, ExportError> {
        Ok(ExportAck::all(&batch))
    }

    fn name(&self) -> &str {
        "null"
    }
}
