//! In-memory span exporter for testing.

use crate::trace::export::{ExportResult, SpanData, SpanExporter};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tracewire::trace::{TraceError, TraceResult};

/// An in-memory span exporter that collects finished spans for later
/// inspection. Useful for testing and demonstrations.
///
/// Spans are stored behind a shared handle, so a clone of the exporter kept
/// by the test can read what the processor-owned clone collected.
///
/// # Example
///
/// ```
/// use tracewire::Context;
/// use tracewire::trace::SpanKind;
/// use tracewire_sdk::trace::{InMemorySpanExporter, TracerProvider};
///
/// let exporter = InMemorySpanExporter::default();
/// let provider = TracerProvider::builder()
///     .with_simple_exporter(exporter.clone())
///     .build();
///
/// let span = provider.tracer().start_span("work", SpanKind::Entry, &Context::current());
/// span.end();
///
/// assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemorySpanExporter {
    /// Returns the finished spans collected so far.
    pub fn get_finished_spans(&self) -> TraceResult<Vec<SpanData>> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .map_err(|_| TraceError::ExportFailed("InMemorySpanExporter mutex poison".into()))
    }

    /// Clears the collected spans.
    pub fn reset(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&mut self, mut batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .spans
            .lock()
            .map(|mut spans| spans.append(&mut batch))
            .map_err(|_| TraceError::ExportFailed("InMemorySpanExporter mutex poison".into()));
        Box::pin(async move { result })
    }

    // Collected spans intentionally stay readable after shutdown, so tests
    // can assert on what a processor flushed on its way out.
}
