//! Span exporters.

use crate::trace::span::SpanContext;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};
use tracewire::trace::{SpanKind, TraceResult};

/// Describes the result of an export.
pub type ExportResult = TraceResult<()>;

/// `SpanExporter` defines the interface that protocol-specific exporters
/// must implement so that they can be plugged into the engine as the
/// downstream span sink.
///
/// The exporter is expected to be a simple encoder and transmitter; it is
/// the processors that batch, retry-limit and shed load. An export call must
/// never block the call chain that produced the spans, and a failed export
/// only ever costs observability data, not application behavior.
pub trait SpanExporter: Send + Sync + Debug {
    /// Exports a batch of finished spans.
    ///
    /// This function is never called concurrently for the same exporter
    /// instance, and must not block indefinitely; there must be a reasonable
    /// upper limit after which the call times out with an error result.
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter. After this call, `export` is not called
    /// again.
    fn shutdown(&mut self) {}

    /// A hint that any buffered spans should be sent as soon as possible.
    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        Box::pin(async { Ok(()) })
    }
}

/// Descriptor attached to a span that stands in for a group of
/// sub-operations dispatched together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Number of sub-operations the span subsumes.
    pub size: usize,
}

/// `SpanData` contains all the information collected for one finished span
/// and is the standard input for exporters.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// Trace, span and parent span ids.
    pub context: SpanContext,
    /// Causal role of the span.
    pub kind: SpanKind,
    /// Logical name of the instrumented operation.
    pub name: Cow<'static, str>,
    /// Wall-clock start time.
    pub start_time: SystemTime,
    /// Elapsed time, computed when the span was finalized.
    pub duration: Duration,
    /// Number of failed (sub-)operations; 0 for a successful span.
    pub error_count: u32,
    /// Present when the span subsumes a group of sub-operations.
    pub batch: Option<Batch>,
    /// Names of the sub-operations contributed to a batch span.
    pub sub_operations: Vec<String>,
    /// Instrumentation-specific payload, keyed by section.
    pub data: Map<String, Value>,
    /// Call-stack snapshot captured at span creation.
    pub stack_trace: Vec<String>,
}
