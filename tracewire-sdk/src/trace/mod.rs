//! # Span lifecycle engine
//!
//! Everything a span goes through, from creation to export: the
//! [`TracerProvider`] and [`Tracer`], the [`Span`] state machine, the
//! per-call [`decision`] logic, span processors with batching, the
//! pending-span reaper, and the [`SpanExporter`] boundary to the transport.

pub mod config;
mod context;
pub mod decision;
mod export;
mod id_generator;
mod in_memory_exporter;
pub mod metrics;
mod pending;
mod provider;
mod span;
mod span_processor;
mod tracer;

pub use config::Config;
pub use context::{current_entry_span, current_span, RemoteParent, SpanContextExt};
pub use export::{Batch, ExportResult, SpanData, SpanExporter};
pub use id_generator::{IdGenerator, IncrementIdGenerator, RandomIdGenerator};
pub use in_memory_exporter::InMemorySpanExporter;
pub use provider::{Builder, TracerProvider};
pub use span::{Span, SpanContext};
pub use span_processor::{
    BatchConfig, BatchConfigBuilder, BatchSpanProcessor, BatchSpanProcessorBuilder,
    SimpleSpanProcessor, SpanProcessor,
};
pub use tracer::Tracer;

#[cfg(test)]
pub(crate) fn test_span_data(name: &'static str) -> SpanData {
    use tracewire::trace::{SpanId, SpanKind, TraceId};

    SpanData {
        context: SpanContext::new(TraceId::from(1u128), SpanId::from(1u64), None),
        kind: SpanKind::Exit,
        name: std::borrow::Cow::Borrowed(name),
        start_time: std::time::SystemTime::now(),
        duration: std::time::Duration::from_millis(1),
        error_count: 0,
        batch: None,
        sub_operations: Vec::new(),
        data: serde_json::Map::new(),
        stack_trace: Vec::new(),
    }
}
