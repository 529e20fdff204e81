//! # Correlation header propagator
//!
//! Carries a trace across process boundaries: the trace id and the calling
//! exit span's id travel as outbound headers and are accepted on inbound
//! requests, and the trace level header carries the suppression signal
//! (`"0"` means: open no spans for this call chain).
//!
//! Ids are treated as opaque hex strings of a fixed expected width. Short
//! ids are zero-padded on ingestion rather than rejected; anything
//! non-hex or over-width is treated as absent, never as an error surfaced
//! to the host.

use crate::trace::{RemoteParent, SpanContextExt};
use std::sync::OnceLock;
use tracewire::propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator};
use tracewire::trace::{SpanId, TraceId};
use tracewire::{tw_debug, Context};

/// Header carrying the trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// Header carrying the span id of the calling exit span.
pub const PARENT_SPAN_ID_HEADER: &str = "x-parent-span-id";
/// Header carrying the tracing level; `"0"` suppresses tracing for the
/// chain.
pub const TRACE_LEVEL_HEADER: &str = "x-trace-level";

static CORRELATION_HEADER_FIELDS: OnceLock<[String; 3]> = OnceLock::new();

fn correlation_header_fields() -> &'static [String; 3] {
    CORRELATION_HEADER_FIELDS.get_or_init(|| {
        [
            TRACE_ID_HEADER.to_owned(),
            PARENT_SPAN_ID_HEADER.to_owned(),
            TRACE_LEVEL_HEADER.to_owned(),
        ]
    })
}

/// Propagates trace correlation ids and the suppression level as text
/// headers.
#[derive(Clone, Debug, Default)]
pub struct CorrelationPropagator {
    _private: (),
}

impl CorrelationPropagator {
    /// Create a new `CorrelationPropagator`.
    pub fn new() -> Self {
        CorrelationPropagator { _private: () }
    }

    fn extract_remote_parent(&self, extractor: &dyn Extractor) -> Option<RemoteParent> {
        let raw_trace_id = extractor.get(TRACE_ID_HEADER)?.trim();
        let trace_id = match TraceId::from_hex(raw_trace_id) {
            Ok(trace_id) if trace_id != TraceId::INVALID => trace_id,
            _ => {
                tw_debug!(
                    name: "CorrelationPropagator.InvalidTraceId",
                    header = raw_trace_id.to_string()
                );
                return None;
            }
        };

        let parent_span_id = extractor
            .get(PARENT_SPAN_ID_HEADER)
            .map(str::trim)
            .and_then(|raw| match SpanId::from_hex(raw) {
                Ok(span_id) if span_id != SpanId::INVALID => Some(span_id),
                _ => {
                    tw_debug!(
                        name: "CorrelationPropagator.InvalidParentSpanId",
                        header = raw.to_string()
                    );
                    None
                }
            });

        Some(RemoteParent {
            trace_id,
            parent_span_id,
        })
    }
}

impl TextMapPropagator for CorrelationPropagator {
    /// Injects the suppression level and, for an unsuppressed chain with an
    /// active span, the correlation ids.
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        if cx.is_suppressed() {
            injector.set(TRACE_LEVEL_HEADER, "0".to_string());
            return;
        }
        if let Some(span) = cx.span() {
            let context = span.context();
            injector.set(TRACE_ID_HEADER, context.trace_id().to_string());
            injector.set(PARENT_SPAN_ID_HEADER, context.span_id().to_string());
            injector.set(TRACE_LEVEL_HEADER, "1".to_string());
        }
    }

    /// Builds a context carrying the inbound suppression flag and, when the
    /// headers hold usable ids, the remote parent reference.
    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let mut cx = cx.clone();
        if let Some(level) = extractor.get(TRACE_LEVEL_HEADER) {
            if level.trim().starts_with('0') {
                cx = cx.with_suppression();
            }
        }
        if let Some(remote) = self.extract_remote_parent(extractor) {
            cx = cx.with_remote_parent(remote);
        }
        cx
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(correlation_header_fields())
    }
}
