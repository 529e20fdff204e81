//! # Tracer
//!
//! The [`Tracer`] creates spans with correct causal linkage. Trace and
//! parent ids are inherited in a fixed order: ids carried over from a
//! remote caller win (they continue a cross-process trace), otherwise the
//! ambient parent span is used, and a chain with neither starts a fresh
//! trace with no parent id.

use crate::trace::context::SpanContextExt;
use crate::trace::metrics;
use crate::trace::provider::TracerCore;
use crate::trace::span::{Span, SpanContext};
use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tracewire::trace::SpanKind;
use tracewire::Context;

/// Creates spans backed by a [`TracerProvider`]'s pipeline.
///
/// [`TracerProvider`]: crate::trace::TracerProvider
#[derive(Clone, Debug)]
pub struct Tracer {
    core: Arc<TracerCore>,
}

impl Tracer {
    pub(crate) fn new(core: Arc<TracerCore>) -> Self {
        Tracer { core }
    }

    /// Starts a new span as part of the call chain described by `cx`.
    ///
    /// The span is registered with the pending-span reaper and announced to
    /// the processors. It does not become the active span by itself; use
    /// [`SpanContextExt::with_span`] and attach the returned context.
    ///
    /// Linkage: ids from a remote caller ([`RemoteParent`] in `cx`) are used
    /// when the chain has no local parent span yet; a local parent span
    /// contributes its trace id and its own span id as the parent id; with
    /// neither, a fresh trace id is generated and the span is a root.
    ///
    /// [`RemoteParent`]: crate::trace::RemoteParent
    pub fn start_span(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        cx: &Context,
    ) -> Span {
        metrics::record_opened();

        let (trace_id, parent_span_id) = match cx.span() {
            Some(parent) => (
                parent.context().trace_id(),
                Some(parent.context().span_id()),
            ),
            None => match cx.remote_parent() {
                Some(remote) => (remote.trace_id, remote.parent_span_id),
                None => (self.core.id_generator().new_trace_id(), None),
            },
        };
        let span_id = self.core.id_generator().new_span_id();

        let config = self.core.config();
        let stack_trace = if config.collect_stack_traces {
            capture_stack_trace(config.max_stack_frames)
        } else {
            Vec::new()
        };

        let span = Span::new(
            SpanContext::new(trace_id, span_id, parent_span_id),
            kind,
            name.into(),
            stack_trace,
            Instant::now() + config.pending_span_timeout,
            self.core.clone(),
        );
        self.core.pending().track(&span.inner);
        self.core.on_span_start(&span, cx);
        span
    }

    /// Starts a span and returns it together with a context in which it is
    /// the active span.
    pub fn start_active_span(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        cx: &Context,
    ) -> (Span, Context) {
        let span = self.start_span(name, kind, cx);
        let cx = cx.with_span(span.clone());
        (span, cx)
    }
}

/// Captures a bounded call-stack snapshot for span diagnostics.
fn capture_stack_trace(max_frames: usize) -> Vec<String> {
    Backtrace::force_capture()
        .to_string()
        .lines()
        .map(|line| line.trim().to_owned())
        .take(max_frames)
        .collect()
}
