//! Binding spans into the execution [`Context`].
//!
//! The engine stores the active span and the active entry span as typed
//! context values, so they ride along with everything else the context
//! carries across continuation boundaries.

use crate::trace::span::Span;
use tracewire::trace::{SpanId, SpanKind, TraceId};
use tracewire::Context;

/// Context value holding the currently active span of a call chain.
#[derive(Clone, Debug)]
struct CurrentSpan(Span);

/// Context value holding the entry span at the root of the current trace on
/// this call chain. Kept separately so instrumentations can reach the entry
/// span (for example to attach an error message) even while an exit or
/// intermediate span is the active one.
#[derive(Clone, Debug)]
struct CurrentEntrySpan(Span);

/// Trace and parent span ids received from a remote caller via wire
/// headers. Consulted when an entry span is started on a chain that has no
/// local parent yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteParent {
    /// Trace id carried over from the calling process.
    pub trace_id: TraceId,
    /// Span id of the calling process's exit span, if present.
    pub parent_span_id: Option<SpanId>,
}

/// Methods for binding and reading spans on a [`Context`].
pub trait SpanContextExt {
    /// Returns a copy of this context with `span` set as the active span.
    ///
    /// If `span` is an entry span it also becomes the context's entry span.
    fn with_span(&self, span: Span) -> Context;

    /// The active span of this context, if any.
    fn span(&self) -> Option<Span>;

    /// The entry span at the root of this context's trace, if any.
    fn entry_span(&self) -> Option<Span>;

    /// Returns a copy of this context carrying remote correlation ids.
    fn with_remote_parent(&self, remote: RemoteParent) -> Context;

    /// Remote correlation ids attached to this context, if any.
    fn remote_parent(&self) -> Option<RemoteParent>;
}

impl SpanContextExt for Context {
    fn with_span(&self, span: Span) -> Context {
        let cx = if span.kind() == SpanKind::Entry {
            self.with_value(CurrentEntrySpan(span.clone()))
        } else {
            self.clone()
        };
        cx.with_value(CurrentSpan(span))
    }

    fn span(&self) -> Option<Span> {
        self.get::<CurrentSpan>().map(|current| current.0.clone())
    }

    fn entry_span(&self) -> Option<Span> {
        self.get::<CurrentEntrySpan>()
            .map(|current| current.0.clone())
    }

    fn with_remote_parent(&self, remote: RemoteParent) -> Context {
        self.with_value(remote)
    }

    fn remote_parent(&self) -> Option<RemoteParent> {
        self.get::<RemoteParent>().cloned()
    }
}

/// The active span of the current context, if any.
pub fn current_span() -> Option<Span> {
    Context::map_current(|cx| cx.span())
}

/// The entry span of the current context, if any.
pub fn current_entry_span() -> Option<Span> {
    Context::map_current(|cx| cx.entry_span())
}
