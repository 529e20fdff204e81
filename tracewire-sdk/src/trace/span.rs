//! # Span
//!
//! A `Span` is the record of one traced operation: its causal linkage
//! (trace id, span id, parent span id), kind, timing, outcome and
//! instrumentation-specific payload.
//!
//! Spans are cheaply cloneable handles over shared state. The mutable part
//! of a span lives behind `Option` and every terminal transition
//! (finalize, cancel, the pending timeout) goes through `Option::take`, so
//! however those race, a span is finalized at most once and transmitted at
//! most once. A span that has been finalized stops recording; late data
//! writes are silently ignored, matching the behavior of the uninstrumented
//! program.

use crate::trace::export::{Batch, SpanData};
use crate::trace::metrics;
use crate::trace::provider::TracerCore;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tracewire::trace::{SpanId, SpanKind, TraceId};

/// Immutable identity of a span: its trace, its own id, and its causal
/// parent.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpanContext {
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
}

impl SpanContext {
    /// Construct a new `SpanContext`.
    pub fn new(trace_id: TraceId, span_id: SpanId, parent_span_id: Option<SpanId>) -> Self {
        SpanContext {
            trace_id,
            span_id,
            parent_span_id,
        }
    }

    /// The trace this span belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The span's own id.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The id of the causally preceding span, absent for a root span.
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    /// Returns `true` if both trace id and span id are non-zero.
    pub fn is_valid(&self) -> bool {
        self.trace_id != TraceId::INVALID && self.span_id != SpanId::INVALID
    }
}

/// Single traced operation.
///
/// Handles are cheap to clone; all clones refer to the same span.
#[derive(Clone, Debug)]
pub struct Span {
    pub(crate) inner: Arc<SpanInner>,
}

#[derive(Debug)]
pub(crate) struct SpanInner {
    context: SpanContext,
    kind: SpanKind,
    name: Cow<'static, str>,
    start_time: SystemTime,
    started: Instant,
    /// Instant after which the pending-span reaper may force-finalize.
    pub(crate) deadline: Instant,
    core: Arc<TracerCore>,
    state: Mutex<Option<SpanState>>,
}

#[derive(Debug, Default)]
struct SpanState {
    data: Map<String, Value>,
    error_count: u32,
    batch: Option<Batch>,
    sub_operations: Vec<String>,
    stack_trace: Vec<String>,
    manual_end: bool,
}

impl Span {
    pub(crate) fn new(
        context: SpanContext,
        kind: SpanKind,
        name: Cow<'static, str>,
        stack_trace: Vec<String>,
        deadline: Instant,
        core: Arc<TracerCore>,
    ) -> Self {
        Span {
            inner: Arc::new(SpanInner {
                context,
                kind,
                name,
                start_time: SystemTime::now(),
                started: Instant::now(),
                deadline,
                core,
                state: Mutex::new(Some(SpanState {
                    stack_trace,
                    ..SpanState::default()
                })),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SpanInner>) -> Self {
        Span { inner }
    }

    /// The span's identity.
    pub fn context(&self) -> &SpanContext {
        &self.inner.context
    }

    /// The span's causal role.
    pub fn kind(&self) -> SpanKind {
        self.inner.kind
    }

    /// The instrumented operation's logical name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Wall-clock creation time.
    pub fn start_time(&self) -> SystemTime {
        self.inner.start_time
    }

    /// Returns `true` while the span is still recording, i.e. has not been
    /// finalized or cancelled.
    pub fn is_recording(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Operate on the mutable state, if the span is still recording.
    fn with_state<T>(&self, f: impl FnOnce(&mut SpanState) -> T) -> Option<T> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().map(f))
    }

    /// Sets a section of the instrumentation-specific payload.
    ///
    /// Sections written after the span was finalized are discarded.
    pub fn set_data(&self, section: &str, value: Value) {
        self.with_state(|state| {
            state.data.insert(section.to_owned(), value);
        });
    }

    /// Records one failed operation, with a human-readable detail.
    pub fn record_error(&self, detail: impl Into<String>) {
        self.with_state(|state| {
            state.error_count = state.error_count.saturating_add(1);
            state.data.insert("error".to_owned(), detail.into().into());
        });
    }

    /// Marks this span as standing in for a group of `size` sub-operations.
    pub fn set_batch_size(&self, size: usize) {
        self.with_state(|state| state.batch = Some(Batch { size }));
    }

    /// Returns `true` if this span has been marked as a batch span.
    pub fn is_batch(&self) -> bool {
        self.with_state(|state| state.batch.is_some())
            .unwrap_or(false)
    }

    /// Contributes the name of one sub-operation to a batch span.
    pub fn record_sub_operation(&self, name: impl Into<String>) {
        self.with_state(|state| state.sub_operations.push(name.into()));
    }

    /// Number of sub-operations contributed so far.
    pub fn sub_operation_count(&self) -> usize {
        self.with_state(|state| state.sub_operations.len())
            .unwrap_or(0)
    }

    /// Records the outcome of a completed batch: the number of
    /// sub-operations that individually failed, plus a consolidated detail
    /// when any did.
    pub fn record_batch_outcome(&self, failed: usize, detail: Option<String>) {
        self.with_state(|state| {
            state.error_count = failed as u32;
            if failed > 0 {
                if let Some(detail) = detail {
                    state.data.insert("error".to_owned(), detail.into());
                }
            }
        });
    }

    /// Takes the span out of automatic finalize mode.
    ///
    /// After this call [`Span::end`] becomes a no-op and only
    /// [`Span::end_manual`] finalizes the span. Instrumentations use this
    /// when lifecycle control is handed to user code.
    pub fn disable_auto_end(&self) {
        self.with_state(|state| state.manual_end = true);
    }

    /// Finalizes the span and hands it to the processors.
    ///
    /// Computes the duration, fixes the error state and transmits. Does
    /// nothing if the span was already finalized or cancelled, or if it is
    /// in manual end mode.
    pub fn end(&self) {
        self.finalize(false);
    }

    /// Finalizes a span that is in manual end mode.
    pub fn end_manual(&self) {
        self.finalize(true);
    }

    /// Discards the span without transmitting it.
    ///
    /// Used when a call site determines in hindsight that no span should
    /// have been opened.
    pub fn cancel(&self) {
        let taken = self.inner.state.lock().ok().and_then(|mut g| g.take());
        if taken.is_some() {
            metrics::record_closed();
        }
    }

    /// Current error count, or `None` once the span stopped recording.
    pub fn error_count(&self) -> Option<u32> {
        self.with_state(|state| state.error_count)
    }

    fn finalize(&self, manual: bool) {
        let state = {
            let mut guard = match self.inner.state.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let held_open = matches!(guard.as_ref(), Some(state) if state.manual_end && !manual);
            if held_open {
                return;
            }
            guard.take()
        };
        if let Some(state) = state {
            self.transmit(state);
        }
    }

    /// Force-finalizes a span whose completion never arrived.
    ///
    /// Called by the pending-span reaper once the deadline has passed. The
    /// span is marked with a timeout-class error and transmitted; manual
    /// end mode does not exempt a span from reaping.
    pub(crate) fn finalize_timed_out(&self) {
        let state = self.inner.state.lock().ok().and_then(|mut g| g.take());
        if let Some(mut state) = state {
            state.error_count = state.error_count.saturating_add(1);
            state.data.insert(
                "error".to_owned(),
                "span was not finalized within the pending span timeout".into(),
            );
            state
                .data
                .insert("timeout".to_owned(), Value::Bool(true));
            self.transmit(state);
        }
    }

    fn transmit(&self, state: SpanState) {
        let data = SpanData {
            context: self.inner.context.clone(),
            kind: self.inner.kind,
            name: self.inner.name.clone(),
            start_time: self.inner.start_time,
            duration: self.inner.started.elapsed(),
            error_count: state.error_count,
            batch: state.batch,
            sub_operations: state.sub_operations,
            data: state.data,
            stack_trace: state.stack_trace,
        };
        metrics::record_closed();
        self.inner.core.on_span_end(data);
    }
}
