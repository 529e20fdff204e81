//! Implements the tracewire auto-instrumentation tracing engine.
//!
//! The engine observes a program's calls into instrumented libraries and
//! reconstructs causally-linked spans describing each operation, batched
//! and handed off to a span exporter. It is built from:
//!
//! * [`hook`]: module-load interception and safe method patching.
//!   Instrumentations register transformers that run once against a
//!   module's exported surface; the [`hook::wrap()`] utility decorates
//!   individual operations so that a bug in instrumentation code can never
//!   crash host code or change its results.
//! * [`trace`]: the span lifecycle, [`trace::Tracer`] and
//!   [`trace::TracerProvider`], the per-call [`trace::decision`] rules,
//!   batch/aggregate spans, span processors, the pending-span reaper and
//!   the [`trace::SpanExporter`] transport boundary.
//! * [`propagation`]: the correlation header propagator linking traces
//!   across process boundaries and carrying the suppression signal.
//!
//! Context propagation itself, the mechanism that keeps the currently
//! active span correct across asynchronous continuations, lives in the
//! [`tracewire`] API crate.
//!
//! # Getting started
//!
//! ```
//! use tracewire::Context;
//! use tracewire::trace::SpanKind;
//! use tracewire_sdk::trace::{InMemorySpanExporter, TracerProvider};
//!
//! let exporter = InMemorySpanExporter::default();
//! let provider = TracerProvider::builder()
//!     .with_simple_exporter(exporter.clone())
//!     .build();
//! let tracer = provider.tracer();
//!
//! // an inbound trigger opens an entry span and activates it
//! let (span, cx) = tracer.start_active_span("inbound", SpanKind::Entry, &Context::current());
//! {
//!     let _guard = cx.attach();
//!     // instrumented work runs here; exits parent onto the entry span
//! }
//! span.end();
//!
//! assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unused
)]
#![cfg_attr(test, deny(warnings))]

pub mod hook;
pub mod propagation;
pub mod trace;
