//! Per-call tracing decisions.
//!
//! Every instrumented call site asks, at invocation time, whether a span
//! may legally be opened given the instrumentation's enabled flag, the
//! ambient context and any per-call overrides. The answer is computed fresh
//! on every call: the ambient context can differ between two calls to the
//! same instrumented method, and the enabled flag can be flipped at
//! runtime.

use crate::trace::context::SpanContextExt;
use crate::trace::span::Span;
use tracewire::trace::SpanKind;
use tracewire::Context;

/// Per-call-site adjustments to the exit-tracing rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct Overrides {
    /// Skip the parent-span rules entirely; the call site inspects the
    /// parent itself (grouped operations contributing sub-operations to a
    /// batch span do this).
    pub skip_parent_check: bool,
    /// Per-call override of the context-inherited root-exit permission.
    /// `Some` wins over the inherited flag in both directions.
    pub allow_root_exit: Option<bool>,
}

/// Outcome of evaluating the exit-tracing rules at one call site.
#[derive(Clone, Debug)]
pub struct ExitDecision {
    /// When `true`, pass through untraced.
    pub skip: bool,
    /// The ambient parent span, whatever the decision was. Call sites that
    /// set [`Overrides::skip_parent_check`] use this for their own checks.
    pub parent: Option<Span>,
    /// The effective root-exit permission after override resolution.
    pub allow_root_exit: bool,
}

/// Decides whether an exit span may be opened at this call site.
///
/// The rules, in order: an inactive instrumentation never traces; a
/// suppressed chain never traces; without a parent span an exit may only be
/// opened when root exits are permitted; an exit may not be nested directly
/// under another exit (grouped operations bypass this via
/// [`Overrides::skip_parent_check`] and their own parent inspection).
pub fn exit_span(is_active: bool, cx: &Context, overrides: Overrides) -> ExitDecision {
    let allow_root_exit = overrides
        .allow_root_exit
        .unwrap_or_else(|| cx.is_root_exit_allowed());
    let parent = cx.span();

    let skip = if !is_active || cx.is_suppressed() {
        true
    } else if overrides.skip_parent_check {
        false
    } else {
        match &parent {
            None => !allow_root_exit,
            Some(parent) => parent.kind() == SpanKind::Exit,
        }
    };

    ExitDecision {
        skip,
        parent,
        allow_root_exit,
    }
}

/// Decides whether an entry span may be opened for an inbound trigger.
pub fn entry_span(is_active: bool, cx: &Context) -> bool {
    is_active && !cx.is_suppressed()
}
