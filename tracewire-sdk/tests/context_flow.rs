//! Context propagation properties: isolation between interleaved call
//! chains, causal ordering independent of completion order, and trace-id
//! integrity across simulated process boundaries.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracewire::propagation::TextMapPropagator;
use tracewire::trace::{SpanKind, TraceId};
use tracewire::{Context, FutureContextExt};
use tracewire_sdk::propagation::CorrelationPropagator;
use tracewire_sdk::trace::{current_span, InMemorySpanExporter, TracerProvider};

fn test_provider() -> (TracerProvider, InMemorySpanExporter) {
    let exporter = InMemorySpanExporter::default();
    let provider = TracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();
    (provider, exporter)
}

/// A deferred-continuation queue standing in for the host's timer and I/O
/// completion machinery: continuations are enqueued now and run later, in
/// whatever order, interleaved with unrelated work.
type EventQueue = VecDeque<Box<dyn FnOnce()>>;

#[test]
fn bound_continuations_observe_their_own_chain() {
    let (provider, exporter) = test_provider();
    let tracer = provider.tracer();
    let mut queue: EventQueue = VecDeque::new();

    // Two interleaved inbound chains, each deferring its completion.
    for name in ["chain-one", "chain-two"] {
        let (entry, cx) = tracer.start_active_span(name, SpanKind::Entry, &Context::current());
        let _guard = cx.attach();

        let expected_span_id = entry.context().span_id();
        let continuation = Context::current().bind(move |_: ()| {
            // exactly the span active at bind time, however long ago
            let active = current_span().expect("span restored from bound context");
            assert_eq!(active.context().span_id(), expected_span_id);
            active.end();
        });
        queue.push_back(Box::new(move || continuation(())));
    }

    // no ambient context is left over outside the chains
    assert!(current_span().is_none());

    // unrelated work runs in between
    queue.push_back(Box::new(|| {
        assert!(current_span().is_none());
    }));

    // drain in reverse order to stress completion-order independence
    while let Some(event) = queue.pop_back() {
        event();
    }

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2);
    let names: Vec<_> = spans.iter().map(|span| span.name.clone()).collect();
    assert!(names.contains(&"chain-one".into()));
    assert!(names.contains(&"chain-two".into()));
}

#[test]
fn child_span_outlives_its_parent_finalize() {
    let (provider, exporter) = test_provider();
    let tracer = provider.tracer();

    let (entry, entry_cx) = tracer.start_active_span("inbound", SpanKind::Entry, &Context::current());
    let exit = {
        let _guard = entry_cx.attach();
        tracer.start_span("outbound", SpanKind::Exit, &Context::current())
    };

    // the entry finalizes before its child exit does
    entry.end();
    exit.record_error("dependency unreachable");
    exit.end();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2);
    // causal linkage reflects invocation order, not completion order
    assert_eq!(spans[0].name, "inbound");
    assert_eq!(
        spans[1].context.parent_span_id(),
        Some(spans[0].context.span_id())
    );
    assert_eq!(spans[1].error_count, 1);
}

#[test]
fn trace_id_survives_chained_hops() {
    let (provider, exporter) = test_provider();
    let tracer = provider.tracer();
    let propagator = CorrelationPropagator::new();

    const HOPS: usize = 5;

    // Hop 0 starts the trace.
    let mut headers: HashMap<String, String> = HashMap::new();
    let (root, root_cx) = tracer.start_active_span("service-0", SpanKind::Entry, &Context::new());
    let origin_trace_id = root.context().trace_id();
    {
        let _guard = root_cx.attach();
        let (exit, exit_cx) =
            tracer.start_active_span("call-1", SpanKind::Exit, &Context::current());
        propagator.inject_context(&exit_cx, &mut headers);
        exit.end();
    }
    root.end();

    // Each subsequent hop simulates a separate process: extract, serve,
    // call the next one.
    for hop in 1..=HOPS {
        let inbound = propagator.extract_with_context(&Context::new(), &headers);
        let (entry, entry_cx) = tracer.start_active_span("service", SpanKind::Entry, &inbound);
        assert_eq!(
            entry.context().trace_id(),
            origin_trace_id,
            "trace id diverged at hop {hop}"
        );

        headers = HashMap::new();
        {
            let _guard = entry_cx.attach();
            let (exit, exit_cx) =
                tracer.start_active_span("call-next", SpanKind::Exit, &Context::current());
            propagator.inject_context(&exit_cx, &mut headers);
            exit.end();
        }
        entry.end();
    }

    // bit-identical at hop M as at hop 0
    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2 * (HOPS + 1));
    for span in &spans {
        assert_eq!(span.context.trace_id(), origin_trace_id);
    }
    assert_ne!(origin_trace_id, TraceId::INVALID);

    // and each entry is parented onto the previous hop's exit
    let entries: Vec<_> = spans
        .iter()
        .filter(|span| span.kind == SpanKind::Entry && span.name == "service")
        .collect();
    assert_eq!(entries.len(), HOPS);
    for entry in entries {
        assert!(entry.context.parent_span_id().is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_do_not_share_ambient_context() {
    let (provider, _exporter) = test_provider();
    let tracer = provider.tracer();

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let tracer = tracer.clone();
        handles.push(tokio::spawn(async move {
            let (span, cx) =
                tracer.start_active_span("task", SpanKind::Entry, &Context::new());
            let my_span_id = span.context().span_id();

            async move {
                for _ in 0..4 {
                    let active = current_span().expect("own span visible");
                    assert_eq!(active.context().span_id(), my_span_id);
                    tokio::time::sleep(Duration::from_millis(2 + i % 3)).await;
                }
                current_span().unwrap().end();
            }
            .with_context(cx)
            .await;
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(current_span().is_none());
}
