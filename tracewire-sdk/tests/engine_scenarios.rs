//! End-to-end engine tests: a simulated host library is loaded through the
//! hook registry, patched by an instrumentation, and driven like host code
//! would drive it.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracewire::propagation::TextMapPropagator;
use tracewire::trace::SpanKind;
use tracewire::Context;
use tracewire_sdk::hook::{wrap, Exports, Hooks, InstrumentationHandle};
use tracewire_sdk::propagation::{CorrelationPropagator, TRACE_LEVEL_HEADER};
use tracewire_sdk::trace::decision::{self, Overrides};
use tracewire_sdk::trace::{
    Config, InMemorySpanExporter, SpanContextExt, Tracer, TracerProvider,
};

type KvResult = Result<String, String>;

const KVSTORE: &str = "kvstore";

/// Builds the simulated host library: a key/value client whose `exec`
/// operation fans out into `get` sub-operations, the way a pipelined client
/// dispatches a group of commands.
fn kvstore_module(hooks: &Arc<Hooks>) -> Arc<Exports> {
    let hooks_for_exec = hooks.clone();
    hooks.load_with(KVSTORE, move || {
        let exports = Exports::new(KVSTORE);
        exports.provide(KVSTORE_GET, |key: String| -> KvResult {
            if key.starts_with("bad") {
                Err(format!("no such key: {key}"))
            } else {
                Ok(format!("value of {key}"))
            }
        });
        exports.provide(KVSTORE_EXEC, move |keys: Vec<String>| -> Vec<KvResult> {
            let module = hooks_for_exec.load(KVSTORE).expect("kvstore is loaded");
            keys.into_iter()
                .map(|key| {
                    module
                        .call::<String, KvResult>(KVSTORE_GET, key)
                        .expect("get is registered")
                })
                .collect()
        });
        exports
    })
}

const KVSTORE_GET: &str = "get";
const KVSTORE_EXEC: &str = "exec";

/// Installs the kvstore instrumentation: `get` is traced as a plain exit
/// span unless it runs inside a kvstore batch, in which case it only
/// contributes its key to the batch span; `exec` opens the batch span and
/// forks a child context for the sub-dispatches.
fn install_kvstore_instrumentation(hooks: &Arc<Hooks>, tracer: Tracer) -> InstrumentationHandle {
    let handle = hooks.instrumentation(KVSTORE);

    let activation = handle.clone();
    let get_tracer = tracer.clone();
    let exec_tracer = tracer;
    let exec_activation = handle.clone();

    hooks.on_module_load(KVSTORE, move |exports| {
        let activation = activation.clone();
        let tracer = get_tracer.clone();
        wrap::<String, KvResult, _>(exports, KVSTORE_GET, move |original, key| {
            let cx = Context::current();
            let decision = decision::exit_span(
                activation.is_active(),
                &cx,
                Overrides {
                    skip_parent_check: true,
                    ..Overrides::default()
                },
            );
            if decision.skip {
                let _ = original.call(key);
                return;
            }

            // Inside a kvstore batch, contribute the key instead of
            // opening a sibling span.
            if let Some(parent) = decision
                .parent
                .as_ref()
                .filter(|parent| parent.name() == KVSTORE && parent.is_batch())
            {
                parent.record_sub_operation(key.clone());
                let _ = original.call(key);
                return;
            }

            // Outside a batch, exits need a causal ancestor that is not
            // itself an exit.
            let nested_under_exit = decision
                .parent
                .as_ref()
                .map(|parent| parent.kind() == SpanKind::Exit)
                .unwrap_or(false);
            if nested_under_exit || (decision.parent.is_none() && !decision.allow_root_exit) {
                let _ = original.call(key);
                return;
            }

            let (span, span_cx) = tracer.start_active_span(KVSTORE, SpanKind::Exit, &cx);
            span.set_data(KVSTORE, json!({ "command": "get", "key": key.clone() }));
            let _guard = span_cx.attach();
            let delivered = original.call(key);
            if let Some(Err(err)) = delivered.inspect(|result| result.clone()) {
                span.record_error(err);
            }
            span.end();
        })
        .expect("get exists");

        let activation = exec_activation.clone();
        let tracer = exec_tracer.clone();
        wrap::<Vec<String>, Vec<KvResult>, _>(exports, KVSTORE_EXEC, move |original, keys| {
            let cx = Context::current();
            let decision = decision::exit_span(
                activation.is_active(),
                &cx,
                Overrides {
                    skip_parent_check: true,
                    ..Overrides::default()
                },
            );
            let nested_under_exit = decision
                .parent
                .as_ref()
                .map(|parent| parent.kind() == SpanKind::Exit)
                .unwrap_or(false);
            if decision.skip
                || nested_under_exit
                || (decision.parent.is_none() && !decision.allow_root_exit)
            {
                let _ = original.call(keys);
                return;
            }

            // One exit span for the whole group, activated inside a forked
            // child context so the sub-dispatches attach to it instead of
            // each other.
            let span = tracer.start_span(KVSTORE, SpanKind::Exit, &cx);
            span.set_data(KVSTORE, json!({ "command": "exec" }));
            span.set_batch_size(keys.len());
            let batch_cx = cx.child().with_span(span.clone());
            let _guard = batch_cx.attach();

            let delivered = original.call(keys);
            let failed = delivered
                .inspect(|results| results.iter().filter(|result| result.is_err()).count())
                .unwrap_or(0);
            let detail = delivered.inspect(|results| {
                results
                    .iter()
                    .filter_map(|result| result.as_ref().err().cloned())
                    .collect::<Vec<_>>()
                    .join("; ")
            });
            span.record_batch_outcome(failed, detail.filter(|detail| !detail.is_empty()));
            span.end();
        })
        .expect("exec exists");
    });

    handle
}

struct TestEngine {
    hooks: Arc<Hooks>,
    provider: TracerProvider,
    exporter: InMemorySpanExporter,
    module: Arc<Exports>,
}

fn engine() -> TestEngine {
    let exporter = InMemorySpanExporter::default();
    let provider = TracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();

    let hooks = Arc::new(Hooks::new());
    let handle = install_kvstore_instrumentation(&hooks, provider.tracer());
    handle.activate();
    let module = kvstore_module(&hooks);

    TestEngine {
        hooks,
        provider,
        exporter,
        module,
    }
}

/// Simulates serving one inbound request: extract correlation state from
/// the headers, open an entry span if permitted, run `f`, finalize.
fn serve_request(
    engine: &TestEngine,
    headers: &HashMap<String, String>,
    f: impl FnOnce(&Arc<Exports>),
) -> HashMap<String, String> {
    let propagator = CorrelationPropagator::new();
    let cx = propagator.extract_with_context(&Context::current(), headers);

    let mut outbound = HashMap::new();
    if decision::entry_span(true, &cx) {
        let tracer = engine.provider.tracer();
        let (entry, cx) = tracer.start_active_span("http-server", SpanKind::Entry, &cx);
        {
            let _guard = cx.attach();
            f(&engine.module);
            // outbound headers as an exit call of this chain would send them
            let exit_cx = Context::current();
            propagator.inject_context(&exit_cx, &mut outbound);
        }
        entry.end();
    } else {
        let _guard = cx.attach();
        f(&engine.module);
        propagator.inject_context(&Context::current(), &mut outbound);
    }
    outbound
}

#[test]
fn scenario_entry_with_nested_exit() {
    let engine = engine();

    serve_request(&engine, &HashMap::new(), |module| {
        let result = module
            .call::<String, KvResult>(KVSTORE_GET, "answer".into())
            .unwrap();
        assert_eq!(result.unwrap(), "value of answer");
    });

    let spans = engine.exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2);

    let exit = spans.iter().find(|span| span.kind == SpanKind::Exit).unwrap();
    let entry = spans.iter().find(|span| span.kind == SpanKind::Entry).unwrap();

    assert_eq!(entry.context.parent_span_id(), None);
    assert_eq!(entry.name, "http-server");
    assert_eq!(exit.name, "kvstore");
    assert_eq!(
        exit.context.parent_span_id(),
        Some(entry.context.span_id())
    );
    assert_eq!(exit.context.trace_id(), entry.context.trace_id());
    assert_eq!(exit.error_count, 0);
    assert_eq!(exit.data[KVSTORE]["key"], "answer");
}

#[test]
fn scenario_suppressed_chain_produces_no_spans() {
    let engine = engine();

    let mut headers = HashMap::new();
    headers.insert(TRACE_LEVEL_HEADER.to_string(), "0".to_string());

    serve_request(&engine, &headers, |module| {
        // the dependency call still executes and returns normally
        let result = module
            .call::<String, KvResult>(KVSTORE_GET, "answer".into())
            .unwrap();
        assert_eq!(result.unwrap(), "value of answer");
    });

    assert!(engine.exporter.get_finished_spans().unwrap().is_empty());
}

#[test]
fn scenario_suppression_is_propagated_downstream() {
    let engine = engine();

    let mut headers = HashMap::new();
    headers.insert(TRACE_LEVEL_HEADER.to_string(), "0".to_string());

    let outbound = serve_request(&engine, &headers, |_| {});
    assert_eq!(outbound.get(TRACE_LEVEL_HEADER).map(String::as_str), Some("0"));
}

#[test]
fn scenario_batch_span_aggregates_failures() {
    let engine = engine();

    serve_request(&engine, &HashMap::new(), |module| {
        let results = module
            .call::<Vec<String>, Vec<KvResult>>(
                KVSTORE_EXEC,
                vec!["alpha".into(), "bad-key".into(), "gamma".into()],
            )
            .unwrap();
        assert_eq!(results.iter().filter(|result| result.is_err()).count(), 1);
    });

    let spans = engine.exporter.get_finished_spans().unwrap();
    // one entry, one batch exit; the three sub-operations open no spans
    assert_eq!(spans.len(), 2);

    let batch = spans.iter().find(|span| span.kind == SpanKind::Exit).unwrap();
    assert_eq!(batch.batch.as_ref().unwrap().size, 3);
    assert_eq!(batch.error_count, 1);
    assert_eq!(batch.sub_operations, vec!["alpha", "bad-key", "gamma"]);
    assert!(batch.data["error"].as_str().unwrap().contains("bad-key"));
}

#[test]
fn scenario_broken_instrumentation_is_transparent() {
    let exporter = InMemorySpanExporter::default();
    let _provider = TracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();

    let hooks = Hooks::new();
    hooks.on_module_load("mailer", |exports| {
        wrap::<String, String, _>(exports, "send", |_original, _args| {
            panic!("bug in instrumentation code");
        })
        .expect("send exists");
    });

    let module = hooks.load_with("mailer", || {
        let exports = Exports::new("mailer");
        exports.provide("send", |to: String| format!("sent to {to}"));
        exports
    });

    // the host call is delivered unchanged despite the wrapper fault
    let result = module
        .call::<String, String>("send", "ops@example.com".into())
        .unwrap();
    assert_eq!(result, "sent to ops@example.com");
    assert!(exporter.get_finished_spans().unwrap().is_empty());
}

#[test]
fn scenario_abandoned_span_is_reaped_once() {
    let exporter = InMemorySpanExporter::default();
    let provider = TracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .with_config(Config {
            pending_span_timeout: Duration::from_millis(100),
            ..Config::default()
        })
        .build();
    let tracer = provider.tracer();

    let span = tracer.start_span("kvstore", SpanKind::Exit, &Context::current());
    // the completion never arrives; the span handle stays alive as it
    // would inside a pending callback
    std::thread::sleep(Duration::from_millis(400));

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1, "reaped exactly once");
    assert_eq!(spans[0].error_count, 1);
    assert_eq!(spans[0].data["timeout"], true);

    // finalizing after the fact must not transmit again
    span.end();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
}

#[test]
fn exit_without_ancestor_is_not_traced() {
    let engine = engine();

    // no inbound request, no ambient context
    let result = engine
        .module
        .call::<String, KvResult>(KVSTORE_GET, "answer".into())
        .unwrap();
    assert_eq!(result.unwrap(), "value of answer");
    assert!(engine.exporter.get_finished_spans().unwrap().is_empty());
}

#[test]
fn root_exit_permission_allows_standalone_exit() {
    let engine = engine();

    let cx = Context::current().with_root_exit_allowed();
    let _guard = cx.attach();
    engine
        .module
        .call::<String, KvResult>(KVSTORE_GET, "answer".into())
        .unwrap()
        .unwrap();

    let spans = engine.exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].kind, SpanKind::Exit);
    assert_eq!(spans[0].context.parent_span_id(), None);
}

#[test]
fn deactivated_instrumentation_is_observed_per_call() {
    let engine = engine();
    let handle = engine.hooks.instrumentation(KVSTORE);

    serve_request(&engine, &HashMap::new(), |module| {
        module
            .call::<String, KvResult>(KVSTORE_GET, "one".into())
            .unwrap()
            .unwrap();

        // flipped mid-chain; the next call must observe it
        handle.deactivate();
        module
            .call::<String, KvResult>(KVSTORE_GET, "two".into())
            .unwrap()
            .unwrap();

        handle.activate();
        module
            .call::<String, KvResult>(KVSTORE_GET, "three".into())
            .unwrap()
            .unwrap();
    });

    let spans = engine.exporter.get_finished_spans().unwrap();
    let exits: Vec<_> = spans.iter().filter(|span| span.kind == SpanKind::Exit).collect();
    assert_eq!(exits.len(), 2);
    let keys: Vec<_> = exits.iter().map(|span| span.data[KVSTORE]["key"].clone()).collect();
    assert!(keys.contains(&json!("one")));
    assert!(keys.contains(&json!("three")));
}

#[test]
fn failed_dependency_call_is_recorded_and_propagated() {
    let engine = engine();

    serve_request(&engine, &HashMap::new(), |module| {
        let result = module
            .call::<String, KvResult>(KVSTORE_GET, "bad-key".into())
            .unwrap();
        // the host sees the failure exactly as without tracing
        assert_eq!(result.unwrap_err(), "no such key: bad-key");
    });

    let spans = engine.exporter.get_finished_spans().unwrap();
    let exit = spans.iter().find(|span| span.kind == SpanKind::Exit).unwrap();
    assert_eq!(exit.error_count, 1);
    assert_eq!(exit.data["error"], "no such key: bad-key");
}
