//! # Tracer provider
//!
//! The [`TracerProvider`] owns everything with process lifetime: the span
//! processors, the id generator, the engine configuration and the
//! pending-span reaper thread. Tracers handed out by a provider share that
//! state; dropping the last handle (or calling [`TracerProvider::shutdown`])
//! stops the reaper and shuts the processors down.

use crate::trace::config::Config;
use crate::trace::export::{SpanData, SpanExporter};
use crate::trace::id_generator::{IdGenerator, RandomIdGenerator};
use crate::trace::pending::{spawn_reaper, PendingSpans};
use crate::trace::span_processor::{
    BatchSpanProcessor, SimpleSpanProcessor, SpanProcessor,
};
use crate::trace::tracer::Tracer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracewire::trace::{TraceError, TraceResult};
use tracewire::tw_debug;

/// Shared engine state behind every tracer and span of one provider.
pub(crate) struct TracerCore {
    processors: Vec<Box<dyn SpanProcessor>>,
    config: Config,
    id_generator: Box<dyn IdGenerator>,
    pending: Arc<PendingSpans>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl std::fmt::Debug for TracerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerCore")
            .field("processors", &self.processors.len())
            .field("config", &self.config)
            .finish()
    }
}

impl TracerCore {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn id_generator(&self) -> &dyn IdGenerator {
        self.id_generator.as_ref()
    }

    pub(crate) fn pending(&self) -> &PendingSpans {
        &self.pending
    }

    pub(crate) fn on_span_start(&self, span: &crate::trace::span::Span, cx: &tracewire::Context) {
        for processor in &self.processors {
            processor.on_start(span, cx);
        }
    }

    /// Fans a finished span out to the processors. A transport fault is the
    /// processor's to log; it never reaches the producing call chain.
    pub(crate) fn on_span_end(&self, data: SpanData) {
        if self.processors.len() == 1 {
            self.processors[0].on_end(data);
            return;
        }
        for processor in &self.processors {
            processor.on_end(data.clone());
        }
    }
}

impl Drop for TracerCore {
    fn drop(&mut self) {
        // Signal the reaper; joining is only done in an explicit shutdown,
        // since the last reference can be dropped from the reaper thread
        // itself.
        self.pending.stop();
        if !self.is_shutdown.swap(true, Ordering::Relaxed) {
            for processor in &self.processors {
                if let Err(err) = processor.shutdown() {
                    tw_debug!(
                        name: "TracerProvider.Drop.ShutdownError",
                        reason = format!("{err:?}")
                    );
                }
            }
        }
    }
}

/// Creates and manages tracers, and owns the span pipeline.
#[derive(Clone, Debug)]
pub struct TracerProvider {
    core: Arc<TracerCore>,
}

impl TracerProvider {
    /// Create a builder for a new provider.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Returns a tracer backed by this provider.
    pub fn tracer(&self) -> Tracer {
        Tracer::new(self.core.clone())
    }

    /// Force all registered processors to flush, collecting each result.
    pub fn force_flush(&self) -> Vec<TraceResult<()>> {
        self.core
            .processors
            .iter()
            .map(|processor| processor.force_flush())
            .collect()
    }

    /// Shuts down the provider: stops the pending-span reaper and shuts
    /// down every processor. Subsequent calls return an error.
    pub fn shutdown(&self) -> TraceResult<()> {
        if self.core.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        self.core.pending.stop();
        if let Some(handle) = self.core.reaper.lock().ok().and_then(|mut h| h.take()) {
            let _ = handle.join();
        }
        let mut result = Ok(());
        for processor in &self.core.processors {
            if let Err(err) = processor.shutdown() {
                result = Err(err);
            }
        }
        result
    }
}

/// Builder for [`TracerProvider`].
#[derive(Debug, Default)]
pub struct Builder {
    processors: Vec<Box<dyn SpanProcessor>>,
    config: Option<Config>,
    id_generator: Option<Box<dyn IdGenerator>>,
}

impl Builder {
    /// The [`SpanExporter`] this provider should export to with a
    /// [`SimpleSpanProcessor`].
    pub fn with_simple_exporter<E: SpanExporter + 'static>(mut self, exporter: E) -> Self {
        self.processors
            .push(Box::new(SimpleSpanProcessor::new(Box::new(exporter))));
        self
    }

    /// The [`SpanExporter`] this provider should export to with a
    /// [`BatchSpanProcessor`].
    pub fn with_batch_exporter<E: SpanExporter + 'static>(mut self, exporter: E) -> Self {
        self.processors
            .push(Box::new(BatchSpanProcessor::builder(exporter).build()));
        self
    }

    /// Add an already-built [`SpanProcessor`].
    pub fn with_span_processor<P: SpanProcessor + 'static>(mut self, processor: P) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// The [`Config`] this provider should use.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// The [`IdGenerator`] this provider should use.
    pub fn with_id_generator<G: IdGenerator + 'static>(mut self, id_generator: G) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Build the provider and start its pending-span reaper.
    pub fn build(self) -> TracerProvider {
        let config = self.config.unwrap_or_default();
        let pending = Arc::new(PendingSpans::default());
        let reaper = spawn_reaper(pending.clone(), config.pending_span_timeout);

        TracerProvider {
            core: Arc::new(TracerCore {
                processors: self.processors,
                config,
                id_generator: self
                    .id_generator
                    .unwrap_or_else(|| Box::new(RandomIdGenerator::default())),
                pending,
                reaper: Mutex::new(Some(reaper)),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::in_memory_exporter::InMemorySpanExporter;
    use tracewire::trace::SpanKind;
    use tracewire::Context;

    #[test]
    fn shutdown_twice_errors() {
        let provider = TracerProvider::builder()
            .with_simple_exporter(InMemorySpanExporter::default())
            .build();
        provider.shutdown().unwrap();
        assert!(provider.shutdown().is_err());
    }

    #[test]
    fn spans_survive_provider_clone_drop() {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();

        let tracer = provider.tracer();
        drop(provider.clone());

        let span = tracer.start_span("work", SpanKind::Entry, &Context::current());
        span.end();
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
    }
}
