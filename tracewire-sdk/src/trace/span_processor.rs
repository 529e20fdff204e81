//! # Span processors
//!
//! A span processor receives finished spans and hands them to the
//! configured [`SpanExporter`]. Processors are registered on the
//! [`TracerProvider`] and invoked in registration order.
//!
//! Two implementations are provided: [`SimpleSpanProcessor`] exports every
//! span as soon as it is finished (useful for tests and debugging), and
//! [`BatchSpanProcessor`] queues spans into a dedicated background thread
//! and exports them in batches. Either way the handoff from the call chain
//! that produced the span never blocks: the batch processor uses a bounded
//! channel and sheds load by dropping spans (counted, logged once) when the
//! queue is full.
//!
//! [`TracerProvider`]: crate::trace::TracerProvider

use crate::trace::export::{SpanData, SpanExporter};
use crate::trace::metrics;
use crate::trace::span::Span;
use futures_executor::block_on;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracewire::trace::{TraceError, TraceResult};
use tracewire::{tw_debug, tw_warn, Context};

/// Delay interval between two consecutive batch exports.
pub(crate) const TRACEWIRE_BSP_SCHEDULE_DELAY: &str = "TRACEWIRE_BSP_SCHEDULE_DELAY";
/// Default delay interval between two consecutive batch exports.
pub(crate) const BSP_SCHEDULE_DELAY_DEFAULT: u64 = 5_000;
/// Maximum queue size.
pub(crate) const TRACEWIRE_BSP_MAX_QUEUE_SIZE: &str = "TRACEWIRE_BSP_MAX_QUEUE_SIZE";
/// Default maximum queue size.
pub(crate) const BSP_MAX_QUEUE_SIZE_DEFAULT: usize = 2_048;
/// Maximum batch size, must be less than or equal to the maximum queue size.
pub(crate) const TRACEWIRE_BSP_MAX_EXPORT_BATCH_SIZE: &str = "TRACEWIRE_BSP_MAX_EXPORT_BATCH_SIZE";
/// Default maximum batch size.
pub(crate) const BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT: usize = 512;

/// `SpanProcessor` is an interface which allows hooks for span start and
/// end method invocations.
pub trait SpanProcessor: Send + Sync + std::fmt::Debug {
    /// `on_start` is called when a span is started. This method is called
    /// synchronously on the thread that started the span, therefore it
    /// should not block.
    fn on_start(&self, span: &Span, cx: &Context);
    /// `on_end` is called after a span is finalized (i.e. its duration has
    /// been computed). This method is called synchronously within the
    /// finalize call, therefore it should not block.
    fn on_end(&self, span: SpanData);
    /// Force the spans lying in the cache to be exported.
    fn force_flush(&self) -> TraceResult<()>;
    /// Shuts down the processor. Implementations must tolerate being called
    /// more than once.
    fn shutdown(&self) -> TraceResult<()>;
}

/// A [`SpanProcessor`] that passes finished spans to the exporter as soon
/// as they are finished, without batching.
#[derive(Debug)]
pub struct SimpleSpanProcessor {
    exporter: Mutex<Box<dyn SpanExporter>>,
}

impl SimpleSpanProcessor {
    /// Create a new [`SimpleSpanProcessor`] using the provided exporter.
    pub fn new(exporter: Box<dyn SpanExporter>) -> Self {
        Self {
            exporter: Mutex::new(exporter),
        }
    }
}

impl SpanProcessor for SimpleSpanProcessor {
    fn on_start(&self, _span: &Span, _cx: &Context) {
        // Ignored
    }

    fn on_end(&self, span: SpanData) {
        // The engine's own export must not feed back into tracing.
        let _suppress = Context::enter_suppressed_scope();
        let result = self
            .exporter
            .lock()
            .map_err(|_| TraceError::ExportFailed("SimpleSpanProcessor mutex poison".into()))
            .and_then(|mut exporter| block_on(exporter.export(vec![span])));

        if let Err(err) = result {
            metrics::record_dropped();
            tw_debug!(
                name: "SimpleSpanProcessor.OnEnd.Error",
                reason = format!("{err:?}")
            );
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        // Nothing buffered.
        Ok(())
    }

    fn shutdown(&self) -> TraceResult<()> {
        if let Ok(mut exporter) = self.exporter.lock() {
            exporter.shutdown();
            Ok(())
        } else {
            Err(TraceError::ExportFailed(
                "SimpleSpanProcessor mutex poison at shutdown".into(),
            ))
        }
    }
}

/// Messages exchanged between the producer side and the worker thread.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum BatchMessage {
    ExportSpan(SpanData),
    ForceFlush(SyncSender<TraceResult<()>>),
    Shutdown(SyncSender<TraceResult<()>>),
}

/// A batching [`SpanProcessor`] with a dedicated background thread.
#[derive(Debug)]
pub struct BatchSpanProcessor {
    message_sender: SyncSender<BatchMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    forceflush_timeout: Duration,
    shutdown_timeout: Duration,
    is_shutdown: AtomicBool,
    dropped_span_count: Arc<AtomicUsize>,
}

impl BatchSpanProcessor {
    /// Creates a new `BatchSpanProcessor` with a dedicated worker thread.
    pub fn new<E>(mut exporter: E, config: BatchConfig) -> Self
    where
        E: SpanExporter + 'static,
    {
        let (message_sender, message_receiver) = sync_channel(config.max_queue_size);

        let handle = thread::Builder::new()
            .name("TracewireBatchSpanProcessor".to_string())
            .spawn(move || {
                let _suppress = Context::enter_suppressed_scope();
                let mut spans = Vec::with_capacity(config.max_export_batch_size);
                let mut last_export_time = Instant::now();

                let export = |spans: Vec<SpanData>, exporter: &mut E| {
                    if spans.is_empty() {
                        return Ok(());
                    }
                    block_on(exporter.export(spans))
                };

                loop {
                    let timeout = config
                        .scheduled_delay
                        .saturating_sub(last_export_time.elapsed());
                    match message_receiver.recv_timeout(timeout) {
                        Ok(BatchMessage::ExportSpan(span)) => {
                            spans.push(span);
                            if spans.len() >= config.max_export_batch_size
                                || last_export_time.elapsed() >= config.scheduled_delay
                            {
                                if let Err(err) = export(spans.split_off(0), &mut exporter) {
                                    tw_debug!(
                                        name: "BatchSpanProcessor.Export.Error",
                                        reason = format!("{err:?}")
                                    );
                                }
                                last_export_time = Instant::now();
                            }
                        }
                        Ok(BatchMessage::ForceFlush(sender)) => {
                            let result = export(spans.split_off(0), &mut exporter);
                            let _ = sender.send(result);
                            last_export_time = Instant::now();
                        }
                        Ok(BatchMessage::Shutdown(sender)) => {
                            let result = export(spans.split_off(0), &mut exporter);
                            exporter.shutdown();
                            let _ = sender.send(result);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(err) = export(spans.split_off(0), &mut exporter) {
                                tw_debug!(
                                    name: "BatchSpanProcessor.Export.Error",
                                    reason = format!("{err:?}")
                                );
                            }
                            last_export_time = Instant::now();
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            // All senders gone; flush what is left and stop.
                            let _ = export(spans.split_off(0), &mut exporter);
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn batch span processor thread");

        Self {
            message_sender,
            handle: Mutex::new(Some(handle)),
            forceflush_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            is_shutdown: AtomicBool::new(false),
            dropped_span_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a builder to configure a `BatchSpanProcessor`.
    pub fn builder<E>(exporter: E) -> BatchSpanProcessorBuilder<E>
    where
        E: SpanExporter + 'static,
    {
        BatchSpanProcessorBuilder {
            exporter,
            config: BatchConfig::default(),
        }
    }
}

impl SpanProcessor for BatchSpanProcessor {
    fn on_start(&self, _span: &Span, _cx: &Context) {
        // Ignored
    }

    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        let result = self.message_sender.try_send(BatchMessage::ExportSpan(span));

        if result.is_err() {
            metrics::record_dropped();
            // Log the first drop only; the counter carries the total.
            if self.dropped_span_count.fetch_add(1, Ordering::Relaxed) == 0 {
                tw_warn!(
                    name: "BatchSpanProcessor.SpanDroppingStarted",
                    message = "Dropped a finished span because the export queue is full. \
                               Further drops will be counted but not logged."
                );
            }
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::ForceFlush(sender))
            .map_err(|_| TraceError::ExportFailed("failed to send ForceFlush message".into()))?;

        receiver
            .recv_timeout(self.forceflush_timeout)
            .map_err(|_| TraceError::ExportTimedOut(self.forceflush_timeout))?
    }

    fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        let dropped = self.dropped_span_count.load(Ordering::Relaxed);
        if dropped > 0 {
            tw_warn!(
                name: "BatchSpanProcessor.Shutdown.DroppedSpans",
                dropped_count = dropped
            );
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::Shutdown(sender))
            .map_err(|_| TraceError::ExportFailed("failed to send Shutdown message".into()))?;

        let result = receiver
            .recv_timeout(self.shutdown_timeout)
            .map_err(|_| TraceError::ExportTimedOut(self.shutdown_timeout))?;
        if let Some(handle) = self.handle.lock().ok().and_then(|mut h| h.take()) {
            let _ = handle.join();
        }
        result
    }
}

/// Builder for [`BatchSpanProcessor`].
#[derive(Debug)]
pub struct BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + 'static,
{
    exporter: E,
    config: BatchConfig,
}

impl<E> BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + 'static,
{
    /// Set the [`BatchConfig`] for this processor.
    pub fn with_batch_config(self, config: BatchConfig) -> Self {
        BatchSpanProcessorBuilder { config, ..self }
    }

    /// Build a new `BatchSpanProcessor`.
    pub fn build(self) -> BatchSpanProcessor {
        BatchSpanProcessor::new(self.exporter, self.config)
    }
}

/// Batch span processor configuration.
/// Use [`BatchConfigBuilder`] to configure your own instance.
#[derive(Debug)]
pub struct BatchConfig {
    /// The maximum queue size to buffer spans for delayed processing. Spans
    /// beyond this are dropped.
    pub(crate) max_queue_size: usize,

    /// The delay interval between two consecutive batch exports.
    pub(crate) scheduled_delay: Duration,

    /// The maximum number of spans to export in a single batch.
    pub(crate) max_export_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

/// A builder for creating [`BatchConfig`] instances.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
}

impl Default for BatchConfigBuilder {
    /// Create a new [`BatchConfigBuilder`] initialized with the default
    /// values, overridden by environment variables if set:
    /// * `TRACEWIRE_BSP_MAX_QUEUE_SIZE`
    /// * `TRACEWIRE_BSP_SCHEDULE_DELAY` (milliseconds)
    /// * `TRACEWIRE_BSP_MAX_EXPORT_BATCH_SIZE`
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: BSP_MAX_QUEUE_SIZE_DEFAULT,
            scheduled_delay: Duration::from_millis(BSP_SCHEDULE_DELAY_DEFAULT),
            max_export_batch_size: BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT,
        }
        .with_env()
    }
}

impl BatchConfigBuilder {
    /// Set the maximum queue size.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the delay interval between two consecutive batch exports.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Set the maximum export batch size.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Build a [`BatchConfig`]. The batch size is capped at the queue size.
    pub fn build(self) -> BatchConfig {
        BatchConfig {
            max_queue_size: self.max_queue_size,
            scheduled_delay: self.scheduled_delay,
            max_export_batch_size: self.max_export_batch_size.min(self.max_queue_size),
        }
    }

    fn with_env(mut self) -> Self {
        if let Some(value) = parse_env::<usize>(TRACEWIRE_BSP_MAX_QUEUE_SIZE) {
            self.max_queue_size = value;
        }
        if let Some(value) = parse_env::<u64>(TRACEWIRE_BSP_SCHEDULE_DELAY) {
            self.scheduled_delay = Duration::from_millis(value);
        }
        if let Some(value) = parse_env::<usize>(TRACEWIRE_BSP_MAX_EXPORT_BATCH_SIZE) {
            self.max_export_batch_size = value;
        }
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::in_memory_exporter::InMemorySpanExporter;

    #[test]
    fn batch_config_from_env() {
        temp_env::with_vars(
            [
                (TRACEWIRE_BSP_MAX_QUEUE_SIZE, Some("500")),
                (TRACEWIRE_BSP_SCHEDULE_DELAY, Some("1000")),
                (TRACEWIRE_BSP_MAX_EXPORT_BATCH_SIZE, Some("128")),
            ],
            || {
                let config = BatchConfig::default();
                assert_eq!(config.max_queue_size, 500);
                assert_eq!(config.scheduled_delay, Duration::from_millis(1000));
                assert_eq!(config.max_export_batch_size, 128);
            },
        );
    }

    #[test]
    fn batch_size_is_capped_at_queue_size() {
        let config = BatchConfigBuilder::default()
            .with_max_queue_size(8)
            .with_max_export_batch_size(512)
            .build();
        assert_eq!(config.max_export_batch_size, 8);
    }

    #[test]
    fn batch_processor_flushes_on_shutdown() {
        let exporter = InMemorySpanExporter::default();
        let processor = BatchSpanProcessor::builder(exporter.clone()).build();

        let data = crate::trace::test_span_data("batched-op");
        processor.on_end(data);
        processor.shutdown().unwrap();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "batched-op");
    }

    #[test]
    fn batch_processor_force_flush() {
        let exporter = InMemorySpanExporter::default();
        let processor = BatchSpanProcessor::builder(exporter.clone()).build();

        processor.on_end(crate::trace::test_span_data("a"));
        processor.on_end(crate::trace::test_span_data("b"));
        processor.force_flush().unwrap();

        assert_eq!(exporter.get_finished_spans().unwrap().len(), 2);
        processor.shutdown().unwrap();
    }

    #[test]
    fn shutdown_twice_errors() {
        let exporter = InMemorySpanExporter::default();
        let processor = BatchSpanProcessor::builder(exporter).build();
        processor.shutdown().unwrap();
        assert!(processor.shutdown().is_err());
    }
}
