//! Id generation.

use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;
use tracewire::trace::{SpanId, TraceId};

/// Interface for generating trace and span ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SpanId`.
    fn new_span_id(&self) -> SpanId;
}

/// Default [`IdGenerator`] implementation.
///
/// Generates trace and span ids from a per-thread random number generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| TraceId::from(rng.borrow_mut().gen::<u128>()))
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| SpanId::from(rng.borrow_mut().gen::<u64>()))
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// [`IdGenerator`] implementation that increments a counter for each new id.
/// This helps produce predictable ids in tests.
#[derive(Clone, Debug)]
pub struct IncrementIdGenerator(std::sync::Arc<std::sync::atomic::AtomicU64>);

impl IncrementIdGenerator {
    /// Create a new `IncrementIdGenerator`.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for IncrementIdGenerator {
    fn default() -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicU64::new(1)))
    }
}

impl IdGenerator for IncrementIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        TraceId::from(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as u128)
    }

    fn new_span_id(&self) -> SpanId {
        SpanId::from(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }
}
