//! Internal engine counters.
//!
//! Process-wide tallies of span traffic, for diagnostics. This is not a
//! metrics-export surface; the values are only read on demand.

use std::sync::atomic::{AtomicU64, Ordering};

static OPENED: AtomicU64 = AtomicU64::new(0);
static CLOSED: AtomicU64 = AtomicU64::new(0);
static DROPPED: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_opened() {
    OPENED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_closed() {
    CLOSED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_dropped() {
    DROPPED.fetch_add(1, Ordering::Relaxed);
}

/// A snapshot of the engine's span counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineCounters {
    /// Spans created since process start.
    pub opened: u64,
    /// Spans finalized or cancelled since process start.
    pub closed: u64,
    /// Finished spans dropped because the export queue was full.
    pub dropped: u64,
}

/// Reads the current counter values.
pub fn counters() -> EngineCounters {
    EngineCounters {
        opened: OPENED.load(Ordering::Relaxed),
        closed: CLOSED.load(Ordering::Relaxed),
        dropped: DROPPED.load(Ordering::Relaxed),
    }
}
