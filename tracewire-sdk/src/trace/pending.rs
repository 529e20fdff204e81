//! Pending-span timeout enforcement.
//!
//! A call chain that is abandoned (a connection torn down, a completion
//! that never fires) leaves its span unfinalized. Every started span is
//! registered here as a weak reference; a dedicated background thread scans
//! the registry and force-finalizes spans whose deadline has passed, so an
//! abandoned span is transmitted with a timeout-class error instead of
//! leaking forever.

use crate::trace::span::{Span, SpanInner};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracewire::tw_debug;

#[derive(Debug, Default)]
pub(crate) struct PendingSpans {
    spans: Mutex<Vec<Weak<SpanInner>>>,
    stopped: AtomicBool,
}

impl PendingSpans {
    pub(crate) fn track(&self, inner: &Arc<SpanInner>) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(Arc::downgrade(inner));
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Removes finished entries and returns the spans whose deadline has
    /// passed.
    fn take_due(&self, now: Instant) -> Vec<Arc<SpanInner>> {
        let mut due = Vec::new();
        if let Ok(mut spans) = self.spans.lock() {
            spans.retain(|weak| match weak.upgrade() {
                None => false,
                Some(inner) => {
                    if inner.deadline <= now {
                        due.push(inner);
                        false
                    } else {
                        true
                    }
                }
            });
        }
        due
    }
}

/// Spawns the reaper thread for a provider.
///
/// The scan interval is derived from the configured timeout so that short
/// timeouts (used in tests) are honored promptly without busy-waiting for
/// the default one.
pub(crate) fn spawn_reaper(
    pending: Arc<PendingSpans>,
    timeout: Duration,
) -> thread::JoinHandle<()> {
    let tick = (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    thread::Builder::new()
        .name("TracewirePendingSpanReaper".to_string())
        .spawn(move || loop {
            thread::sleep(tick);
            if pending.is_stopped() {
                break;
            }
            let due = pending.take_due(Instant::now());
            for inner in due {
                let span = Span::from_inner(inner);
                tw_debug!(
                    name: "PendingSpans.ForcedFinalize",
                    span_id = span.context().span_id().to_string()
                );
                span.finalize_timed_out();
            }
        })
        .expect("failed to spawn pending span reaper thread")
}
