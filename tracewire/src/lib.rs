//! Context propagation and tracing primitives for the tracewire engine.
//!
//! This crate carries the pieces shared by every instrumentation and by the
//! engine itself:
//!
//! * [`Context`]: an immutable, execution-scoped value store with a
//!   thread-local notion of "the current context". It is the mechanism by
//!   which the currently active span and the per-call-chain tracing flags
//!   (suppression, root-exit permission) survive asynchronous continuation
//!   boundaries.
//! * [`trace`]: trace and span identifiers, span kinds, and the shared
//!   error type.
//! * [`propagation`]: carrier traits for reading and writing correlation
//!   state from and to wire messages.
//!
//! The engine that creates, finalizes, and exports spans lives in the
//! `tracewire-sdk` crate; this crate deliberately stays small so that
//! instrumentation code can depend on it without pulling in the engine.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(test, deny(warnings))]

mod context;

pub use context::{Context, ContextGuard};

#[cfg(feature = "futures")]
pub use context::{FutureContextExt, SinkContextExt, StreamContextExt, WithContext};

pub mod propagation;
pub mod trace;

mod internal_logging;

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
