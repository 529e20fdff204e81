//! Safe method patching.
//!
//! [`wrap`] installs an instrumentation wrapper around an operation of an
//! [`Exports`] surface with three hard guarantees:
//!
//! * the original is invoked **at most once** per call, enforced by the
//!   type system, since [`OriginalCall::call`] consumes the token;
//! * a fault in the wrapper's own logic can neither crash the host call
//!   nor change its result: the shim catches the panic, logs it, and
//!   either replays the original with the saved arguments (fault before
//!   delegation) or returns the already-produced result (fault after);
//! * a panic raised by the original itself propagates to the host caller
//!   unchanged; it is the target's fault, not instrumentation's.
//!
//! The result of a delegated call is parked in a slot shared between the
//! wrapper and the shim. The wrapper can look at it through
//! [`Delivered::inspect`] to record failures on a span, but it never owns
//! it; the shim takes it back out and hands it to the host caller after the
//! wrapper is done, panicked or not.

use crate::hook::exports::{Exports, MethodFn};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracewire::{tw_debug, tw_error};

/// Errors raised when patching a module's exports.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PatchError {
    /// No operation with the requested name is registered.
    #[error("no original function {method} to wrap in module {module}")]
    MethodNotFound {
        /// Module the lookup ran against.
        module: String,
        /// Requested operation name.
        method: String,
    },

    /// An operation with the requested name exists, but with different
    /// argument or return types.
    #[error("function {method} in module {module} has a different signature")]
    SignatureMismatch {
        /// Module the lookup ran against.
        module: String,
        /// Requested operation name.
        method: String,
    },

    /// The method table lock was poisoned.
    #[error("method table of module {module} is poisoned")]
    Poisoned {
        /// Module the lookup ran against.
        module: String,
    },
}

const NOT_DELEGATED: u8 = 0;
const IN_TARGET: u8 = 1;
const DELIVERED: u8 = 2;

/// Shared record of one call through a wrapped method.
struct Flight<R> {
    phase: AtomicU8,
    result: Mutex<Option<R>>,
}

impl<R> Default for Flight<R> {
    fn default() -> Self {
        Flight {
            phase: AtomicU8::new(NOT_DELEGATED),
            result: Mutex::new(None),
        }
    }
}

/// Single-use token for delegating to the original method.
///
/// Consuming the token is the only way to reach the original, which is what
/// makes "at most one invocation per wrapped call" a compile-time property.
pub struct OriginalCall<A, R> {
    f: MethodFn<A, R>,
    flight: Arc<Flight<R>>,
}

impl<A, R> std::fmt::Debug for OriginalCall<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginalCall").finish()
    }
}

impl<A, R> OriginalCall<A, R> {
    /// Invokes the original method with the given arguments.
    ///
    /// The result is parked for the host caller; the returned [`Delivered`]
    /// handle allows the wrapper to inspect it without taking ownership.
    pub fn call(self, args: A) -> Delivered<R> {
        self.flight.phase.store(IN_TARGET, Ordering::Relaxed);
        let result = (self.f)(args);
        if let Ok(mut slot) = self.flight.result.lock() {
            *slot = Some(result);
        }
        self.flight.phase.store(DELIVERED, Ordering::Relaxed);
        Delivered {
            flight: self.flight,
        }
    }
}

/// Handle to the parked result of a delegated call.
pub struct Delivered<R> {
    flight: Arc<Flight<R>>,
}

impl<R> std::fmt::Debug for Delivered<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivered").finish()
    }
}

impl<R> Delivered<R> {
    /// Applies `f` to the parked result, if it has not been handed back to
    /// the host caller yet.
    pub fn inspect<T>(&self, f: impl FnOnce(&R) -> T) -> Option<T> {
        self.flight
            .result
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(f))
    }
}

/// Replaces the operation `method` on `exports` with an instrumented
/// wrapper.
///
/// On every call of the patched method the wrapper receives a single-use
/// [`OriginalCall`] token plus the call's arguments. Typical wrappers
/// decide whether to trace, delegate via [`OriginalCall::call`], record the
/// outcome, and return; the shim then delivers the parked result to the
/// host caller. A wrapper that never delegates (on any path, including a
/// panic before delegation) still results in exactly one invocation of the
/// original: the shim replays it with a saved copy of the arguments.
///
/// Wrapping a missing or differently-typed method logs an error and leaves
/// the exports untouched, so a broken instrumentation cannot take a module
/// down with it.
pub fn wrap<A, R, W>(exports: &Exports, method: &str, wrapper: W) -> Result<(), PatchError>
where
    A: Clone + Send + 'static,
    R: Send + 'static,
    W: Fn(OriginalCall<A, R>, A) + Send + Sync + 'static,
{
    let original = match exports.method_fn::<A, R>(method) {
        Ok(original) => original,
        Err(err) => {
            tw_error!(
                name: "Wrap.Failed",
                reason = err.to_string()
            );
            return Err(err);
        }
    };

    let fault_logged = AtomicBool::new(false);
    let module = exports.module().to_string();
    let method_name = method.to_string();

    let shim = {
        let original = original.clone();
        move |args: A| -> R {
            let flight: Arc<Flight<R>> = Arc::new(Flight::default());
            let token = OriginalCall {
                f: original.clone(),
                flight: flight.clone(),
            };
            let replay_args = args.clone();

            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| wrapper(token, args))) {
                if flight.phase.load(Ordering::Relaxed) == IN_TARGET {
                    // The target itself panicked; the host must see it.
                    resume_unwind(panic);
                }
                // Instrumentation-internal fault. Log the first occurrence
                // per call site, then fail quiet.
                if !fault_logged.swap(true, Ordering::Relaxed) {
                    tw_error!(
                        name: "Wrap.InstrumentationFault",
                        module = module.clone(),
                        method = method_name.clone()
                    );
                } else {
                    tw_debug!(
                        name: "Wrap.InstrumentationFault.Repeated",
                        module = module.clone(),
                        method = method_name.clone()
                    );
                }
            }

            let parked = flight.result.lock().ok().and_then(|mut slot| slot.take());
            match parked {
                Some(result) => result,
                // The wrapper never delegated; run the original unwrapped.
                None => (original)(replay_args),
            }
        }
    };

    exports.replace::<A, R>(method, Arc::new(shim))
}

/// Restores the original operation for `method`, removing any wraps.
pub fn unwrap(exports: &Exports, method: &str) -> Result<(), PatchError> {
    exports.restore(method)
}
