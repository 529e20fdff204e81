//! Execution-scoped context propagation.
//!
//! A [`Context`] carries the state of one logical call chain: arbitrary
//! typed values (the engine stores the active span and the active entry span
//! this way), plus the two inherited tracing flags, *suppressed* and
//! *root-exit allowed*. Contexts are immutable; "writing" produces a new
//! context. Each worker thread has its own stack of attached contexts, so
//! two call chains multiplexed over different threads can never observe each
//! other's state, and on a single thread the guard discipline restores the
//! previous context when a scope ends.
//!
//! Continuations that run later, such as timer callbacks and queued
//! completions, capture the context alive at scheduling time with [`Context::bind`] (for
//! plain closures) or [`FutureContextExt::with_context`] (for futures).

use crate::tw_warn;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;


#[cfg(feature = "futures")]
mod future_ext;

#[cfg(feature = "futures")]
pub use future_ext::{FutureContextExt, SinkContextExt, StreamContextExt, WithContext};

thread_local! {
    static CURRENT_CONTEXT: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

/// An immutable, execution-scoped collection of values and tracing flags.
///
/// # Examples
///
/// ```
/// use tracewire::Context;
///
/// #[derive(Debug, PartialEq)]
/// struct Deadline(u64);
///
/// let _guard = Context::new().with_value(Deadline(30)).attach();
///
/// // Code running below the attach point observes the value.
/// assert_eq!(Context::current().get::<Deadline>(), Some(&Deadline(30)));
/// ```
#[derive(Clone, Default)]
pub struct Context {
    entries: Option<Arc<EntryMap>>,
    suppressed: bool,
    allow_root_exit: bool,
}

type EntryMap = HashMap<TypeId, Arc<dyn Any + Sync + Send>, BuildHasherDefault<IdHasher>>;

impl Context {
    /// Creates an empty `Context`.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a snapshot of the current thread's active context.
    pub fn current() -> Self {
        Self::map_current(|cx| cx.clone())
    }

    /// Applies `f` to the current context without cloning it.
    ///
    /// Note: this will panic if `f` attempts to attach another context while
    /// the current one is borrowed.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| cx.borrow().map_current_cx(f))
    }

    /// Returns a clone of the current context with the given value added.
    ///
    /// Shorthand for `Context::current().with_value(value)` that avoids the
    /// intermediate clone.
    pub fn current_with_value<T: 'static + Send + Sync>(value: T) -> Self {
        Self::map_current(|cx| cx.with_value(value))
    }

    /// Returns a reference to the stored value of type `T`, if any.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.entries
            .as_ref()?
            .get(&TypeId::of::<T>())?
            .downcast_ref()
    }

    /// Returns a copy of this context with `value` included.
    ///
    /// Values are keyed by type; storing a second value of the same type
    /// replaces the first in the returned context. The original context is
    /// unchanged.
    pub fn with_value<T: 'static + Send + Sync>(&self, value: T) -> Self {
        let entries = if let Some(current_entries) = &self.entries {
            let mut inner_entries = (**current_entries).clone();
            inner_entries.insert(TypeId::of::<T>(), Arc::new(value));
            Some(Arc::new(inner_entries))
        } else {
            let mut entries = EntryMap::default();
            entries.insert(TypeId::of::<T>(), Arc::new(value));
            Some(Arc::new(entries))
        };
        Context {
            entries,
            suppressed: self.suppressed,
            allow_root_exit: self.allow_root_exit,
        }
    }

    /// Makes this context the current one for the calling thread.
    ///
    /// The previous context is restored when the returned [`ContextGuard`]
    /// is dropped. Guards may be dropped out of order; only dropping the
    /// most recently attached guard actually switches the current context.
    ///
    /// ```
    /// use tracewire::Context;
    ///
    /// #[derive(Debug, PartialEq)]
    /// struct Label(&'static str);
    ///
    /// let guard = Context::new().with_value(Label("a")).attach();
    /// assert_eq!(Context::current().get::<Label>(), Some(&Label("a")));
    ///
    /// drop(guard);
    /// assert_eq!(Context::current().get::<Label>(), None);
    /// ```
    pub fn attach(self) -> ContextGuard {
        let pos = CURRENT_CONTEXT.with(|cx| cx.borrow_mut().push(self));

        ContextGuard {
            cx_pos: pos,
            _marker: PhantomData,
        }
    }

    /// Runs `f` inside a fresh scope over the current context.
    ///
    /// Any context attached inside `f` (for example by activating a new
    /// span) is popped again before this function returns, except where a
    /// continuation bound inside `f` keeps its snapshot alive.
    pub fn run_with_new<T>(f: impl FnOnce() -> T) -> T {
        let _guard = Context::current().attach();
        f()
    }

    /// Captures this context and returns a continuation that restores it.
    ///
    /// The returned closure, whenever it is eventually invoked (from a
    /// timer, a queued completion, an event listener), attaches the captured
    /// context for the duration of `f` and restores the invoker's previous
    /// context afterwards. This is how causal linkage survives arbitrary
    /// delay and interleaving with unrelated call chains.
    ///
    /// ```
    /// use tracewire::Context;
    ///
    /// #[derive(Clone, Debug, PartialEq)]
    /// struct RequestId(u64);
    ///
    /// let deferred = {
    ///     let _guard = Context::new().with_value(RequestId(7)).attach();
    ///     Context::current().bind(|_: ()| Context::current().get::<RequestId>().cloned())
    /// };
    ///
    /// // The scope above is gone, but the bound continuation still sees it.
    /// assert_eq!(deferred(()), Some(RequestId(7)));
    /// ```
    pub fn bind<A, T>(self, f: impl FnOnce(A) -> T) -> impl FnOnce(A) -> T {
        move |arg| {
            let _guard = self.attach();
            f(arg)
        }
    }

    /// Returns whether tracing is suppressed in this context.
    #[inline]
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Returns a copy of this context with tracing suppression enabled.
    ///
    /// Suppression is inherited by everything derived from the returned
    /// context: no spans are created on the call chain until a context
    /// without the flag is attached.
    pub fn with_suppression(&self) -> Self {
        Context {
            entries: self.entries.clone(),
            suppressed: true,
            allow_root_exit: self.allow_root_exit,
        }
    }

    /// Enters a scope in which tracing is suppressed.
    ///
    /// Used by engine components (exporters, processors) so that their own
    /// outbound calls are not traced, which would otherwise feed back into
    /// the engine and loop.
    pub fn enter_suppressed_scope() -> ContextGuard {
        Self::map_current(|cx| cx.with_suppression()).attach()
    }

    /// Returns whether tracing is suppressed in the current context.
    #[inline]
    pub fn is_current_suppressed() -> bool {
        Self::map_current(|cx| cx.is_suppressed())
    }

    /// Returns whether an exit span may be started on this call chain
    /// without a causal ancestor.
    #[inline]
    pub fn is_root_exit_allowed(&self) -> bool {
        self.allow_root_exit
    }

    /// Returns a copy of this context that permits root exit spans.
    pub fn with_root_exit_allowed(&self) -> Self {
        Context {
            entries: self.entries.clone(),
            suppressed: self.suppressed,
            allow_root_exit: true,
        }
    }

    /// Creates a child context nested under this one.
    ///
    /// The child inherits the `suppressed` and root-exit flags but none of
    /// the stored values, in particular no span bindings. Grouped
    /// operations fork a child context before dispatching their
    /// sub-operations so that the sub-operations do not parent onto each
    /// other.
    pub fn child(&self) -> Self {
        Context {
            entries: None,
            suppressed: self.suppressed,
            allow_root_exit: self.allow_root_exit,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field(
                "entries",
                &self.entries.as_ref().map_or(0, |entries| entries.len()),
            )
            .field("suppressed", &self.suppressed)
            .field("allow_root_exit", &self.allow_root_exit)
            .finish()
    }
}

/// A guard that restores the previous context when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    // Position of the attached context in the thread's stack.
    cx_pos: u16,
    // Relies on thread-local state, so must not leave the thread.
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let pos = self.cx_pos;
        if pos > ContextStack::BASE_POS && pos < ContextStack::OVERFLOW_POS {
            CURRENT_CONTEXT.with(|stack| stack.borrow_mut().pop_pos(pos));
        }
    }
}

/// `TypeId`s are already hashes produced by the compiler; store the value
/// instead of hashing it again.
#[derive(Clone, Default, Debug)]
struct IdHasher(u64);

impl Hasher for IdHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("TypeId calls write_u64");
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.0 = id;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }
}

/// The per-thread stack of attached [`Context`]s.
///
/// Guards hold positions rather than values so that dropping guards out of
/// order is safe: popping a non-top position only clears the slot, and the
/// current context switches when the top itself is popped. Positions are
/// only valid on the owning thread, which is what makes them trustworthy
/// without further checks.
struct ContextStack {
    /// The currently active context, kept out of the `Vec` for fast access.
    current_cx: Context,
    /// Previously attached contexts; `None` marks slots already popped out
    /// of order.
    stack: Vec<Option<Context>>,
    _marker: PhantomData<*const ()>,
}

impl ContextStack {
    const BASE_POS: u16 = 0;
    const OVERFLOW_POS: u16 = u16::MAX;
    const INITIAL_CAPACITY: usize = 8;

    #[inline(always)]
    fn push(&mut self, cx: Context) -> u16 {
        // Position 0 is the permanent empty context, so the first attached
        // context lands at 1.
        let next_pos = self.stack.len() + 1;
        if next_pos < ContextStack::OVERFLOW_POS.into() {
            let current_cx = std::mem::replace(&mut self.current_cx, cx);
            self.stack.push(Some(current_cx));
            next_pos as u16
        } else {
            tw_warn!(
                name: "Context.AttachFailed",
                message = format!(
                    "Too many attached contexts, limit is {}. The current context is unchanged \
                     and dropping the returned guard will have no effect.",
                    ContextStack::OVERFLOW_POS
                )
            );
            ContextStack::OVERFLOW_POS
        }
    }

    #[inline(always)]
    fn pop_pos(&mut self, pos: u16) {
        let len: u16 = self.stack.len() as u16;
        if pos == len {
            // Top of the stack: restore the nearest context that has not
            // already been popped out of order.
            while let Some(None) = self.stack.last() {
                _ = self.stack.pop();
            }
            if let Some(Some(next_cx)) = self.stack.pop() {
                self.current_cx = next_cx;
            }
        } else {
            if pos > len {
                tw_warn!(
                    name: "Context.PopOutOfBounds",
                    position = pos,
                    stack_length = len,
                    message = "Attempted to pop beyond the end of the context stack"
                );
                return;
            }
            // Out of order pop, just clear the slot.
            _ = self.stack[pos as usize].take();
        }
    }

    #[inline(always)]
    fn map_current_cx<T>(&self, f: impl FnOnce(&Context) -> T) -> T {
        f(&self.current_cx)
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        ContextStack {
            current_cx: Context::default(),
            stack: Vec::with_capacity(ContextStack::INITIAL_CAPACITY),
            _marker: PhantomData,
        }
    }
}
