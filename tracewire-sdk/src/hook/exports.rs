//! The exported surface of an instrumented module.
//!
//! A module, for the engine's purposes, is a named bag of operations.
//! Operations are registered with their concrete argument and return types
//! and stored type-erased; callers invoke them back through the same typed
//! interface. Instrumentation replaces individual operations via
//! [`wrap`](crate::hook::wrap), which decorates the stored function while
//! the original remains reachable.
//!
//! The method table is interior-mutable: patching an operation on a shared
//! [`Exports`] handle is immediately visible to every other holder of the
//! handle, which is what makes "the transformed module is what everyone
//! else observes" hold for late-registered instrumentation.

use crate::hook::wrap::PatchError;
use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

pub(crate) type MethodFn<A, R> = Arc<dyn Fn(A) -> R + Send + Sync>;

/// Type-erased stored operation.
trait ErasedMethod: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

struct TypedMethod<A, R> {
    f: MethodFn<A, R>,
}

impl<A: 'static, R: 'static> ErasedMethod for TypedMethod<A, R> {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MethodSlot {
    current: Arc<dyn ErasedMethod>,
    /// Set once the method has been wrapped, for [`Exports::restore`].
    original: Option<Arc<dyn ErasedMethod>>,
}

/// The exported surface of one instrumented module.
pub struct Exports {
    module: Cow<'static, str>,
    methods: RwLock<HashMap<Cow<'static, str>, MethodSlot>>,
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods = self
            .methods
            .read()
            .map(|methods| methods.len())
            .unwrap_or(0);
        f.debug_struct("Exports")
            .field("module", &self.module)
            .field("methods", &methods)
            .finish()
    }
}

impl Exports {
    /// Creates an empty export surface for the named module.
    pub fn new(module: impl Into<Cow<'static, str>>) -> Self {
        Exports {
            module: module.into(),
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// The module's name (or path, for file-matched modules).
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Registers an operation under `name` with its concrete signature.
    ///
    /// Registering a name twice replaces the earlier operation and clears
    /// any wrap applied to it.
    pub fn provide<A, R, F>(&self, name: impl Into<Cow<'static, str>>, f: F)
    where
        A: Send + 'static,
        R: Send + 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let slot = MethodSlot {
            current: Arc::new(TypedMethod::<A, R> { f: Arc::new(f) }),
            original: None,
        };
        if let Ok(mut methods) = self.methods.write() {
            methods.insert(name.into(), slot);
        }
    }

    /// Returns whether an operation of any signature is registered under
    /// `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.methods
            .read()
            .map(|methods| methods.contains_key(name))
            .unwrap_or(false)
    }

    /// Invokes the operation registered under `name`.
    ///
    /// The call goes through whatever is currently installed, the original
    /// operation or its instrumented replacement.
    pub fn call<A, R>(&self, name: &str, args: A) -> Result<R, PatchError>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let f = self.method_fn::<A, R>(name)?;
        Ok(f(args))
    }

    /// Fetches the currently installed function for `name` with the given
    /// signature. The lock is released before the function is invoked, so
    /// operations are free to call back into the module.
    pub(crate) fn method_fn<A, R>(&self, name: &str) -> Result<MethodFn<A, R>, PatchError>
    where
        A: 'static,
        R: 'static,
    {
        let methods = self
            .methods
            .read()
            .map_err(|_| PatchError::Poisoned {
                module: self.module.to_string(),
            })?;
        let slot = methods.get(name).ok_or_else(|| PatchError::MethodNotFound {
            module: self.module.to_string(),
            method: name.to_string(),
        })?;
        downcast::<A, R>(&slot.current).ok_or_else(|| PatchError::SignatureMismatch {
            module: self.module.to_string(),
            method: name.to_string(),
        })
    }

    /// Replaces the stored function for `name`, retaining the original for
    /// [`Exports::restore`]. Fails if the method is missing or has a
    /// different signature.
    pub(crate) fn replace<A, R>(&self, name: &str, replacement: MethodFn<A, R>) -> Result<(), PatchError>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let mut methods = self.methods.write().map_err(|_| PatchError::Poisoned {
            module: self.module.to_string(),
        })?;
        let slot = methods
            .get_mut(name)
            .ok_or_else(|| PatchError::MethodNotFound {
                module: self.module.to_string(),
                method: name.to_string(),
            })?;
        if downcast::<A, R>(&slot.current).is_none() {
            return Err(PatchError::SignatureMismatch {
                module: self.module.to_string(),
                method: name.to_string(),
            });
        }
        let previous = std::mem::replace(
            &mut slot.current,
            Arc::new(TypedMethod::<A, R> { f: replacement }),
        );
        // Keep the outermost original across repeated wraps.
        slot.original.get_or_insert(previous);
        Ok(())
    }

    /// Restores the original function for `name`, undoing any wraps.
    pub fn restore(&self, name: &str) -> Result<(), PatchError> {
        let mut methods = self.methods.write().map_err(|_| PatchError::Poisoned {
            module: self.module.to_string(),
        })?;
        let slot = methods
            .get_mut(name)
            .ok_or_else(|| PatchError::MethodNotFound {
                module: self.module.to_string(),
                method: name.to_string(),
            })?;
        if let Some(original) = slot.original.take() {
            slot.current = original;
        }
        Ok(())
    }
}

fn downcast<A: 'static, R: 'static>(method: &Arc<dyn ErasedMethod>) -> Option<MethodFn<A, R>> {
    method
        .as_any()
        .downcast_ref::<TypedMethod<A, R>>()
        .map(|typed| typed.f.clone())
}
