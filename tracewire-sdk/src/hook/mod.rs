//! # Module-load interception
//!
//! The [`Hooks`] registry connects instrumentation to the modules it wants
//! to patch without the modules' cooperation. An instrumentation registers
//! a transformer for a module name ([`Hooks::on_module_load`]) or a path
//! pattern ([`Hooks::on_file_load`]); the first time a matching module's
//! exports pass through the registry, the transformer runs against them and
//! the transformed surface is what every later load observes.
//!
//! Two loading strategies feed the registry, mirroring the two ways host
//! programs bring code in:
//!
//! * *linked* modules are handed to [`Hooks::register_linked`] eagerly,
//!   typically at startup before instrumentations exist; transformers
//!   registered later are applied to the retained exports at registration
//!   time.
//! * *resolved* modules arrive lazily through [`Hooks::load_with`], which
//!   runs the module's initializer on first use and transforms the result
//!   before anyone observes it.
//!
//! [`Hooks::load`] dispatches over both retained tables, so callers never
//! need to know which strategy applied to a module. Either way a
//! transformer runs at most once per module instance, and a transformer
//! that panics is logged and skipped; the module simply stays unpatched
//! for that transformer.
//!
//! Transformers run while the registry is locked and therefore must not
//! call back into module registration or loading.

mod exports;
pub mod wrap;

pub use exports::Exports;
pub use wrap::{unwrap, wrap, Delivered, OriginalCall, PatchError};

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracewire::tw_error;

type Transformer = Arc<dyn Fn(&Exports) + Send + Sync>;

struct ModuleTransformer {
    f: Transformer,
    /// Module names this transformer has already been applied to.
    applied: HashSet<String>,
}

struct FileTransformer {
    pattern: Regex,
    f: Transformer,
    applied: HashSet<String>,
}

#[derive(Default)]
struct HookState {
    by_module: HashMap<String, Vec<ModuleTransformer>>,
    by_file: Vec<FileTransformer>,
    loaded: HashMap<String, Arc<Exports>>,
}

/// Process-wide registry of module transformers and patched modules.
///
/// One instance is created at startup and passed by reference to whichever
/// subsystem performs interception; [`Hooks::global`] provides the shared
/// instance the stock instrumentations use.
#[derive(Default)]
pub struct Hooks {
    state: Mutex<HookState>,
    instrumentations: Mutex<HashMap<&'static str, Arc<AtomicBool>>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaded = self
            .state
            .lock()
            .map(|state| state.loaded.len())
            .unwrap_or(0);
        f.debug_struct("Hooks").field("loaded", &loaded).finish()
    }
}

static GLOBAL_HOOKS: Lazy<Hooks> = Lazy::new(Hooks::default);

impl Hooks {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Hooks::default()
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static Hooks {
        &GLOBAL_HOOKS
    }

    /// Registers `transformer` to run against the named module's exports.
    ///
    /// If the module is already loaded (either strategy), the transformer
    /// runs immediately against the retained exports; otherwise it runs on
    /// first load. It runs at most once per module instance either way.
    pub fn on_module_load<F>(&self, module: &str, transformer: F)
    where
        F: Fn(&Exports) + Send + Sync + 'static,
    {
        let transformer: Transformer = Arc::new(transformer);
        if let Ok(mut state) = self.state.lock() {
            let mut registered = ModuleTransformer {
                f: transformer,
                applied: HashSet::new(),
            };
            if let Some(exports) = state.loaded.get(module).cloned() {
                registered.applied.insert(module.to_string());
                apply_transformer(&registered.f, &exports);
            }
            state
                .by_module
                .entry(module.to_string())
                .or_default()
                .push(registered);
        }
    }

    /// Registers `transformer` to run against every loaded module whose
    /// name or path matches `pattern`.
    pub fn on_file_load<F>(&self, pattern: Regex, transformer: F)
    where
        F: Fn(&Exports) + Send + Sync + 'static,
    {
        let transformer: Transformer = Arc::new(transformer);
        if let Ok(mut state) = self.state.lock() {
            let mut registered = FileTransformer {
                pattern,
                f: transformer,
                applied: HashSet::new(),
            };
            let matching: Vec<Arc<Exports>> = state
                .loaded
                .iter()
                .filter(|(name, _)| registered.pattern.is_match(name))
                .map(|(_, exports)| exports.clone())
                .collect();
            for exports in matching {
                registered.applied.insert(exports.module().to_string());
                apply_transformer(&registered.f, &exports);
            }
            state.by_file.push(registered);
        }
    }

    /// Registers an eagerly-linked module with the registry.
    ///
    /// Transformers already registered for it run before the exports are
    /// retained and returned. Registering the same module twice returns the
    /// previously retained instance and does not re-run anything.
    pub fn register_linked(&self, exports: Exports) -> Arc<Exports> {
        self.admit(exports.module().to_string(), exports)
    }

    /// Loads a lazily-resolved module, running `init` and the matching
    /// transformers only on first use.
    pub fn load_with(&self, name: &str, init: impl FnOnce() -> Exports) -> Arc<Exports> {
        if let Some(existing) = self.load(name) {
            return existing;
        }
        self.admit(name.to_string(), init())
    }

    /// Returns the retained exports for a module loaded through either
    /// strategy.
    pub fn load(&self, name: &str) -> Option<Arc<Exports>> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.loaded.get(name).cloned())
    }

    /// Returns the activation handle for the named instrumentation,
    /// creating it (inactive) on first use.
    pub fn instrumentation(&self, name: &'static str) -> InstrumentationHandle {
        let active = self
            .instrumentations
            .lock()
            .map(|mut handles| handles.entry(name).or_default().clone())
            .unwrap_or_default();
        InstrumentationHandle { name, active }
    }

    fn admit(&self, name: String, exports: Exports) -> Arc<Exports> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Arc::new(exports),
        };
        // Concurrent and repeated loads collapse onto the first instance.
        if let Some(existing) = state.loaded.get(&name) {
            return existing.clone();
        }
        let exports = Arc::new(exports);

        if let Some(transformers) = state.by_module.get_mut(&name) {
            for transformer in transformers {
                if transformer.applied.insert(name.clone()) {
                    apply_transformer(&transformer.f, &exports);
                }
            }
        }
        for transformer in &mut state.by_file {
            if transformer.pattern.is_match(&name) && transformer.applied.insert(name.clone()) {
                apply_transformer(&transformer.f, &exports);
            }
        }

        state.loaded.insert(name, exports.clone());
        exports
    }
}

/// Runs one transformer, converting a panic into "this module stays
/// unpatched for this transformer".
fn apply_transformer(transformer: &Transformer, exports: &Arc<Exports>) {
    if catch_unwind(AssertUnwindSafe(|| transformer(exports))).is_err() {
        tw_error!(
            name: "Hooks.TransformerFailed",
            module = exports.module().to_string()
        );
    }
}

/// Activation flag of one registered instrumentation.
///
/// The flag is read fresh at every instrumented call, so flipping it takes
/// effect immediately; an external configuration surface typically owns the
/// handle.
#[derive(Clone, Debug)]
pub struct InstrumentationHandle {
    name: &'static str,
    active: Arc<AtomicBool>,
}

impl InstrumentationHandle {
    /// The instrumentation's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns whether the instrumentation is currently enabled.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Enables the instrumentation.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    /// Disables the instrumentation.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}
