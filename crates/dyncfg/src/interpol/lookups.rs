//! Built-in lookup providers
//!
//! - `sys`: process-wide property store ([`set_system_property`])
//! - `env`: process environment variables
//! - `ctx`: bindings scoped to the calling thread ([`ThreadContext`])

use dashmap::DashMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock};

use super::Lookup;

/// Prefix of the process-wide property lookup
pub const PREFIX_SYSTEM: &str = "sys";
/// Prefix of the environment variable lookup
pub const PREFIX_ENV: &str = "env";
/// Prefix of the thread-scoped context lookup
pub const PREFIX_CONTEXT: &str = "ctx";

static SYSTEM_PROPERTIES: LazyLock<DashMap<String, String>> = LazyLock::new(DashMap::new);

/// Set a process-wide property; returns the previous value
pub fn set_system_property(name: impl Into<String>, value: impl Into<String>) -> Option<String> {
    SYSTEM_PROPERTIES.insert(name.into(), value.into())
}

/// Read a process-wide property
pub fn system_property(name: &str) -> Option<String> {
    SYSTEM_PROPERTIES.get(name).map(|v| v.value().clone())
}

/// Remove a process-wide property; returns the removed value
pub fn remove_system_property(name: &str) -> Option<String> {
    SYSTEM_PROPERTIES.remove(name).map(|(_, v)| v)
}

/// Resolves names against the process-wide property store
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPropertiesLookup;

impl Lookup for SystemPropertiesLookup {
    fn lookup(&self, name: &str) -> Option<String> {
        system_property(name)
    }
}

/// Resolves names against environment variables
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentLookup;

impl Lookup for EnvironmentLookup {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

thread_local! {
    static CONTEXT: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
}

/// Bindings visible only to the current thread
///
/// Callers bind the values a pattern depends on (tenant, locale) before
/// reading configuration:
///
/// ```
/// use dyncfg::interpol::ThreadContext;
///
/// let _tenant = ThreadContext::scoped("tenant", "acme");
/// assert_eq!(ThreadContext::get("tenant").as_deref(), Some("acme"));
/// ```
pub struct ThreadContext;

impl ThreadContext {
    /// Bind `name` for the current thread; returns the previous binding
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        CONTEXT.with(|ctx| ctx.borrow_mut().insert(name.into(), value.into()))
    }

    pub fn get(name: &str) -> Option<String> {
        CONTEXT.with(|ctx| ctx.borrow().get(name).cloned())
    }

    pub fn remove(name: &str) -> Option<String> {
        CONTEXT.with(|ctx| ctx.borrow_mut().remove(name))
    }

    /// Drop every binding of the current thread
    pub fn clear() {
        CONTEXT.with(|ctx| ctx.borrow_mut().clear());
    }

    /// Bind `name` until the returned scope is dropped, then restore the previous binding
    pub fn scoped(name: impl Into<String>, value: impl Into<String>) -> ContextScope {
        let name = name.into();
        let previous = Self::set(name.clone(), value);
        ContextScope {
            name,
            previous,
            _not_send: PhantomData,
        }
    }
}

/// Restores a thread context binding on drop
#[derive(Debug)]
pub struct ContextScope {
    name: String,
    previous: Option<String>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        let _ = CONTEXT.try_with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            match self.previous.take() {
                Some(previous) => ctx.insert(self.name.clone(), previous),
                None => ctx.remove(&self.name),
            }
        });
    }
}

/// Resolves names against [`ThreadContext`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadContextLookup;

impl Lookup for ThreadContextLookup {
    fn lookup(&self, name: &str) -> Option<String> {
        ThreadContext::get(name)
    }
}

/// Resolves names from a fixed map
#[derive(Debug, Clone, Default)]
pub struct MapLookup {
    values: HashMap<String, String>,
}

impl MapLookup {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl Lookup for MapLookup {
    fn lookup(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Asks each lookup in turn; the first defined value wins
#[derive(Clone, Default)]
pub struct ChainedLookup {
    lookups: Vec<Arc<dyn Lookup>>,
}

impl ChainedLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, lookup: impl Lookup + 'static) -> Self {
        self.lookups.push(Arc::new(lookup));
        self
    }
}

impl Lookup for ChainedLookup {
    fn lookup(&self, name: &str) -> Option<String> {
        self.lookups.iter().find_map(|l| l.lookup(name))
    }
}

impl std::fmt::Debug for ChainedLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedLookup")
            .field("lookups", &self.lookups.len())
            .finish()
    }
}

/// The lookups registered by [`InterpolatorSpecification::with_default_prefix_lookups`](super::InterpolatorSpecification::with_default_prefix_lookups)
pub fn default_prefix_lookups() -> HashMap<String, Arc<dyn Lookup>> {
    let mut lookups: HashMap<String, Arc<dyn Lookup>> = HashMap::new();
    lookups.insert(PREFIX_SYSTEM.to_string(), Arc::new(SystemPropertiesLookup));
    lookups.insert(PREFIX_ENV.to_string(), Arc::new(EnvironmentLookup));
    lookups.insert(PREFIX_CONTEXT.to_string(), Arc::new(ThreadContextLookup));
    lookups
}
