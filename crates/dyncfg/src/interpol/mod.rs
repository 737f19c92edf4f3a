//! Variable interpolation for file name and key patterns
//!
//! A pattern such as `conf/${ctx:tenant}/${env:APP_ENV}.toml` is evaluated by
//! replacing every `${prefix:name}` placeholder with the value returned by the
//! [`Lookup`] registered for `prefix`. Placeholders without a prefix go to the
//! default lookups. Unresolvable placeholders are kept verbatim.

mod lookups;

pub use lookups::{
    ChainedLookup, ContextScope, EnvironmentLookup, MapLookup, PREFIX_CONTEXT, PREFIX_ENV,
    PREFIX_SYSTEM, SystemPropertiesLookup, ThreadContext, ThreadContextLookup,
    default_prefix_lookups, remove_system_property, set_system_property, system_property,
};

use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

const VAR_START: &str = "${";
const VAR_END: char = '}';
const PREFIX_SEPARATOR: char = ':';

/// Resolves a variable name to its current value
pub trait Lookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;
}

impl<F> Lookup for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn lookup(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Declarative description of an interpolator
#[derive(Clone, Default)]
pub struct InterpolatorSpecification {
    prefix_lookups: HashMap<String, Arc<dyn Lookup>>,
    default_lookups: Vec<Arc<dyn Lookup>>,
}

impl InterpolatorSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `lookup` for placeholders of the form `${prefix:name}`
    pub fn with_prefix_lookup(mut self, prefix: impl Into<String>, lookup: impl Lookup + 'static) -> Self {
        self.prefix_lookups.insert(prefix.into(), Arc::new(lookup));
        self
    }

    pub fn with_prefix_lookups(mut self, lookups: HashMap<String, Arc<dyn Lookup>>) -> Self {
        self.prefix_lookups.extend(lookups);
        self
    }

    /// Register the `sys`, `env` and `ctx` lookups
    pub fn with_default_prefix_lookups(self) -> Self {
        self.with_prefix_lookups(default_prefix_lookups())
    }

    /// Add a lookup for placeholders without a prefix
    pub fn with_default_lookup(mut self, lookup: impl Lookup + 'static) -> Self {
        self.default_lookups.push(Arc::new(lookup));
        self
    }

    pub fn prefixes(&self) -> Vec<&str> {
        let mut prefixes: Vec<&str> = self.prefix_lookups.keys().map(String::as_str).collect();
        prefixes.sort_unstable();
        prefixes
    }
}

impl std::fmt::Debug for InterpolatorSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpolatorSpecification")
            .field("prefixes", &self.prefixes())
            .field("default_lookups", &self.default_lookups.len())
            .finish()
    }
}

/// Substitutes `${...}` placeholders using registered lookups
#[derive(Clone, Default)]
pub struct ConfigurationInterpolator {
    prefix_lookups: HashMap<String, Arc<dyn Lookup>>,
    default_lookups: Vec<Arc<dyn Lookup>>,
}

impl ConfigurationInterpolator {
    /// An interpolator without lookups; every placeholder stays unresolved
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specification(spec: &InterpolatorSpecification) -> Self {
        Self {
            prefix_lookups: spec.prefix_lookups.clone(),
            default_lookups: spec.default_lookups.clone(),
        }
    }

    pub fn register_lookup(&mut self, prefix: impl Into<String>, lookup: Arc<dyn Lookup>) {
        self.prefix_lookups.insert(prefix.into(), lookup);
    }

    pub fn add_default_lookup(&mut self, lookup: Arc<dyn Lookup>) {
        self.default_lookups.push(lookup);
    }

    /// Resolve a single variable (the text between `${` and `}`)
    pub fn resolve(&self, variable: &str) -> Option<String> {
        if let Some((prefix, name)) = variable.split_once(PREFIX_SEPARATOR)
            && let Some(lookup) = self.prefix_lookups.get(prefix)
        {
            return lookup.lookup(name);
        }

        self.default_lookups
            .iter()
            .find_map(|lookup| lookup.lookup(variable))
    }

    /// Replace all placeholders in `pattern` by their current values.
    ///
    /// Resolved values are interpolated again; a variable that refers back to
    /// itself is left unresolved.
    pub fn interpolate(&self, pattern: &str) -> String {
        let mut in_progress = Vec::new();
        self.substitute(pattern, &mut in_progress)
    }

    fn substitute(&self, input: &str, in_progress: &mut Vec<String>) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find(VAR_START) {
            out.push_str(&rest[..start]);
            let after = &rest[start + VAR_START.len()..];
            let Some(end) = after.find(VAR_END) else {
                // Unterminated placeholder
                out.push_str(&rest[start..]);
                return out;
            };

            let variable = &after[..end];
            match self.resolve_nested(variable, in_progress) {
                Some(value) => out.push_str(&value),
                None => out.push_str(&rest[start..start + VAR_START.len() + end + 1]),
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        out
    }

    fn resolve_nested(&self, variable: &str, in_progress: &mut Vec<String>) -> Option<String> {
        if in_progress.iter().any(|v| v == variable) {
            warn!(variable, "Cyclic variable reference, leaving it unresolved");
            return None;
        }

        let value = self.resolve(variable)?;
        in_progress.push(variable.to_string());
        let value = self.substitute(&value, in_progress);
        in_progress.pop();
        Some(value)
    }
}

impl std::fmt::Debug for ConfigurationInterpolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut prefixes: Vec<&str> = self.prefix_lookups.keys().map(String::as_str).collect();
        prefixes.sort_unstable();
        f.debug_struct("ConfigurationInterpolator")
            .field("prefixes", &prefixes)
            .field("default_lookups", &self.default_lookups.len())
            .finish()
    }
}

/// Lazily created interpolator shared by all callers of one owner.
///
/// Under contention several candidates may be built, but only the first one
/// installed is ever handed out.
#[derive(Default)]
pub struct SharedInterpolator {
    current: ArcSwapOption<ConfigurationInterpolator>,
}

impl SharedInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the installed interpolator, creating it with `create` if needed
    pub fn get_or_create<F>(&self, create: F) -> Arc<ConfigurationInterpolator>
    where
        F: Fn() -> ConfigurationInterpolator,
    {
        loop {
            if let Some(existing) = self.current.load_full() {
                return existing;
            }

            let candidate = Arc::new(create());
            let previous = self
                .current
                .compare_and_swap(&None::<Arc<ConfigurationInterpolator>>, Some(Arc::clone(&candidate)));
            if previous.is_none() {
                return candidate;
            }
        }
    }

    pub fn current(&self) -> Option<Arc<ConfigurationInterpolator>> {
        self.current.load_full()
    }

    /// Discard the installed interpolator; the next access builds a new one
    pub fn clear(&self) {
        self.current.store(None);
    }
}

impl std::fmt::Debug for SharedInterpolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedInterpolator")
            .field("initialized", &self.current.load().is_some())
            .finish()
    }
}
