//! Combined view over static and context-dependent sources
//!
//! A [`DynamicCombinedConfiguration`] answers a key from the first source that
//! defines it. Builder-backed sources are asked first, in registration order,
//! and return the configuration for the caller's current context; static
//! sources follow in registration order and typically hold defaults.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::ConfigError;
use crate::builder::ConfigurationBuilder;
use crate::configuration::Configuration;
use crate::events::{BuilderEvent, BuilderEventType, BuilderListener};
use crate::guard::ReentrancyGuard;
use crate::interpol::{ConfigurationInterpolator, InterpolatorSpecification, SharedInterpolator};

/// Context segment used when no key pattern is set
const DEFAULT_CONTEXT: &str = "";

enum Source {
    Static(Arc<Configuration>),
    Dynamic(Arc<dyn ConfigurationBuilder>),
}

struct NamedSource {
    name: String,
    source: Source,
}

impl NamedSource {
    fn configuration(&self) -> Result<Arc<Configuration>, ConfigError> {
        match &self.source {
            Source::Static(config) => Ok(Arc::clone(config)),
            Source::Dynamic(builder) => builder.configuration(),
        }
    }

    fn is_dynamic(&self) -> bool {
        matches!(self.source, Source::Dynamic(_))
    }
}

/// Merged snapshots per context segment
#[derive(Default)]
struct SnapshotCache {
    entries: DashMap<String, Arc<Configuration>>,
    generation: AtomicU64,
}

impl SnapshotCache {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    /// Cache `snapshot` unless an invalidation happened since `generation`
    fn insert(&self, context: &str, snapshot: &Arc<Configuration>, generation: u64) {
        if self.generation() != generation {
            return;
        }
        self.entries.insert(context.to_string(), Arc::clone(snapshot));
        // An invalidation may have run between the check and the insert
        if self.generation() != generation {
            self.entries
                .remove_if(context, |_, cached| Arc::ptr_eq(cached, snapshot));
        }
    }
}

/// Read-only union of named sources whose answer depends on the caller's context
pub struct DynamicCombinedConfiguration {
    key_pattern: Option<String>,
    interpolator_spec: Option<InterpolatorSpecification>,
    interpolator: SharedInterpolator,
    guard: ReentrancyGuard,
    sources: ArcSwap<Vec<Arc<NamedSource>>>,
    /// Serializes source registration
    sources_lock: Mutex<()>,
    snapshots: Arc<SnapshotCache>,
    /// Registered on every builder-backed source
    invalidation: BuilderListener,
}

impl DynamicCombinedConfiguration {
    pub fn new() -> Self {
        let snapshots = Arc::new(SnapshotCache::default());
        let invalidation = invalidation_listener(Arc::clone(&snapshots));
        Self {
            key_pattern: None,
            interpolator_spec: None,
            interpolator: SharedInterpolator::new(),
            guard: ReentrancyGuard::new(),
            sources: ArcSwap::from_pointee(Vec::new()),
            sources_lock: Mutex::new(()),
            snapshots,
            invalidation,
        }
    }

    /// Pattern naming the current context, e.g. `${sys:Id}`
    pub fn with_key_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.key_pattern = Some(pattern.into());
        self
    }

    pub fn with_interpolator(mut self, spec: InterpolatorSpecification) -> Self {
        self.interpolator_spec = Some(spec);
        self.interpolator.clear();
        self
    }

    pub fn key_pattern(&self) -> Option<&str> {
        self.key_pattern.as_deref()
    }

    /// Add a fixed configuration
    pub fn add_configuration(
        &self,
        name: impl Into<String>,
        config: Configuration,
    ) -> Result<(), ConfigError> {
        self.add_source(name.into(), Source::Static(Arc::new(config)))
    }

    /// Add a builder whose result depends on the current context
    pub fn add_builder<B>(&self, name: impl Into<String>, builder: Arc<B>) -> Result<(), ConfigError>
    where
        B: ConfigurationBuilder + 'static,
    {
        let builder: Arc<dyn ConfigurationBuilder> = builder;
        self.add_source(name.into(), Source::Dynamic(builder))
    }

    /// Remove the source called `name`; returns whether it existed
    pub fn remove_source(&self, name: &str) -> bool {
        let removed = {
            let _lock = self.sources_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.sources.load_full();
            let Some(position) = current.iter().position(|s| s.name == name) else {
                return false;
            };
            let mut next = Vec::clone(&current);
            let removed = next.remove(position);
            self.sources.store(Arc::new(next));
            removed
        };

        if let Source::Dynamic(builder) = &removed.source {
            builder.remove_builder_listener(&self.invalidation);
            builder.remove_event_listener(&self.invalidation);
        }
        self.invalidate();
        info!(source = name, "Removed configuration source");
        true
    }

    /// Source names in registration order
    pub fn source_names(&self) -> Vec<String> {
        self.sources.load().iter().map(|s| s.name.clone()).collect()
    }

    /// The context segment for the calling thread.
    ///
    /// Evaluated like a resolver's file pattern: a lookup that reads this view
    /// while the pattern is evaluated gets the raw pattern.
    pub fn current_key(&self) -> Result<String, ConfigError> {
        let Some(pattern) = &self.key_pattern else {
            return Ok(DEFAULT_CONTEXT.to_string());
        };
        let Some(_scope) = self.guard.enter() else {
            return Ok(pattern.clone());
        };
        Ok(self.interpolator()?.interpolate(pattern))
    }

    /// Look up `key` in the sources for the current context
    pub fn get(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        self.find(|config| config.get(key).cloned())
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        self.find(|config| config.get_string(key))
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        self.find(|config| config.get_i64(key))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.find(|config| config.get_bool(key))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool, ConfigError> {
        Ok(self.get(key)?.is_some())
    }

    /// All sources merged into one tree for the current context.
    ///
    /// Snapshots are cached per context and dropped when a builder-backed
    /// source is reset or on [`invalidate`](Self::invalidate). Without a key
    /// pattern there is no context to cache under, so a view holding
    /// builder-backed sources merges anew on every call.
    pub fn snapshot(&self) -> Result<Arc<Configuration>, ConfigError> {
        let context = self.current_key()?;
        let sources = self.ordered_sources();
        let cacheable = self.key_pattern.is_some() || !sources.iter().any(|s| s.is_dynamic());
        if cacheable && let Some(cached) = self.snapshots.entries.get(&context) {
            return Ok(Arc::clone(cached.value()));
        }

        let generation = self.snapshots.generation();
        let mut layers = Vec::new();
        for source in sources {
            layers.push(source.configuration()?);
        }
        // Lowest precedence first
        let snapshot = Arc::new(Configuration::merged(
            layers.iter().rev().map(|config| &**config),
        ));

        if cacheable {
            self.snapshots.insert(&context, &snapshot, generation);
        }
        debug!(
            context = %context,
            sources = layers.len(),
            cached = cacheable,
            "Built combined snapshot"
        );
        Ok(snapshot)
    }

    /// Drop all cached snapshots
    pub fn invalidate(&self) {
        self.snapshots.invalidate();
        debug!("Invalidated combined snapshots");
    }

    fn interpolator(&self) -> Result<Arc<ConfigurationInterpolator>, ConfigError> {
        let spec = self
            .interpolator_spec
            .as_ref()
            .ok_or_else(|| ConfigError::resolution("no interpolator specification is set"))?;
        Ok(self
            .interpolator
            .get_or_create(|| ConfigurationInterpolator::from_specification(spec)))
    }

    fn add_source(&self, name: String, source: Source) -> Result<(), ConfigError> {
        let entry = Arc::new(NamedSource { name, source });
        {
            let _lock = self.sources_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.sources.load_full();
            if current.iter().any(|s| s.name == entry.name) {
                return Err(ConfigError::DuplicateSource(entry.name.clone()));
            }
            let mut next = Vec::clone(&current);
            next.push(Arc::clone(&entry));
            self.sources.store(Arc::new(next));
        }

        if let Source::Dynamic(builder) = &entry.source {
            builder.add_builder_listener(Arc::clone(&self.invalidation));
            builder.add_event_listener(Arc::clone(&self.invalidation));
        }
        self.invalidate();
        info!(source = %entry.name, dynamic = entry.is_dynamic(), "Added configuration source");
        Ok(())
    }

    /// Dynamic sources in registration order, then static ones
    fn ordered_sources(&self) -> Vec<Arc<NamedSource>> {
        let sources = self.sources.load();
        let (mut ordered, fixed): (Vec<_>, Vec<_>) =
            sources.iter().cloned().partition(|s| s.is_dynamic());
        ordered.extend(fixed);
        ordered
    }

    fn find<T, F>(&self, extract: F) -> Result<Option<T>, ConfigError>
    where
        F: Fn(&Configuration) -> Option<T>,
    {
        for source in self.ordered_sources() {
            let config = source.configuration()?;
            if let Some(value) = extract(&config) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

fn invalidation_listener(snapshots: Arc<SnapshotCache>) -> BuilderListener {
    Arc::new(move |event: &BuilderEvent| {
        if matches!(
            event.event_type,
            BuilderEventType::Reset | BuilderEventType::ResultCreated
        ) {
            snapshots.invalidate();
        }
    })
}

impl Default for DynamicCombinedConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DynamicCombinedConfiguration {
    fn drop(&mut self) {
        for source in self.sources.load().iter() {
            if let Source::Dynamic(builder) = &source.source {
                builder.remove_builder_listener(&self.invalidation);
                builder.remove_event_listener(&self.invalidation);
            }
        }
    }
}

impl std::fmt::Debug for DynamicCombinedConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCombinedConfiguration")
            .field("key_pattern", &self.key_pattern)
            .field("sources", &self.source_names())
            .field("snapshots", &self.snapshots.entries.len())
            .finish()
    }
}
