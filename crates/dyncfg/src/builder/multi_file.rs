//! Builder selecting a configuration file per call
//!
//! The file name pattern is evaluated on every access, so the same builder
//! returns different configurations depending on the caller's context. One
//! [`FileBasedBuilder`] is created and cached per resolved file name.

use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use super::{ConfigurationBuilder, FileBasedBuilder, ManagedBuilders, MultiFileParameters};
use crate::ConfigError;
use crate::configuration::Configuration;
use crate::events::{BuilderEvent, BuilderEventType, BuilderListener, Listeners};
use crate::guard::ReentrancyGuard;
use crate::interpol::{ConfigurationInterpolator, SharedInterpolator};
use crate::reloading::CombinedReloadingController;

const PLACEHOLDER_START: &str = "${";

/// Resolves a file name pattern against the current context and delegates to
/// the file builder managed for the result.
///
/// Listeners added here are also added to every managed builder, present and
/// future. A reset of any managed builder is forwarded as a reset of this
/// builder, so wrappers holding derived results can drop them.
pub struct MultiFileBuilder {
    params: ArcSwap<MultiFileParameters>,
    managed: Arc<ManagedBuilders>,
    interpolator: SharedInterpolator,
    guard: ReentrancyGuard,
    event_listeners: Arc<Listeners<BuilderEvent>>,
    builder_listeners: Arc<Listeners<BuilderEvent>>,
    /// Registered on every managed builder to forward its resets
    delegation: BuilderListener,
    /// Registered on every managed builder to feed [`subscribe`](Self::subscribe)
    forwarding: BuilderListener,
    /// Orders listener registration against builder installation
    listener_lock: Mutex<()>,
}

impl MultiFileBuilder {
    pub fn new(params: MultiFileParameters) -> Self {
        let builder_listeners = Arc::new(Listeners::new());
        let delegation = delegation_listener(Arc::clone(&builder_listeners));
        let event_listeners = Arc::new(Listeners::new());
        let forwarding = forwarding_listener(Arc::clone(&event_listeners));
        Self {
            params: ArcSwap::from_pointee(params),
            managed: Arc::new(ManagedBuilders::new()),
            interpolator: SharedInterpolator::new(),
            guard: ReentrancyGuard::new(),
            event_listeners,
            builder_listeners,
            delegation,
            forwarding,
            listener_lock: Mutex::new(()),
        }
    }

    /// Current parameters
    pub fn params(&self) -> Arc<MultiFileParameters> {
        self.params.load_full()
    }

    /// The unresolved file name pattern
    pub fn file_pattern(&self) -> Option<String> {
        self.params.load().file_pattern.clone()
    }

    /// Replace the parameters. All managed builders and the interpolator are
    /// discarded, as by [`reset_parameters`](ConfigurationBuilder::reset_parameters).
    pub fn configure(&self, params: MultiFileParameters) {
        self.params.store(Arc::new(params));
        self.reset_parameters();
    }

    /// Interpolator built from the parameters, shared until the next reset
    pub fn interpolator(&self) -> Result<Arc<ConfigurationInterpolator>, ConfigError> {
        let params = self.params.load();
        let spec = params
            .basic
            .interpolator
            .as_ref()
            .ok_or_else(|| ConfigError::resolution("no interpolator specification is set"))?;
        Ok(self
            .interpolator
            .get_or_create(|| ConfigurationInterpolator::from_specification(spec)))
    }

    /// The file name for the current context.
    ///
    /// A lookup that calls back into this builder on the same thread gets the
    /// raw pattern, which keeps pattern evaluation from recursing.
    pub fn resolve_file_name(&self) -> Result<String, ConfigError> {
        let pattern = self
            .file_pattern()
            .ok_or_else(|| ConfigError::resolution("no file name pattern is set"))?;

        let Some(_scope) = self.guard.enter() else {
            debug!(pattern = %pattern, "Nested resolution, using raw pattern");
            return Ok(pattern);
        };
        if !pattern.contains(PLACEHOLDER_START) {
            return Ok(pattern);
        }
        Ok(self.interpolator()?.interpolate(&pattern))
    }

    /// Managed builder for the current context, created on first use
    pub fn managed_builder(&self) -> Result<Arc<FileBasedBuilder>, ConfigError> {
        let file_name = self.resolve_file_name()?;
        if let Some(builder) = self.managed.get(&file_name) {
            return Ok(builder);
        }

        let candidate =
            FileBasedBuilder::new(self.params.load().managed_builder_parameters(&file_name));

        let _lock = self.lock_listeners();
        let (builder, installed) = self.managed.put_if_absent(&file_name, candidate);
        if installed {
            self.init_managed_builder(&builder);
            debug!(file_name = %file_name, "Created managed builder");
        }
        Ok(builder)
    }

    /// Installed `(file name, builder)` pairs, sorted by file name
    pub fn managed_builders(&self) -> Vec<(String, Arc<FileBasedBuilder>)> {
        self.managed.entries()
    }

    /// Controller checking every managed builder created with reloading enabled,
    /// including builders created after this call
    pub fn reloading_controller(&self) -> CombinedReloadingController {
        let managed = Arc::clone(&self.managed);
        CombinedReloadingController::new(move || {
            managed
                .values()
                .iter()
                .filter_map(|builder| builder.reloading_controller())
                .collect()
        })
    }

    /// Subscribe to configuration events fired by this builder and its managed builders
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BuilderEvent> {
        self.event_listeners.subscribe()
    }

    fn init_managed_builder(&self, builder: &FileBasedBuilder) {
        for listener in self.event_listeners.snapshot() {
            builder.add_event_listener(listener);
        }
        for listener in self.builder_listeners.snapshot() {
            builder.add_builder_listener(listener);
        }
        builder.add_event_listener(Arc::clone(&self.forwarding));
        builder.add_builder_listener(Arc::clone(&self.delegation));
    }

    fn lock_listeners(&self) -> MutexGuard<'_, ()> {
        self.listener_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Republishes managed builder events to this builder's subscribers. Callback
/// listeners are copied onto managed builders, so they are not called again.
fn forwarding_listener(target: Arc<Listeners<BuilderEvent>>) -> BuilderListener {
    Arc::new(move |event: &BuilderEvent| target.broadcast(event.clone()))
}

fn delegation_listener(target: Arc<Listeners<BuilderEvent>>) -> BuilderListener {
    Arc::new(move |event: &BuilderEvent| {
        if event.event_type == BuilderEventType::Reset {
            target.fire(BuilderEvent::reset(event.location.as_deref()));
        }
    })
}

impl ConfigurationBuilder for MultiFileBuilder {
    fn configuration(&self) -> Result<Arc<Configuration>, ConfigError> {
        self.managed_builder()?.configuration()
    }

    /// Tells builder listeners that derived results are stale. Managed
    /// builders keep their results.
    fn reset_result(&self) {
        self.builder_listeners
            .fire(BuilderEvent::reset(self.file_pattern().as_deref()));
    }

    fn reset_parameters(&self) {
        let removed = {
            let _lock = self.lock_listeners();
            let removed = self.managed.clear();
            for builder in &removed {
                builder.remove_event_listener(&self.forwarding);
                builder.remove_builder_listener(&self.delegation);
            }
            self.interpolator.clear();
            removed
        };

        info!(
            pattern = ?self.file_pattern(),
            removed = removed.len(),
            "Discarded managed builders"
        );
        self.reset_result();
    }

    fn add_event_listener(&self, listener: BuilderListener) {
        let _lock = self.lock_listeners();
        self.event_listeners.add(Arc::clone(&listener));
        for builder in self.managed.values() {
            builder.add_event_listener(Arc::clone(&listener));
        }
    }

    fn remove_event_listener(&self, listener: &BuilderListener) -> bool {
        let _lock = self.lock_listeners();
        for builder in self.managed.values() {
            builder.remove_event_listener(listener);
        }
        self.event_listeners.remove(listener)
    }

    fn add_builder_listener(&self, listener: BuilderListener) {
        let _lock = self.lock_listeners();
        self.builder_listeners.add(Arc::clone(&listener));
        for builder in self.managed.values() {
            builder.add_builder_listener(Arc::clone(&listener));
        }
    }

    fn remove_builder_listener(&self, listener: &BuilderListener) -> bool {
        let _lock = self.lock_listeners();
        for builder in self.managed.values() {
            builder.remove_builder_listener(listener);
        }
        self.builder_listeners.remove(listener)
    }
}

impl std::fmt::Debug for MultiFileBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiFileBuilder")
            .field("file_pattern", &self.file_pattern())
            .field("managed", &self.managed.len())
            .field("interpolator", &self.interpolator)
            .finish()
    }
}
