//! Builder for a single configuration file

use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};

use super::{ConfigurationBuilder, FileParameters};
use crate::ConfigError;
use crate::configuration::Configuration;
use crate::events::{BuilderEvent, BuilderListener, Listeners};
use crate::reloading::{
    FileModificationDetector, ReloadingController, ReloadingEvent, ReloadingListener,
};

enum LoadOutcome {
    /// Loaded by another thread while this one waited for the lock
    Cached(Arc<Configuration>),
    Loaded(Arc<Configuration>),
    /// Loading failed but `allow_fail_on_init` substituted an empty configuration
    Substituted(Arc<Configuration>, ConfigError),
    Failed(ConfigError),
}

/// Loads one file and caches the parsed result.
///
/// The result is loaded on first access and kept until [`reset_result`] is
/// called, either explicitly or by the builder's reloading controller after
/// the file changed. Readers holding the previous `Arc<Configuration>` are not
/// affected by a reset.
///
/// [`reset_result`]: ConfigurationBuilder::reset_result
pub struct FileBasedBuilder {
    params: FileParameters,
    result: ArcSwapOption<Configuration>,
    /// Serializes loads so each generation is read once
    load_lock: Mutex<()>,
    /// Bumped by every reset; a load that saw an older value is discarded
    generation: AtomicU64,
    event_listeners: Listeners<BuilderEvent>,
    builder_listeners: Listeners<BuilderEvent>,
    controller: Option<Arc<ReloadingController>>,
    load_count: AtomicU64,
}

impl FileBasedBuilder {
    /// Create a builder. No I/O happens before the first [`configuration`] call.
    ///
    /// [`configuration`]: ConfigurationBuilder::configuration
    pub fn new(params: FileParameters) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let controller = match (params.reloading(), params.path()) {
                (true, Some(path)) => {
                    let detector =
                        FileModificationDetector::new(path).with_refresh_delay(params.refresh_delay());
                    let controller = Arc::new(ReloadingController::new(detector));
                    controller.add_listener(reset_on_reload(weak.clone()));
                    Some(controller)
                }
                _ => None,
            };

            Self {
                params,
                result: ArcSwapOption::empty(),
                load_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
                event_listeners: Listeners::new(),
                builder_listeners: Listeners::new(),
                controller,
                load_count: AtomicU64::new(0),
            }
        })
    }

    pub fn params(&self) -> &FileParameters {
        &self.params
    }

    /// Path of the backing file, as a string
    pub fn location(&self) -> Option<String> {
        self.params.path().map(|p| p.display().to_string())
    }

    /// Number of times the file was actually read
    pub fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Whether a result is currently cached
    pub fn has_result(&self) -> bool {
        self.result.load().is_some()
    }

    /// Controller watching the file, if reloading is enabled
    pub fn reloading_controller(&self) -> Option<Arc<ReloadingController>> {
        self.controller.clone()
    }

    /// Subscribe to configuration events fired after this call
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BuilderEvent> {
        self.event_listeners.subscribe()
    }

    fn load(&self) -> Result<Configuration, ConfigError> {
        let path = self
            .params
            .path()
            .ok_or_else(|| ConfigError::resolution("no file name is set"))?;
        let location = path.display().to_string();

        let format = self.params.effective_format(&path).ok_or_else(|| {
            ConfigError::source_load(&location, format!("cannot determine format of {location}"))
        })?;
        let content =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::source_load(&location, e))?;
        let config =
            Configuration::parse(format, &content).map_err(|e| ConfigError::source_load(&location, e))?;

        debug!(location = %location, %format, "Loaded configuration file");
        Ok(config.with_location(location))
    }

    fn load_locked(&self) -> LoadOutcome {
        let _lock = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have loaded while we waited
        if let Some(existing) = self.result.load_full() {
            return LoadOutcome::Cached(existing);
        }

        loop {
            let generation = self.generation.load(Ordering::SeqCst);
            if let Some(controller) = &self.controller {
                controller.loading_started();
            }

            let (config, failure) = match self.load() {
                Ok(config) => (Arc::new(config), None),
                Err(e) if self.params.basic.allow_fail_on_init() => {
                    let mut empty = Configuration::empty();
                    if let Some(location) = self.location() {
                        empty = empty.with_location(location);
                    }
                    (Arc::new(empty), Some(e))
                }
                Err(e) => return LoadOutcome::Failed(e),
            };

            if !self.install(&config, generation) {
                debug!(location = ?self.location(), "Reset while loading, reading the file again");
                continue;
            }

            self.load_count.fetch_add(1, Ordering::SeqCst);
            if let Some(controller) = &self.controller {
                controller.reset_reloading_state();
            }

            return match failure {
                None => LoadOutcome::Loaded(config),
                Some(e) => LoadOutcome::Substituted(config, e),
            };
        }
    }

    /// Publish `config` unless a reset happened after `generation` was read.
    ///
    /// A reset that lands after the generation check clears the result itself.
    fn install(&self, config: &Arc<Configuration>, generation: u64) -> bool {
        self.result.store(Some(Arc::clone(config)));
        if self.generation.load(Ordering::SeqCst) == generation {
            return true;
        }
        // Only take back our own result
        let ours = Some(Arc::clone(config));
        self.result.compare_and_swap(&ours, None::<Arc<Configuration>>);
        false
    }
}

fn reset_on_reload(builder: Weak<FileBasedBuilder>) -> ReloadingListener {
    Arc::new(move |event: &ReloadingEvent| {
        if let ReloadingEvent::Reloading { .. } = event
            && let Some(builder) = builder.upgrade()
        {
            info!(location = ?builder.location(), "File changed, resetting cached configuration");
            builder.reset_result();
        }
    })
}

impl ConfigurationBuilder for FileBasedBuilder {
    fn configuration(&self) -> Result<Arc<Configuration>, ConfigError> {
        if let Some(existing) = self.result.load_full() {
            return Ok(existing);
        }

        // Events fire outside the load lock; listeners may call back into the builder
        let location = self.location();
        match self.load_locked() {
            LoadOutcome::Cached(config) => Ok(config),
            LoadOutcome::Loaded(config) => {
                self.event_listeners
                    .fire(BuilderEvent::result_created(location.as_deref()));
                Ok(config)
            }
            LoadOutcome::Substituted(config, e) => {
                warn!(location = ?location, error = %e, "Load failed, using empty configuration");
                self.event_listeners
                    .fire(BuilderEvent::load_failed(location.as_deref(), &e));
                self.event_listeners
                    .fire(BuilderEvent::result_created(location.as_deref()));
                Ok(config)
            }
            LoadOutcome::Failed(e) => {
                warn!(location = ?location, error = %e, "Failed to load configuration");
                self.event_listeners
                    .fire(BuilderEvent::load_failed(location.as_deref(), &e));
                Err(e)
            }
        }
    }

    fn reset_result(&self) {
        // Bumped before clearing so a load in flight cannot reinstall stale data
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.result.store(None);
        self.builder_listeners
            .fire(BuilderEvent::reset(self.location().as_deref()));
    }

    /// Parameters of a file builder are fixed; this only drops the result
    fn reset_parameters(&self) {
        self.reset_result();
    }

    fn add_event_listener(&self, listener: BuilderListener) {
        self.event_listeners.add(listener);
    }

    fn remove_event_listener(&self, listener: &BuilderListener) -> bool {
        self.event_listeners.remove(listener)
    }

    fn add_builder_listener(&self, listener: BuilderListener) {
        self.builder_listeners.add(listener);
    }

    fn remove_builder_listener(&self, listener: &BuilderListener) -> bool {
        self.builder_listeners.remove(listener)
    }
}

impl std::fmt::Debug for FileBasedBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBasedBuilder")
            .field("location", &self.location())
            .field("has_result", &self.has_result())
            .field("reloading", &self.controller.is_some())
            .field("load_count", &self.load_count())
            .finish()
    }
}
