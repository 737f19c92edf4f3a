//! Reload detection
//!
//! A [`ReloadingController`] asks its [`ReloadingDetector`] whether the
//! underlying source changed. On a change it enters the *reloading* state and
//! notifies its listeners once; the owning builder then drops its cached
//! result. The state is left again when the builder has loaded the new data
//! and calls [`ReloadingController::reset_reloading_state`].
//!
//! Readers are never blocked by a check: they keep the configuration they
//! already hold, and the next access loads fresh data.

mod detector;
mod watch;

pub use detector::FileModificationDetector;
pub use watch::{ReloadWatcher, WatchConfig, WatchHandle};

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::ConfigError;
use crate::events::{Listener, Listeners};

/// Decides whether a source must be reloaded
pub trait ReloadingDetector: Send + Sync {
    /// Whether the source changed since the last performed reload
    fn is_reloading_required(&self) -> Result<bool, ConfigError>;

    /// Called right before the source is read, so a change landing during the
    /// read is not taken as loaded
    fn loading_started(&self) {}

    /// Called once the changed source was loaded
    fn reloading_performed(&self);
}

/// Anything that can be asked to check for changes
pub trait ReloadCheck: Send + Sync {
    /// Check for changes; returns true if a reload is pending
    fn check_for_reloading(&self, data: Option<&str>) -> bool;
}

/// Notification sent by a reloading controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadingEvent {
    /// A change was detected; cached results must be dropped
    Reloading { data: Option<String> },
    /// The detector could not check the source; cached results stay valid
    CheckFailed { error: String },
}

/// Shared handle to a reloading listener
pub type ReloadingListener = Arc<dyn Listener<ReloadingEvent>>;

/// Drives one [`ReloadingDetector`]
pub struct ReloadingController {
    detector: Box<dyn ReloadingDetector>,
    reloading: Mutex<bool>,
    listeners: Listeners<ReloadingEvent>,
}

impl ReloadingController {
    pub fn new(detector: impl ReloadingDetector + 'static) -> Self {
        Self {
            detector: Box::new(detector),
            reloading: Mutex::new(false),
            listeners: Listeners::new(),
        }
    }

    pub fn add_listener(&self, listener: ReloadingListener) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &ReloadingListener) -> bool {
        self.listeners.remove(listener)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ReloadingEvent> {
        self.listeners.subscribe()
    }

    /// Whether a detected change has not been reloaded yet
    pub fn is_in_reloading_state(&self) -> bool {
        *self.reloading.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the start of a load; pairs with [`reset_reloading_state`]
    ///
    /// [`reset_reloading_state`]: Self::reset_reloading_state
    pub fn loading_started(&self) {
        self.detector.loading_started();
    }

    /// Leave the reloading state after the new data was loaded
    pub fn reset_reloading_state(&self) {
        let mut reloading = self.reloading.lock().unwrap_or_else(PoisonError::into_inner);
        if *reloading {
            debug!("Leaving reloading state");
        }
        // Also records the baseline after the very first load
        self.detector.reloading_performed();
        *reloading = false;
    }

    fn check(&self, data: Option<&str>) -> (bool, Option<ReloadingEvent>) {
        let mut reloading = self.reloading.lock().unwrap_or_else(PoisonError::into_inner);
        if *reloading {
            return (true, None);
        }

        match self.detector.is_reloading_required() {
            Ok(true) => {
                *reloading = true;
                let event = ReloadingEvent::Reloading {
                    data: data.map(str::to_string),
                };
                (true, Some(event))
            }
            Ok(false) => (false, None),
            Err(e) => {
                warn!(error = %e, "Reload check failed, keeping current configuration");
                let event = ReloadingEvent::CheckFailed {
                    error: e.to_string(),
                };
                (false, Some(event))
            }
        }
    }
}

impl ReloadCheck for ReloadingController {
    fn check_for_reloading(&self, data: Option<&str>) -> bool {
        let (reloading, event) = self.check(data);
        // Listeners run outside the lock; they typically reset a builder
        if let Some(event) = event {
            if matches!(event, ReloadingEvent::Reloading { .. }) {
                info!("Configuration change detected");
            }
            self.listeners.fire(event);
        }
        reloading
    }
}

impl std::fmt::Debug for ReloadingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadingController")
            .field("reloading", &self.is_in_reloading_state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

type ControllerProvider = dyn Fn() -> Vec<Arc<ReloadingController>> + Send + Sync;

/// Fans a check out over a changing set of controllers
///
/// The set is obtained anew on every check, so controllers of builders created
/// later are picked up automatically.
pub struct CombinedReloadingController {
    provider: Box<ControllerProvider>,
}

impl CombinedReloadingController {
    pub fn new<F>(provider: F) -> Self
    where
        F: Fn() -> Vec<Arc<ReloadingController>> + Send + Sync + 'static,
    {
        Self {
            provider: Box::new(provider),
        }
    }

    /// Combine a fixed set of controllers
    pub fn from_controllers(controllers: Vec<Arc<ReloadingController>>) -> Self {
        Self::new(move || controllers.clone())
    }

    pub fn sub_controllers(&self) -> Vec<Arc<ReloadingController>> {
        (self.provider)()
    }

    pub fn reset_reloading_state(&self) {
        for controller in self.sub_controllers() {
            controller.reset_reloading_state();
        }
    }
}

impl ReloadCheck for CombinedReloadingController {
    fn check_for_reloading(&self, data: Option<&str>) -> bool {
        // Every controller is checked, so all changed sources are reset
        self.sub_controllers()
            .iter()
            .map(|controller| controller.check_for_reloading(data))
            .fold(false, |any, reloading| any || reloading)
    }
}

impl std::fmt::Debug for CombinedReloadingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedReloadingController")
            .field("sub_controllers", &self.sub_controllers().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Detector driven by the test
    #[derive(Default)]
    struct ManualDetector {
        changed: Arc<AtomicBool>,
        failing: Arc<AtomicBool>,
        performed: Arc<AtomicUsize>,
    }

    impl ReloadingDetector for ManualDetector {
        fn is_reloading_required(&self) -> Result<bool, ConfigError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ConfigError::reload("source unreachable"));
            }
            Ok(self.changed.load(Ordering::SeqCst))
        }

        fn reloading_performed(&self) {
            self.changed.store(false, Ordering::SeqCst);
            self.performed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller() -> (Arc<ReloadingController>, Arc<AtomicBool>, Arc<AtomicBool>) {
        let detector = ManualDetector::default();
        let changed = Arc::clone(&detector.changed);
        let failing = Arc::clone(&detector.failing);
        (Arc::new(ReloadingController::new(detector)), changed, failing)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> ReloadingListener {
        let counter = Arc::clone(counter);
        Arc::new(move |event: &ReloadingEvent| {
            if matches!(event, ReloadingEvent::Reloading { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[test]
    fn test_no_change() {
        let (controller, _, _) = controller();
        assert!(!controller.check_for_reloading(None));
        assert!(!controller.is_in_reloading_state());
    }

    #[test]
    fn test_change_fires_once_until_reset() {
        let (controller, changed, _) = controller();
        let fired = Arc::new(AtomicUsize::new(0));
        controller.add_listener(counting(&fired));

        changed.store(true, Ordering::SeqCst);
        assert!(controller.check_for_reloading(Some("tenant-a")));
        assert!(controller.check_for_reloading(None));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        controller.reset_reloading_state();
        assert!(!controller.is_in_reloading_state());
        assert!(!controller.check_for_reloading(None));
    }

    #[test]
    fn test_event_carries_data() {
        let (controller, changed, _) = controller();
        let mut rx = controller.subscribe();

        changed.store(true, Ordering::SeqCst);
        controller.check_for_reloading(Some("tenant-a"));

        assert_eq!(
            rx.try_recv().unwrap(),
            ReloadingEvent::Reloading {
                data: Some("tenant-a".to_string())
            }
        );
    }

    #[test]
    fn test_failed_check_reports_and_returns_false() {
        let (controller, _, failing) = controller();
        let mut rx = controller.subscribe();

        failing.store(true, Ordering::SeqCst);
        assert!(!controller.check_for_reloading(None));
        assert!(!controller.is_in_reloading_state());
        assert!(matches!(
            rx.try_recv().unwrap(),
            ReloadingEvent::CheckFailed { .. }
        ));
    }

    #[test]
    fn test_combined_checks_every_controller() {
        let (first, first_changed, _) = controller();
        let (second, second_changed, _) = controller();
        let combined =
            CombinedReloadingController::from_controllers(vec![Arc::clone(&first), Arc::clone(&second)]);

        assert!(!combined.check_for_reloading(None));

        first_changed.store(true, Ordering::SeqCst);
        second_changed.store(true, Ordering::SeqCst);
        assert!(combined.check_for_reloading(None));
        assert!(first.is_in_reloading_state());
        assert!(second.is_in_reloading_state());

        combined.reset_reloading_state();
        assert!(!first.is_in_reloading_state());
        assert!(!second.is_in_reloading_state());
    }

    #[test]
    fn test_combined_isolates_unchanged_controllers() {
        let (first, first_changed, _) = controller();
        let (second, _, _) = controller();
        let combined =
            CombinedReloadingController::from_controllers(vec![Arc::clone(&first), Arc::clone(&second)]);

        first_changed.store(true, Ordering::SeqCst);
        assert!(combined.check_for_reloading(None));
        assert!(first.is_in_reloading_state());
        assert!(!second.is_in_reloading_state());
    }
}
