//! Configuration builders
//!
//! This module provides the builders that produce [`Configuration`] snapshots:
//! - File: loads one file and caches the result until reset or reload
//! - Multi-file: picks a file per call by evaluating a pattern, and keeps one
//!   managed file builder per resolved file name

mod cache;
mod file;
mod multi_file;
mod params;

pub use cache::ManagedBuilders;
pub use file::FileBasedBuilder;
pub use multi_file::MultiFileBuilder;
pub use params::{BasicParameters, DEFAULT_REFRESH_DELAY, FileParameters, MultiFileParameters};

use crate::ConfigError;
use crate::configuration::Configuration;
use crate::events::BuilderListener;

use std::sync::Arc;

/// Trait for configuration builders
///
/// Two kinds of listeners can be registered:
/// - *event* listeners see what happens to the configuration (created, load failed)
/// - *builder* listeners are told when the builder's result was reset
pub trait ConfigurationBuilder: Send + Sync {
    /// Current configuration, loading it if necessary
    fn configuration(&self) -> Result<Arc<Configuration>, ConfigError>;

    /// Discard the cached result; the next access creates a new one
    fn reset_result(&self);

    /// Discard all derived state
    fn reset_parameters(&self);

    fn add_event_listener(&self, listener: BuilderListener);

    fn remove_event_listener(&self, listener: &BuilderListener) -> bool;

    fn add_builder_listener(&self, listener: BuilderListener);

    fn remove_builder_listener(&self, listener: &BuilderListener) -> bool;
}
