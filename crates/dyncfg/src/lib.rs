//! Context-dependent configuration for multi-tenant services
//!
//! This crate resolves a logical configuration whose backing file changes with
//! the caller's context (tenant, locale, environment):
//! - Evaluates a file name pattern like `conf/${ctx:tenant}/app.toml` on every access
//! - Caches exactly one file-based builder per resolved file name
//! - Detects changed files and resets the affected builder without blocking readers
//! - Layers a context-dependent source over static defaults
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       MultiFileBuilder                           │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │ Reentrancy   │──▶│ Interpolator │──▶│ managed builders     │  │
//! │  │ guard        │   │ (shared)     │   │ key → FileBuilder    │  │
//! │  └──────────────┘   └──────────────┘   └──────────┬───────────┘  │
//! └───────────────────────────────────────────────────┼──────────────┘
//!                                                     │
//!              ┌──────────────────────┐      ┌────────▼────────┐
//!              │ ReloadingController  │─────▶│  Configuration  │
//!              │ (mtime detector)     │reset │  (Arc snapshot) │
//!              └──────────────────────┘      └────────┬────────┘
//!                                                     │
//!                                     DynamicCombinedConfiguration
//! ```

pub mod builder;
pub mod combined;
pub mod configuration;
pub mod events;
pub mod guard;
pub mod interpol;
pub mod reloading;

// Re-export main types
pub use builder::{
    BasicParameters, ConfigurationBuilder, FileBasedBuilder, FileParameters, MultiFileBuilder,
    MultiFileParameters,
};
pub use combined::DynamicCombinedConfiguration;
pub use configuration::{Configuration, Format};
pub use events::{BuilderEvent, BuilderEventType, BuilderListener};
pub use interpol::{ConfigurationInterpolator, InterpolatorSpecification, Lookup};
pub use reloading::{
    CombinedReloadingController, FileModificationDetector, ReloadCheck, ReloadWatcher,
    ReloadingController, ReloadingDetector, ReloadingEvent, WatchConfig, WatchHandle,
};

/// Error types for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Failed to load configuration from {location}: {source}")]
    SourceLoad {
        location: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Reload error: {0}")]
    Reload(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Duplicate source name: {0}")]
    DuplicateSource(String),
}

impl ConfigError {
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn reload(msg: impl Into<String>) -> Self {
        Self::Reload(msg.into())
    }

    pub fn watcher(msg: impl Into<String>) -> Self {
        Self::Watcher(msg.into())
    }

    /// Wrap an underlying failure as a load error for `location`
    pub fn source_load(
        location: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SourceLoad {
            location: location.into(),
            source: source.into(),
        }
    }
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
