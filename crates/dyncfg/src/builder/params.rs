//! Builder parameters
//!
//! Parameters are plain data with `serde` support, so an application can
//! declare its resolvers in its own TOML configuration:
//!
//! ```toml
//! file_pattern = "tenant-${ctx:tenant}.toml"
//! allow_fail_on_init = true
//!
//! [managed]
//! base_path = "/etc/app/tenants"
//! reloading = true
//! refresh_delay_ms = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ConfigError;
use crate::configuration::Format;
use crate::interpol::InterpolatorSpecification;

/// Default minimum interval between two modification checks of one file
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Parameters common to all builders
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicParameters {
    /// Produce an empty configuration instead of failing when the source cannot be loaded.
    /// Unset means `false`, and lets a baseline value through when used as an override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_fail_on_init: Option<bool>,
    /// Lookups used to evaluate patterns
    #[serde(skip)]
    pub interpolator: Option<InterpolatorSpecification>,
}

impl BasicParameters {
    pub fn with_allow_fail_on_init(mut self, allow: bool) -> Self {
        self.allow_fail_on_init = Some(allow);
        self
    }

    pub fn with_interpolator(mut self, spec: InterpolatorSpecification) -> Self {
        self.interpolator = Some(spec);
        self
    }

    pub fn allow_fail_on_init(&self) -> bool {
        self.allow_fail_on_init.unwrap_or(false)
    }

    /// Copy of these parameters without the interpolator
    pub fn without_interpolator(&self) -> Self {
        Self {
            allow_fail_on_init: self.allow_fail_on_init,
            interpolator: None,
        }
    }
}

/// Parameters of a single file-based builder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileParameters {
    #[serde(flatten)]
    pub basic: BasicParameters,
    /// Directory relative file names are resolved against
    pub base_path: Option<PathBuf>,
    /// File to load
    pub file_name: Option<String>,
    /// Forced format; guessed from the extension when unset
    pub format: Option<Format>,
    /// Attach a modification-time reloading controller; unset means `false`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reloading: Option<bool>,
    /// Minimum interval between two modification checks
    pub refresh_delay_ms: Option<u64>,
}

impl FileParameters {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: Some(file_name.into()),
            ..Default::default()
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_reloading(mut self, reloading: bool) -> Self {
        self.reloading = Some(reloading);
        self
    }

    /// Delays beyond `u64::MAX` milliseconds are clamped
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_allow_fail_on_init(mut self, allow: bool) -> Self {
        self.basic.allow_fail_on_init = Some(allow);
        self
    }

    pub fn reloading(&self) -> bool {
        self.reloading.unwrap_or(false)
    }

    /// Full path of the file, if a file name is set
    pub fn path(&self) -> Option<PathBuf> {
        let file_name = self.file_name.as_deref()?;
        Some(match &self.base_path {
            Some(base) => base.join(file_name),
            None => PathBuf::from(file_name),
        })
    }

    pub fn refresh_delay(&self) -> Duration {
        self.refresh_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REFRESH_DELAY)
    }

    /// Format to parse with: the forced one, else guessed from the path
    pub fn effective_format(&self, path: &Path) -> Option<Format> {
        self.format.or_else(|| Format::from_path(path))
    }

    /// Apply explicitly set values of `overrides` on top of these parameters
    pub fn apply(&mut self, overrides: &FileParameters) {
        if overrides.basic.allow_fail_on_init.is_some() {
            self.basic.allow_fail_on_init = overrides.basic.allow_fail_on_init;
        }
        if overrides.basic.interpolator.is_some() {
            self.basic.interpolator = overrides.basic.interpolator.clone();
        }
        if overrides.base_path.is_some() {
            self.base_path = overrides.base_path.clone();
        }
        if overrides.file_name.is_some() {
            self.file_name = overrides.file_name.clone();
        }
        if overrides.format.is_some() {
            self.format = overrides.format;
        }
        if overrides.reloading.is_some() {
            self.reloading = overrides.reloading;
        }
        if overrides.refresh_delay_ms.is_some() {
            self.refresh_delay_ms = overrides.refresh_delay_ms;
        }
    }
}

/// Parameters of a [`MultiFileBuilder`](super::MultiFileBuilder)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiFileParameters {
    /// Baseline parameters, also passed on to managed builders (minus the interpolator)
    #[serde(flatten)]
    pub basic: BasicParameters,
    /// Pattern evaluated on every access to obtain the file name
    pub file_pattern: Option<String>,
    /// Extra parameters for every managed builder
    pub managed: Option<FileParameters>,
}

impl MultiFileParameters {
    pub fn new(file_pattern: impl Into<String>) -> Self {
        Self {
            file_pattern: Some(file_pattern.into()),
            ..Default::default()
        }
    }

    /// Parse from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::parse(format!("TOML parse error: {e}")))
    }

    pub fn with_interpolator(mut self, spec: InterpolatorSpecification) -> Self {
        self.basic.interpolator = Some(spec);
        self
    }

    pub fn with_allow_fail_on_init(mut self, allow: bool) -> Self {
        self.basic.allow_fail_on_init = Some(allow);
        self
    }

    pub fn with_managed(mut self, managed: FileParameters) -> Self {
        self.managed = Some(managed);
        self
    }

    /// Shortcut for enabling reloading on every managed builder
    pub fn with_reloading(mut self, reloading: bool) -> Self {
        self.managed.get_or_insert_with(FileParameters::default).reloading = Some(reloading);
        self
    }

    /// Parameters for the managed builder of `file_name`.
    ///
    /// Baseline parameters without the interpolator, then the managed
    /// overrides (cloned, as they are shared by all managed builders), then
    /// the file name itself.
    pub fn managed_builder_parameters(&self, file_name: &str) -> FileParameters {
        let mut params = FileParameters {
            basic: self.basic.without_interpolator(),
            ..Default::default()
        };
        if let Some(managed) = &self.managed {
            params.apply(managed);
        }
        params.file_name = Some(file_name.to_string());
        params
    }
}
