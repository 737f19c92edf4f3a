//! File modification time detector

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

use super::ReloadingDetector;
use crate::ConfigError;
use crate::builder::DEFAULT_REFRESH_DELAY;

#[derive(Debug, Default)]
struct DetectorState {
    /// Modification time of the file when it was last loaded
    last_modified: Option<SystemTime>,
    /// Modification time seen when the load in progress started
    loading: Option<SystemTime>,
    last_checked: Option<Instant>,
}

/// Detects changes by comparing a file's modification time with the one
/// recorded at the last load.
///
/// Checks within `refresh_delay` of the previous check are answered with
/// `false` without touching the file system.
#[derive(Debug)]
pub struct FileModificationDetector {
    path: PathBuf,
    refresh_delay: Duration,
    state: Mutex<DetectorState>,
}

impl FileModificationDetector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            refresh_delay: DEFAULT_REFRESH_DELAY,
            state: Mutex::new(DetectorState::default()),
        }
    }

    pub fn with_refresh_delay(mut self, refresh_delay: Duration) -> Self {
        self.refresh_delay = refresh_delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn refresh_delay(&self) -> Duration {
        self.refresh_delay
    }

    fn modification_time(&self) -> Result<SystemTime, ConfigError> {
        Ok(std::fs::metadata(&self.path)?.modified()?)
    }
}

impl ReloadingDetector for FileModificationDetector {
    fn is_reloading_required(&self) -> Result<bool, ConfigError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(last_checked) = state.last_checked
            && now.duration_since(last_checked) < self.refresh_delay
        {
            return Ok(false);
        }
        state.last_checked = Some(now);

        let modified = self.modification_time()?;
        match state.last_modified {
            None => {
                // First check without a recorded load: take it as the baseline
                state.last_modified = Some(modified);
                Ok(false)
            }
            Some(previous) => {
                let changed = modified != previous;
                if changed {
                    debug!(path = %self.path.display(), "File modification time changed");
                }
                Ok(changed)
            }
        }
    }

    fn loading_started(&self) {
        let modified = self.modification_time().ok();
        self.state.lock().unwrap_or_else(PoisonError::into_inner).loading = modified;
    }

    fn reloading_performed(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let modified = state.loading.take().or_else(|| self.modification_time().ok());
        if modified.is_some() {
            state.last_modified = modified;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    fn touch(path: &Path, offset_secs: u64) {
        let time = SystemTime::now() + Duration::from_secs(offset_secs);
        filetime::set_file_mtime(path, FileTime::from_system_time(time)).unwrap();
    }

    #[test]
    fn test_detects_modification() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");
        std::fs::write(&path, "a = 1").unwrap();

        let detector = FileModificationDetector::new(&path).with_refresh_delay(Duration::ZERO);
        detector.reloading_performed();
        assert!(!detector.is_reloading_required().unwrap());

        touch(&path, 10);
        assert!(detector.is_reloading_required().unwrap());
        // still pending until the reload is performed
        assert!(detector.is_reloading_required().unwrap());

        detector.reloading_performed();
        assert!(!detector.is_reloading_required().unwrap());
    }

    #[test]
    fn test_change_during_load_is_detected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");
        std::fs::write(&path, "a = 1").unwrap();

        let detector = FileModificationDetector::new(&path).with_refresh_delay(Duration::ZERO);
        detector.loading_started();
        // Written after the load started reading
        std::fs::write(&path, "a = 2").unwrap();
        touch(&path, 10);
        detector.reloading_performed();

        assert!(detector.is_reloading_required().unwrap());
        detector.loading_started();
        detector.reloading_performed();
        assert!(!detector.is_reloading_required().unwrap());
    }

    #[test]
    fn test_first_check_sets_baseline() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");
        std::fs::write(&path, "a = 1").unwrap();

        let detector = FileModificationDetector::new(&path).with_refresh_delay(Duration::ZERO);
        assert!(!detector.is_reloading_required().unwrap());
        touch(&path, 20);
        assert!(detector.is_reloading_required().unwrap());
    }

    #[test]
    fn test_refresh_delay_suppresses_checks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");
        std::fs::write(&path, "a = 1").unwrap();

        let detector =
            FileModificationDetector::new(&path).with_refresh_delay(Duration::from_secs(3600));
        detector.reloading_performed();
        assert!(!detector.is_reloading_required().unwrap());

        touch(&path, 10);
        assert!(!detector.is_reloading_required().unwrap());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let detector = FileModificationDetector::new("/nonexistent/dyncfg/app.toml")
            .with_refresh_delay(Duration::ZERO);
        assert!(matches!(
            detector.is_reloading_required(),
            Err(ConfigError::Io(_))
        ));
    }
}
