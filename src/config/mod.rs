//! Runtime settings.
//!
//! Settings come from a TOML file and can be overridden through environment
//! variables. The file is looked up in this order: an explicit path, then
//! `$PROCPIPE_CONFIG`, then `config.toml` in the platform config directory.
//! A missing default file is not an error; a missing explicit one is.
//!
//! ```toml
//! buffer_size = 8192
//! poll_interval = "50ms"
//! null_device = "/dev/null"
//! ```

use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::subprocess::stream::DEFAULT_BUFFER_SIZE;

pub const CONFIG_PATH_VAR: &str = "PROCPIPE_CONFIG";
pub const BUFFER_SIZE_VAR: &str = "PROCPIPE_BUFFER_SIZE";
pub const POLL_INTERVAL_VAR: &str = "PROCPIPE_POLL_INTERVAL";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value {value:?} for {var}: {reason}")]
    InvalidOverride {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Capacity of each stream adapter's buffer, in bytes.
    pub buffer_size: usize,
    /// Interval between exit checks where no termination notification is
    /// available.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Where a detached child's standard streams go.
    pub null_device: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            null_device: PathBuf::from("/dev/null"),
        }
    }
}

/// Default location of the settings file for this platform.
pub fn default_settings_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "procpipe").map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<Settings>(content).map(Settings::normalized)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve the settings file, load it and apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        Self::load_with(explicit, |var| std::env::var(var).ok())
    }

    /// [`load`](Self::load) with a custom environment lookup.
    pub fn load_with<F>(explicit: Option<&Path>, lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = match explicit
            .map(Path::to_path_buf)
            .or_else(|| lookup(CONFIG_PATH_VAR).map(PathBuf::from))
        {
            Some(path) => {
                tracing::debug!("Loading settings from {}", path.display());
                Self::from_file(&path)?
            }
            None => match default_settings_path().filter(|path| path.exists()) {
                Some(path) => {
                    tracing::debug!("Loading settings from {}", path.display());
                    Self::from_file(&path)?
                }
                None => {
                    tracing::trace!("No settings file found, using defaults");
                    Self::default()
                }
            },
        };

        settings.apply_overrides(lookup)?;
        Ok(settings)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(BUFFER_SIZE_VAR) {
            self.buffer_size =
                value
                    .trim()
                    .parse()
                    .map_err(|err: std::num::ParseIntError| SettingsError::InvalidOverride {
                        var: BUFFER_SIZE_VAR,
                        value: value.clone(),
                        reason: err.to_string(),
                    })?;
        }

        if let Some(value) = lookup(POLL_INTERVAL_VAR) {
            self.poll_interval = humantime_serde::re::humantime::parse_duration(value.trim())
                .map_err(|err| SettingsError::InvalidOverride {
                    var: POLL_INTERVAL_VAR,
                    value: value.clone(),
                    reason: err.to_string(),
                })?;
        }

        *self = std::mem::take(self).normalized();
        Ok(())
    }

    fn normalized(mut self) -> Self {
        self.buffer_size = self.buffer_size.max(1);
        self.poll_interval = self.poll_interval.max(MIN_POLL_INTERVAL);
        self
    }
}
