//! Configuration file for the worker bridge
//!
//! The file lives at `~/.config/halftone/halftone.toml` (Windows:
//! `%APPDATA%\halftone\halftone.toml`) unless `HALFTONE_CONFIG` points
//! elsewhere. Every key is optional; accessors fall back to built-in defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod timeouts;

pub use timeouts::{RestartConfig, TimeoutConfig};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "HALFTONE_CONFIG";

/// Environment variable overriding the worker script location
pub const WORKER_SCRIPT_ENV: &str = "HALFTONE_WORKER_SCRIPT";

/// Minimum interpreter version when none is configured
pub const DEFAULT_MIN_PYTHON: (u8, u8) = (3, 9);

/// Packages the worker imports, as `import=install` pairs
pub const DEFAULT_PACKAGES: &[&str] = &[
    "numpy=numpy",
    "cv2=opencv-python-headless",
    "PIL=Pillow",
    "cairosvg=cairosvg",
];

/// Keys accepted by [`Config::get`] and [`Config::set`]
pub const KNOWN_KEYS: &[&str] = &[
    "runtime",
    "worker-script",
    "min-python",
    "packages",
    "raster-export",
    "timeouts.version-check",
    "timeouts.probe",
    "timeouts.install",
    "timeouts.native-install",
    "timeouts.ready",
    "timeouts.ingest",
    "timeouts.recompute",
    "timeouts.export",
    "timeouts.ping",
    "restart.max-restarts",
    "restart.backoff-ms",
    "restart.backoff-max-ms",
];

/// Error type for configuration handling
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read or written
    Io(PathBuf, std::io::Error),
    /// The config file is not valid TOML for this schema
    Parse(PathBuf, String),
    /// Serializing the config failed
    Serialize(String),
    /// `set` was called with a key this file does not know
    UnknownKey(String),
    /// `set` was called with a value that does not parse for the key
    InvalidValue { key: String, value: String },
    /// No home/config directory could be determined
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config file {}: {}", path.display(), e),
            ConfigError::Parse(path, msg) => {
                write!(f, "Failed to parse config {}: {}", path.display(), msg)
            }
            ConfigError::Serialize(msg) => write!(f, "Failed to serialize config: {}", msg),
            ConfigError::UnknownKey(key) => write!(f, "Unknown config key '{}'", key),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value '{}' for config key '{}'", value, key)
            }
            ConfigError::NoConfigDir => write!(f, "Could not determine config directory"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Interpreter to use instead of discovery (bare name or path)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_script: Option<String>,
    /// Minimum interpreter version, e.g. "3.9"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_python: Option<String>,
    /// Required packages as `import=install` pairs (or a single shared name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<Vec<String>>,
    /// Whether PNG/JPG export (and so the native library step) is wanted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raster_export: Option<bool>,
    #[serde(default, skip_serializing_if = "TimeoutConfig::is_empty")]
    pub timeouts: TimeoutConfig,
    #[serde(default, skip_serializing_if = "RestartConfig::is_empty")]
    pub restart: RestartConfig,
}

impl Config {
    pub fn path() -> Result<PathBuf, ConfigError> {
        // Honor explicit override for tests / isolated runs.
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let trimmed = env_path.trim();
            if !trimmed.is_empty() {
                return Ok(PathBuf::from(trimmed));
            }
        }

        Ok(config_dir()?.join("halftone.toml"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io(parent.to_path_buf(), e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "runtime" => self.runtime.clone(),
            "worker-script" => self.worker_script.clone(),
            "min-python" => self.min_python.clone(),
            "packages" => self.packages.as_ref().map(|p| p.join(",")),
            "raster-export" => self.raster_export.map(|b| b.to_string()),
            _ => {
                if let Some(name) = key.strip_prefix("timeouts.") {
                    self.timeouts.get(name).map(|v| v.to_string())
                } else if let Some(name) = key.strip_prefix("restart.") {
                    self.restart.get(name).map(|v| v.to_string())
                } else {
                    None
                }
            }
        }
    }

    pub fn set(&mut self, key: &str, value: String) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.clone(),
        };
        match key {
            "runtime" => self.runtime = Some(value),
            "worker-script" => self.worker_script = Some(value),
            "min-python" => {
                parse_version(&value).ok_or_else(invalid)?;
                self.min_python = Some(value);
            }
            "packages" => {
                let packages: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if packages.is_empty() {
                    return Err(invalid());
                }
                self.packages = Some(packages);
            }
            "raster-export" => self.raster_export = Some(value.parse().map_err(|_| invalid())?),
            _ => {
                if let Some(name) = key.strip_prefix("timeouts.") {
                    let secs = value.parse().map_err(|_| invalid())?;
                    if !self.timeouts.set(name, secs) {
                        return Err(ConfigError::UnknownKey(key.to_string()));
                    }
                } else if let Some(name) = key.strip_prefix("restart.") {
                    let number = value.parse().map_err(|_| invalid())?;
                    if !self.restart.set(name, number) {
                        return Err(ConfigError::UnknownKey(key.to_string()));
                    }
                } else {
                    return Err(ConfigError::UnknownKey(key.to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self == Config::default()
    }

    pub fn values_iter(&self) -> Vec<(&'static str, String)> {
        KNOWN_KEYS
            .iter()
            .filter_map(|key| self.get(key).map(|v| (*key, v)))
            .collect()
    }

    /// Configured interpreter, resolved against PATH when given as a bare name
    pub fn resolved_runtime(&self) -> Option<PathBuf> {
        let runtime = self.runtime.as_deref()?.trim();
        if runtime.is_empty() {
            return None;
        }
        let path = Path::new(runtime);
        if path.components().count() > 1 {
            return Some(path.to_path_buf());
        }
        which::which(runtime).ok()
    }

    /// Location of the worker entry script
    ///
    /// Order: config value, `HALFTONE_WORKER_SCRIPT`, `backend/cli_bridge.py`
    /// next to the running executable, `backend/cli_bridge.py` in the cwd.
    pub fn worker_script_path(&self) -> PathBuf {
        if let Some(ref script) = self.worker_script {
            return PathBuf::from(script);
        }
        if let Ok(script) = std::env::var(WORKER_SCRIPT_ENV) {
            let trimmed = script.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
        let relative = Path::new("backend").join("cli_bridge.py");
        if let Some(beside_exe) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&relative)))
        {
            if beside_exe.is_file() {
                return beside_exe;
            }
        }
        relative
    }

    pub fn min_python(&self) -> (u8, u8) {
        self.min_python
            .as_deref()
            .and_then(parse_version)
            .unwrap_or(DEFAULT_MIN_PYTHON)
    }

    /// Required packages as `(import name, install name)` pairs
    pub fn packages(&self) -> Vec<(String, String)> {
        match self.packages {
            Some(ref entries) => entries.iter().map(|e| split_package(e)).collect(),
            None => DEFAULT_PACKAGES.iter().map(|e| split_package(e)).collect(),
        }
    }

    pub fn raster_export(&self) -> bool {
        self.raster_export.unwrap_or(true)
    }

    pub fn restart_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.restart.backoff_ms()),
            Duration::from_millis(self.restart.backoff_max_ms()),
        )
    }
}

fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(not(target_os = "windows"))]
    let dir = dirs::home_dir()
        .ok_or(ConfigError::NoConfigDir)?
        .join(".config")
        .join("halftone");

    #[cfg(target_os = "windows")]
    let dir = dirs::config_dir()
        .ok_or(ConfigError::NoConfigDir)?
        .join("halftone");

    Ok(dir)
}

/// Parse "3.11" (or "3.11.4") into `(3, 11)`
pub fn parse_version(value: &str) -> Option<(u8, u8)> {
    let mut parts = value.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn split_package(entry: &str) -> (String, String) {
    match entry.split_once('=') {
        Some((import, install)) => (import.trim().to_string(), install.trim().to_string()),
        None => (entry.trim().to_string(), entry.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_new() {
        let config = Config::default();
        assert!(config.is_empty());
        assert_eq!(config.min_python(), DEFAULT_MIN_PYTHON);
        assert!(config.raster_export());
    }

    #[test]
    fn test_config_set_get() {
        let mut config = Config::default();
        assert!(config.set("runtime", "/usr/bin/python3".to_string()).is_ok());
        assert_eq!(config.get("runtime"), Some("/usr/bin/python3".to_string()));
        assert!(!config.is_empty());
    }

    #[test]
    fn test_config_unknown_key() {
        let mut config = Config::default();
        let err = config.set("unknown-key", "value".to_string());
        assert!(matches!(err, Err(ConfigError::UnknownKey(_))));
        assert_eq!(config.get("unknown-key"), None);

        let err = config.set("timeouts.forever", "3".to_string());
        assert!(matches!(err, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_config_invalid_values_rejected() {
        let mut config = Config::default();
        assert!(config.set("min-python", "three".to_string()).is_err());
        assert!(config.set("timeouts.probe", "-1".to_string()).is_err());
        assert!(config.set("raster-export", "maybe".to_string()).is_err());
        assert!(config.is_empty());
    }

    #[test]
    fn test_packages_default_and_override() {
        let mut config = Config::default();
        let defaults = config.packages();
        assert!(defaults.contains(&("cv2".to_string(), "opencv-python-headless".to_string())));
        assert_eq!(defaults.len(), DEFAULT_PACKAGES.len());

        assert!(config.set("packages", "numpy, PIL=Pillow".to_string()).is_ok());
        assert_eq!(
            config.packages(),
            vec![
                ("numpy".to_string(), "numpy".to_string()),
                ("PIL".to_string(), "Pillow".to_string()),
            ]
        );
    }

    #[test]
    fn test_timeouts_fall_back_to_defaults() {
        let mut config = Config::default();
        assert_eq!(config.timeouts.probe(), Duration::from_secs(30));
        assert!(config.set("timeouts.probe", "5".to_string()).is_ok());
        assert_eq!(config.timeouts.probe(), Duration::from_secs(5));
        assert_eq!(config.get("timeouts.probe"), Some("5".to_string()));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let Ok(dir) = TempDir::new() else {
            return;
        };
        let path = dir.path().join("nested").join("halftone.toml");

        let mut config = Config::default();
        assert!(config.set("worker-script", "/opt/halftone/cli_bridge.py".to_string()).is_ok());
        assert!(config.set("restart.max-restarts", "0".to_string()).is_ok());
        assert!(config.save_to(&path).is_ok());

        let loaded = Config::load_from(&path);
        assert!(loaded.is_ok_and(|c| c == config));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let missing = PathBuf::from("/tmp/halftone_missing_config_12345.toml");
        assert!(Config::load_from(&missing).is_ok_and(|c| c.is_empty()));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3.11"), Some((3, 11)));
        assert_eq!(parse_version("3.12.4"), Some((3, 12)));
        assert_eq!(parse_version("3"), None);
    }

    #[test]
    fn test_values_iter_lists_only_set_keys() {
        let mut config = Config::default();
        assert!(config.set("timeouts.export", "90".to_string()).is_ok());
        assert_eq!(config.values_iter(), vec![("timeouts.export", "90".to_string())]);
    }
}
