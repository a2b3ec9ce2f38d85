//! Configuration: app INI, server catalogue, and settings modules
//!
//! A config directory holds three files:
//!
//! - `gateway.ini` — process-level knobs (unified port, crypt key id,
//!   buffer size, log level, health interval)
//! - `servers.json` — the backend catalogue: a JSON array of profiles,
//!   UUID ids backfilled on first load and persisted back
//! - `settings.json` — runtime-tunable modules (`gateway` stickiness,
//!   `routing` rules), updated as module-keyed blobs

mod catalogue;
mod settings;

pub use catalogue::{load_catalogue, save_catalogue, CATALOGUE_FILE};
pub use settings::{Settings, SettingsManager, SettingsSubscriber, SETTINGS_FILE};

use std::path::{Path, PathBuf};

use ini::Ini;
use tracing::debug;

use crate::error::ConfigError;

/// App config file name inside the config directory
pub const APP_CONFIG_FILE: &str = "gateway.ini";

/// Process-level configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Unified gateway listen port (0 disables the gateway)
    pub unified_port: u16,
    /// Copy buffer size for session pumps
    pub buffer_size: usize,
    /// Shared cipher key id
    pub crypt_key: u32,
    /// Log level name (trace..error)
    pub log_level: String,
    /// Log output format: `text` or `json`
    pub log_format: String,
    /// Seconds between periodic health check cycles
    pub health_check_interval: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            unified_port: 7080,
            buffer_size: 32 * 1024,
            crypt_key: 125,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            health_check_interval: 30,
        }
    }
}

impl AppConfig {
    /// Load `gateway.ini` from `config_dir`, falling back to defaults for
    /// absent keys. A missing file yields the defaults.
    ///
    /// The crypt key can be overridden with the `CRYPT_KEY` environment
    /// variable, matching the deployment convention of the remote side.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ParseError` for unreadable or malformed INI
    /// content and `ConfigError::ValidationError` for out-of-range values.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(APP_CONFIG_FILE);
        let mut config = Self::default();

        if path.exists() {
            let file = Ini::load_from_file(&path)
                .map_err(|e| ConfigError::parse(format!("{}: {e}", path.display())))?;

            if let Some(port) = get_parsed(&file, "local", "unified_port")? {
                config.unified_port = port;
            }
            if let Some(size) = get_parsed(&file, "common", "buffer_size")? {
                config.buffer_size = size;
            }
            if let Some(key) = get_parsed(&file, "common", "crypt_key")? {
                config.crypt_key = key;
            }
            if let Some(level) = file.get_from(Some("common"), "log_level") {
                config.log_level = level.to_string();
            }
            if let Some(format) = file.get_from(Some("common"), "log_format") {
                config.log_format = format.to_string();
            }
            if let Some(interval) = get_parsed(&file, "common", "health_check_interval")? {
                config.health_check_interval = interval;
            }
            debug!(path = %path.display(), "Loaded app configuration");
        } else {
            debug!(path = %path.display(), "No app configuration file, using defaults");
        }

        if let Ok(key) = std::env::var("CRYPT_KEY") {
            config.crypt_key = key.parse().map_err(|_| {
                ConfigError::validation(format!("CRYPT_KEY '{key}' is not an integer"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < 1024 {
            return Err(ConfigError::validation(format!(
                "buffer_size {} is below the 1024-byte minimum",
                self.buffer_size
            )));
        }
        if self.health_check_interval == 0 {
            return Err(ConfigError::validation(
                "health_check_interval must be at least 1 second",
            ));
        }
        Ok(())
    }

    /// Path helpers for the sibling files
    #[must_use]
    pub fn catalogue_path(config_dir: &Path) -> PathBuf {
        config_dir.join(CATALOGUE_FILE)
    }

    /// Settings file path inside `config_dir`
    #[must_use]
    pub fn settings_path(config_dir: &Path) -> PathBuf {
        config_dir.join(SETTINGS_FILE)
    }
}

fn get_parsed<T: std::str::FromStr>(
    file: &Ini,
    section: &str,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match file.get_from(Some(section), key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            ConfigError::validation(format!("[{section}] {key}: '{raw}' is invalid"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rust-gateway-test-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_defaults_when_file_absent() {
        let dir = temp_dir("absent");
        let config = AppConfig::load(&dir).unwrap();
        assert_eq!(config.unified_port, 7080);
        assert_eq!(config.crypt_key, 125);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_ini_values() {
        let dir = temp_dir("values");
        std::fs::write(
            dir.join(APP_CONFIG_FILE),
            "[local]\nunified_port = 9090\n\n[common]\ncrypt_key = 77\nbuffer_size = 65536\nlog_level = debug\nhealth_check_interval = 10\n",
        )
        .unwrap();

        let config = AppConfig::load(&dir).unwrap();
        assert_eq!(config.unified_port, 9090);
        assert_eq!(config.crypt_key, 77);
        assert_eq!(config.buffer_size, 65536);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.health_check_interval, 10);
    }

    #[test]
    fn test_invalid_value_rejected() {
        let dir = temp_dir("invalid");
        std::fs::write(
            dir.join(APP_CONFIG_FILE),
            "[local]\nunified_port = not-a-port\n",
        )
        .unwrap();
        assert!(AppConfig::load(&dir).is_err());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = AppConfig::default();
        config.buffer_size = 16;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.health_check_interval = 0;
        assert!(config.validate().is_err());
    }
}
