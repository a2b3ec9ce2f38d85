//! Runtime settings modules: `settings.json`
//!
//! Two modules are visible to the core: `gateway` (sticky-session policy)
//! and `routing` (the ordered rule list). Updates arrive as opaque JSON
//! blobs keyed by module name; the manager validates, persists, and
//! notifies the subscribers registered for that module.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::rules::RoutingSettings;
use crate::sticky::StickySettings;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "settings.json";

/// The settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Gateway module: sticky-session policy
    #[serde(default)]
    pub gateway: StickySettings,
    /// Routing module: ordered rule list
    #[serde(default)]
    pub routing: RoutingSettings,
}

/// Receives module updates after they are validated and stored
pub trait SettingsSubscriber: Send + Sync {
    /// Apply one module's new payload.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the payload cannot be applied; the stored
    /// settings are already updated at this point, so failures are logged
    /// rather than rolled back.
    fn on_settings_update(&self, module: &str, value: &serde_json::Value)
        -> Result<(), ConfigError>;
}

/// Owns the settings document and its subscriber registry
pub struct SettingsManager {
    path: PathBuf,
    current: parking_lot::RwLock<Settings>,
    subscribers: parking_lot::RwLock<Vec<(String, Arc<dyn SettingsSubscriber>)>>,
}

impl SettingsManager {
    /// Load `settings.json` (a missing file yields defaults).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unreadable or malformed content.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let settings = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| ConfigError::parse(format!("{}: {e}", path.display())))?
        } else {
            debug!(path = %path.display(), "No settings file, using defaults");
            Settings::default()
        };

        Ok(Self {
            path,
            current: parking_lot::RwLock::new(settings),
            subscribers: parking_lot::RwLock::new(Vec::new()),
        })
    }

    /// Current settings (cloned)
    #[must_use]
    pub fn get(&self) -> Settings {
        self.current.read().clone()
    }

    /// Register `subscriber` for updates to `module`
    pub fn register(&self, module: impl Into<String>, subscriber: Arc<dyn SettingsSubscriber>) {
        self.subscribers.write().push((module.into(), subscriber));
    }

    /// Apply a module update: validate, store, persist, notify.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownModule` for unrecognized keys and
    /// parse errors for payloads that do not match the module's shape.
    pub fn update_module(
        &self,
        module: &str,
        value: serde_json::Value,
    ) -> Result<(), ConfigError> {
        {
            let mut current = self.current.write();
            match module {
                "gateway" => {
                    let parsed: StickySettings = serde_json::from_value(value.clone())
                        .map_err(|e| ConfigError::parse(format!("gateway module: {e}")))?;
                    current.gateway = parsed;
                }
                "routing" => {
                    let parsed: RoutingSettings = serde_json::from_value(value.clone())
                        .map_err(|e| ConfigError::parse(format!("routing module: {e}")))?;
                    current.routing = parsed;
                }
                other => return Err(ConfigError::UnknownModule(other.to_string())),
            }
        }

        self.persist()?;

        for (registered, subscriber) in self.subscribers.read().iter() {
            if registered == module {
                if let Err(e) = subscriber.on_settings_update(module, &value) {
                    warn!(module, error = %e, "Settings subscriber rejected update");
                }
            }
        }
        debug!(module, "Settings module updated");
        Ok(())
    }

    /// Re-deliver the current payload of `module` to its subscribers.
    /// Used after state publications that may shift rule outcomes.
    pub fn renotify(&self, module: &str) {
        let value = {
            let current = self.current.read();
            match module {
                "gateway" => serde_json::to_value(&current.gateway),
                "routing" => serde_json::to_value(&current.routing),
                _ => return,
            }
        };
        let Ok(value) = value else { return };

        for (registered, subscriber) in self.subscribers.read().iter() {
            if registered == module {
                if let Err(e) = subscriber.on_settings_update(module, &value) {
                    warn!(module, error = %e, "Settings subscriber rejected renotify");
                }
            }
        }
    }

    fn persist(&self) -> Result<(), ConfigError> {
        let json = {
            let current = self.current.read();
            serde_json::to_string_pretty(&*current)
                .map_err(|e| ConfigError::parse(e.to_string()))?
        };
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Path of the managed file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sticky::StickyMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rust-gateway-settings-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(SETTINGS_FILE)
    }

    #[test]
    fn test_load_defaults() {
        let path = temp_path("defaults");
        let _ = std::fs::remove_file(&path);
        let manager = SettingsManager::load(&path).unwrap();
        let settings = manager.get();
        assert_eq!(settings.gateway.sticky_session_mode, StickyMode::Disabled);
        assert!(settings.routing.rules.is_empty());
    }

    #[test]
    fn test_update_module_persists_and_notifies() {
        struct Counter(AtomicUsize);
        impl SettingsSubscriber for Counter {
            fn on_settings_update(
                &self,
                module: &str,
                _value: &serde_json::Value,
            ) -> Result<(), ConfigError> {
                assert_eq!(module, "gateway");
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let path = temp_path("update");
        let _ = std::fs::remove_file(&path);
        let manager = SettingsManager::load(&path).unwrap();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        manager.register("gateway", counter.clone());

        manager
            .update_module(
                "gateway",
                serde_json::json!({
                    "sticky_session_mode": "global",
                    "sticky_session_ttl": 600
                }),
            )
            .unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get().gateway.sticky_session_ttl, 600);

        // Reload sees the persisted value
        let reloaded = SettingsManager::load(&path).unwrap();
        assert_eq!(reloaded.get().gateway.sticky_session_mode, StickyMode::Global);
    }

    #[test]
    fn test_unknown_module_rejected() {
        let path = temp_path("unknown");
        let _ = std::fs::remove_file(&path);
        let manager = SettingsManager::load(&path).unwrap();
        let err = manager
            .update_module("metrics", serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModule(_)));
    }

    #[test]
    fn test_bad_payload_rejected_without_store() {
        let path = temp_path("badpayload");
        let _ = std::fs::remove_file(&path);
        let manager = SettingsManager::load(&path).unwrap();

        let err = manager
            .update_module("routing", serde_json::json!({"rules": "not-an-array"}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
        assert!(manager.get().routing.rules.is_empty());
    }
}
