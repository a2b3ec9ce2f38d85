//! The application controller
//!
//! Owns the A-zone: loads the catalogue, runs the instance lifecycle,
//! merges health results, and publishes snapshots to the B-zone the
//! dispatcher reads. Also the process's `FailureReporter`: five failures
//! against one backend trigger a one-shot probe for just that backend.
//!
//! Lock discipline: configuration changes and health merges take the
//! A-zone write lock; `publish()` takes only its read lock; probes never
//! run under a lock (the instance handle is cloned out first).

pub mod status;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{load_catalogue, save_catalogue, AppConfig, SettingsManager};
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, GatewayError, StrategyError};
use crate::health::Checker;
use crate::state::{
    FailureReporter, HealthStatus, ServerProfile, ServerState, StateSnapshot, StateStore,
};
use crate::strategy::build_strategy;

/// Consecutive failures that trigger a one-shot probe
pub const FAILURE_THRESHOLD: u32 = 5;

/// Application controller
pub struct AppController {
    config: Arc<AppConfig>,
    config_dir: PathBuf,
    store: Arc<StateStore>,
    dispatcher: Arc<Dispatcher>,
    settings: Arc<SettingsManager>,
    checker: Checker,
    failure_counters: parking_lot::Mutex<HashMap<String, u32>>,
    /// Serializes catalogue writes
    catalogue_lock: tokio::sync::Mutex<()>,
    self_ref: OnceLock<Weak<AppController>>,
    closed: AtomicBool,
}

impl AppController {
    /// Wire up the controller, settings manager, and dispatcher.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from the settings file and rule
    /// compilation errors from the initial routing settings.
    pub fn new(config: Arc<AppConfig>, config_dir: PathBuf) -> Result<Arc<Self>, GatewayError> {
        let store = Arc::new(StateStore::new());
        let settings = Arc::new(SettingsManager::load(AppConfig::settings_path(&config_dir))?);

        let initial = settings.get();
        let provider: Arc<dyn crate::state::StateProvider> = store.clone() as Arc<dyn crate::state::StateProvider>;
        let dispatcher = Arc::new(Dispatcher::new(provider, &initial.gateway, &initial.routing)?);

        settings.register("gateway", dispatcher.clone() as Arc<dyn crate::config::SettingsSubscriber>);
        settings.register("routing", dispatcher.clone() as Arc<dyn crate::config::SettingsSubscriber>);

        let controller = Arc::new(Self {
            config,
            config_dir,
            store,
            dispatcher,
            settings,
            checker: Checker::new(),
            failure_counters: parking_lot::Mutex::new(HashMap::new()),
            catalogue_lock: tokio::sync::Mutex::new(()),
            self_ref: OnceLock::new(),
            closed: AtomicBool::new(false),
        });
        let _ = controller.self_ref.set(Arc::downgrade(&controller));
        Ok(controller)
    }

    /// The dispatcher bound to this controller's published state
    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// The settings manager
    #[must_use]
    pub fn settings(&self) -> Arc<SettingsManager> {
        Arc::clone(&self.settings)
    }

    /// Whether shutdown has begun
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Full startup sequence: catalogue into the A-zone, instances up,
    /// initial probes, first publication.
    ///
    /// # Errors
    ///
    /// Returns catalogue errors; individual instance failures only
    /// deactivate their profile.
    pub async fn bootstrap(&self) -> Result<(), GatewayError> {
        info!("Starting bootstrap sequence");

        let path = AppConfig::catalogue_path(&self.config_dir);
        let (profiles, ids_assigned) = load_catalogue(&path)?;

        {
            let mut zone = self.store.config_state_mut().await;
            zone.clear();
            for profile in profiles {
                let profile = Arc::new(profile);
                zone.insert(profile.id.clone(), ServerState::new(profile));
            }
            self.manage_instances(&mut zone).await;
        }

        if ids_assigned {
            self.save_catalogue_now().await;
        }

        info!("Running initial health checks");
        self.run_health_checks().await;

        // Health checks publish on change; this publication makes the
        // first snapshot unconditional
        self.store.publish().await;
        info!("Bootstrap complete");
        Ok(())
    }

    /// Instance lifecycle pass over the A-zone (caller holds the write
    /// lock): tear down instances whose profile went inactive, start
    /// instances for profiles that want one.
    async fn manage_instances(&self, zone: &mut StateSnapshot) {
        for state in zone.values_mut() {
            if !state.profile.active {
                if let Some(instance) = state.instance.take() {
                    info!(remarks = %state.profile.remarks, "Deactivating instance");
                    instance.close().await;
                    state.health = HealthStatus::Unknown;
                }
            }
        }

        for state in zone.values_mut() {
            if state.profile.active && state.instance.is_none() {
                info!(remarks = %state.profile.remarks, "Activating instance");
                let instance = match build_strategy(&self.config, Arc::clone(&state.profile)) {
                    Ok(instance) => instance,
                    Err(e) => {
                        error!(remarks = %state.profile.remarks, error = %e, "Failed to build strategy");
                        deactivate_profile(state);
                        continue;
                    }
                };

                match instance.initialize().await {
                    Ok(()) => {
                        state.health = HealthStatus::Up;
                        debug!(
                            remarks = %state.profile.remarks,
                            listen_addr = ?instance.listen_addr(),
                            "Instance initialized"
                        );
                        state.instance = Some(instance);
                    }
                    Err(e) => {
                        error!(remarks = %state.profile.remarks, error = %e, "Failed to initialize strategy");
                        instance.close().await;
                        deactivate_profile(state);
                    }
                }
            }
        }
    }

    /// Flip one profile's desired state, apply it, publish, persist.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for unknown server ids.
    pub async fn update_server_active_state(
        &self,
        id: &str,
        active: bool,
    ) -> Result<(), GatewayError> {
        {
            let mut zone = self.store.config_state_mut().await;
            {
                let state = zone
                    .get_mut(id)
                    .ok_or_else(|| ConfigError::validation(format!("unknown server id {id}")))?;

                if state.profile.active == active {
                    return Ok(());
                }
                info!(remarks = %state.profile.remarks, active, "Updating server active state");
                let mut profile = (*state.profile).clone();
                profile.active = active;
                state.profile = Arc::new(profile);
            }
            self.manage_instances(&mut zone).await;
        }

        self.store.publish().await;
        self.save_catalogue_now().await;
        Ok(())
    }

    /// Add a profile (assigning an id if absent) and start it if active.
    ///
    /// # Errors
    ///
    /// Returns a validation error for duplicate ids.
    pub async fn add_server_profile(
        &self,
        mut profile: ServerProfile,
    ) -> Result<String, GatewayError> {
        if profile.id.is_empty() {
            profile.id = Uuid::new_v4().to_string();
        }
        let id = profile.id.clone();

        {
            let mut zone = self.store.config_state_mut().await;
            if zone.contains_key(&id) {
                return Err(ConfigError::validation(format!("server id {id} already exists")).into());
            }
            zone.insert(id.clone(), ServerState::new(Arc::new(profile)));
            self.manage_instances(&mut zone).await;
        }

        self.store.publish().await;
        self.save_catalogue_now().await;
        Ok(id)
    }

    /// Replace a profile. The active flag is managed separately and is
    /// preserved; multiplexed instances hot-swap, others are rebuilt.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown ids.
    pub async fn update_server_profile(
        &self,
        id: &str,
        mut updated: ServerProfile,
    ) -> Result<(), GatewayError> {
        {
            let mut zone = self.store.config_state_mut().await;
            let needs_rebuild;
            {
                let state = zone
                    .get_mut(id)
                    .ok_or_else(|| ConfigError::validation(format!("unknown server id {id}")))?;

                updated.id = id.to_string();
                updated.active = state.profile.active;
                let updated = Arc::new(updated);
                state.profile = Arc::clone(&updated);

                needs_rebuild = match &state.instance {
                    None => false,
                    Some(instance) => match instance.update_profile(updated) {
                        Ok(()) => {
                            debug!(id, "Instance hot-swapped profile");
                            false
                        }
                        Err(StrategyError::HotUpdateUnsupported) => {
                            info!(id, "Rebuilding instance for profile update");
                            true
                        }
                        Err(e) => {
                            warn!(id, error = %e, "Profile hot-swap failed, rebuilding");
                            true
                        }
                    },
                };
                if needs_rebuild {
                    if let Some(old) = state.instance.take() {
                        old.close().await;
                    }
                }
            }
            if needs_rebuild {
                self.manage_instances(&mut zone).await;
            }
        }

        self.store.publish().await;
        self.save_catalogue_now().await;
        Ok(())
    }

    /// Remove a profile, tearing down its instance first.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown ids.
    pub async fn delete_server_profile(&self, id: &str) -> Result<(), GatewayError> {
        {
            let mut zone = self.store.config_state_mut().await;
            let Some(mut state) = zone.remove(id) else {
                return Err(ConfigError::validation(format!("unknown server id {id}")).into());
            };
            if let Some(instance) = state.instance.take() {
                info!(id, "Closing instance before deleting profile");
                instance.close().await;
            }
        }

        self.store.publish().await;
        self.save_catalogue_now().await;
        Ok(())
    }

    /// The published snapshot (what dispatch sees)
    #[must_use]
    pub fn server_states(&self) -> Arc<StateSnapshot> {
        self.store.snapshot()
    }

    /// Profiles sorted by remarks, for stable listings
    pub async fn server_profiles_sorted(&self) -> Vec<Arc<ServerProfile>> {
        let zone = self.store.config_state().await;
        let mut profiles: Vec<Arc<ServerProfile>> =
            zone.values().map(|s| Arc::clone(&s.profile)).collect();
        profiles.sort_by(|a, b| a.remarks.cmp(&b.remarks));
        profiles
    }

    /// Unique client IPs with live sticky pins
    #[must_use]
    pub fn recent_client_ips(&self) -> Vec<IpAddr> {
        self.dispatcher.sticky().client_ips()
    }

    /// Persist the A-zone profiles to the catalogue file
    async fn save_catalogue_now(&self) {
        let _guard = self.catalogue_lock.lock().await;
        let profiles: Vec<ServerProfile> = {
            let zone = self.store.config_state().await;
            zone.values().map(|s| (*s.profile).clone()).collect()
        };
        let path = AppConfig::catalogue_path(&self.config_dir);
        if let Err(e) = save_catalogue(&path, &profiles) {
            error!(error = %e, "Failed to persist server catalogue");
        }
    }

    /// One full probe cycle over every active, bound instance
    pub async fn run_health_checks(&self) {
        let instances: HashMap<String, Arc<dyn crate::strategy::TunnelStrategy>> = {
            let zone = self.store.config_state().await;
            zone.iter()
                .filter(|(_, state)| state.profile.active && state.instance.is_some())
                .map(|(id, state)| {
                    (
                        id.clone(),
                        Arc::clone(state.instance.as_ref().expect("filtered")),
                    )
                })
                .collect()
        };

        if instances.is_empty() {
            debug!("No active instances to check");
            return;
        }

        let (health_map, metrics_map) = self.checker.check(instances).await;

        let mut changed = false;
        {
            let mut zone = self.store.config_state_mut().await;
            for (id, new_health) in &health_map {
                if let Some(state) = zone.get_mut(id) {
                    if state.health != *new_health {
                        info!(
                            remarks = %state.profile.remarks,
                            old = %state.health,
                            new = %new_health,
                            "Health status changed"
                        );
                        state.health = *new_health;
                        changed = true;
                    }
                    if let Some(metrics) = metrics_map.get(id) {
                        state.metrics = *metrics;
                    }
                }
            }
        }

        if changed {
            self.store.publish().await;
            // Rule outcomes may shift with backend health
            self.settings.renotify("routing");
        }
    }

    /// Probe one backend (failure-threshold path) and publish on change
    async fn trigger_single_health_check(&self, server_id: &str) {
        let (instance, old_health) = {
            let zone = self.store.config_state().await;
            match zone.get(server_id) {
                Some(state) if state.instance.is_some() => (
                    Arc::clone(state.instance.as_ref().expect("checked")),
                    state.health,
                ),
                _ => {
                    warn!(server_id, "Instance not found for single health check");
                    return;
                }
            }
        };

        let (new_health, metrics) = self.checker.check_one(&instance).await;

        {
            let mut zone = self.store.config_state_mut().await;
            if let Some(state) = zone.get_mut(server_id) {
                state.health = new_health;
                state.metrics = metrics;
            }
        }

        if new_health == old_health {
            debug!(server_id, "Single health check passed, status unchanged");
            return;
        }
        info!(
            server_id,
            old = %old_health,
            new = %new_health,
            "Health status changed after single check"
        );
        self.store.publish().await;
        self.settings.renotify("routing");
    }

    /// Spawn the periodic health loop; it exits once the controller closes
    pub fn spawn_health_loop(&self) -> JoinHandle<()> {
        let weak = self.self_ref.get().cloned().unwrap_or_default();
        let interval = std::time::Duration::from_secs(self.config.health_check_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick duplicates the bootstrap checks
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(controller) = weak.upgrade() else {
                    return;
                };
                if controller.is_closed() {
                    return;
                }
                controller.run_health_checks().await;
            }
        })
    }

    /// Cascading shutdown: instances closed, counters cleared, final
    /// publication so the B-zone holds no live listeners.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping controller");

        {
            let mut zone = self.store.config_state_mut().await;
            for state in zone.values_mut() {
                if let Some(instance) = state.instance.take() {
                    info!(remarks = %state.profile.remarks, "Closing strategy instance");
                    instance.close().await;
                }
                state.health = HealthStatus::Unknown;
            }
        }
        self.store.publish().await;
        self.failure_counters.lock().clear();
        info!("All strategies stopped");
    }
}

/// Mark a profile inactive after an instance failure (clone-on-write, the
/// profile Arc is shared with published snapshots)
fn deactivate_profile(state: &mut ServerState) {
    let mut profile = (*state.profile).clone();
    profile.active = false;
    state.profile = Arc::new(profile);
    state.health = HealthStatus::Unknown;
}

impl FailureReporter for AppController {
    fn report_failure(&self, server_id: &str) {
        let count = {
            let mut counters = self.failure_counters.lock();
            let count = counters.entry(server_id.to_string()).or_insert(0);
            *count += 1;
            let current = *count;
            if current >= FAILURE_THRESHOLD {
                *count = 0;
            }
            current
        };

        warn!(server_id, count, "Failure reported for backend");

        if count >= FAILURE_THRESHOLD {
            warn!(server_id, "Failure threshold reached, triggering health check");
            if let Some(controller) = self.self_ref.get().and_then(Weak::upgrade) {
                let server_id = server_id.to_string();
                tokio::spawn(async move {
                    controller.trigger_single_health_check(&server_id).await;
                });
            }
        }
    }

    fn report_success(&self, server_id: &str) {
        let mut counters = self.failure_counters.lock();
        if let Some(count) = counters.get_mut(server_id) {
            *count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rust-gateway-app-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn controller(name: &str) -> Arc<AppController> {
        let dir = temp_config_dir(name);
        AppController::new(Arc::new(AppConfig::default()), dir).unwrap()
    }

    fn inactive_profile(id: &str) -> ServerProfile {
        ServerProfile {
            id: id.to_string(),
            remarks: format!("backend-{id}"),
            kind: "multiplexed".to_string(),
            address: "127.0.0.1".to_string(),
            port: 1,
            scheme: "ws".to_string(),
            path: "/t".to_string(),
            edge_ip: String::new(),
            local_port: 0,
            active: false,
            network: String::new(),
            crypt_key_id: None,
        }
    }

    #[tokio::test]
    async fn test_bootstrap_empty_catalogue() {
        let ctl = controller("empty");
        ctl.bootstrap().await.unwrap();
        assert!(ctl.server_states().is_empty());
    }

    #[tokio::test]
    async fn test_add_and_delete_profile() {
        let ctl = controller("adddel");
        ctl.bootstrap().await.unwrap();

        let id = ctl
            .add_server_profile(inactive_profile(""))
            .await
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(ctl.server_states().len(), 1);

        // Inactive profiles never hold an instance
        let snapshot = ctl.server_states();
        assert!(snapshot.get(&id).unwrap().instance.is_none());

        ctl.delete_server_profile(&id).await.unwrap();
        assert!(ctl.server_states().is_empty());

        assert!(ctl.delete_server_profile(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let ctl = controller("dup");
        ctl.bootstrap().await.unwrap();

        ctl.add_server_profile(inactive_profile("same"))
            .await
            .unwrap();
        assert!(ctl
            .add_server_profile(inactive_profile("same"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_activation_failure_deactivates() {
        // The remote (port 1) refuses, so the multiplexed pre-connect
        // fails and the profile must flip back to inactive
        let ctl = controller("actfail");
        ctl.bootstrap().await.unwrap();

        let mut profile = inactive_profile("will-fail");
        profile.active = true;
        let id = ctl.add_server_profile(profile).await.unwrap();

        let snapshot = ctl.server_states();
        let state = snapshot.get(&id).unwrap();
        assert!(!state.profile.active);
        assert!(state.instance.is_none());
    }

    #[tokio::test]
    async fn test_failure_counter_threshold() {
        let ctl = controller("threshold");
        ctl.bootstrap().await.unwrap();

        for _ in 0..FAILURE_THRESHOLD - 1 {
            ctl.report_failure("srv-x");
        }
        assert_eq!(ctl.failure_counters.lock()["srv-x"], FAILURE_THRESHOLD - 1);

        // Success resets the counter
        ctl.report_success("srv-x");
        assert_eq!(ctl.failure_counters.lock()["srv-x"], 0);

        // Reaching the threshold resets it again (and fires a probe task
        // that no-ops for the unknown id)
        for _ in 0..FAILURE_THRESHOLD {
            ctl.report_failure("srv-x");
        }
        assert_eq!(ctl.failure_counters.lock()["srv-x"], 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_instances_and_publishes() {
        let ctl = controller("shutdown");
        ctl.bootstrap().await.unwrap();
        ctl.add_server_profile(inactive_profile("a")).await.unwrap();

        ctl.shutdown().await;
        let snapshot = ctl.server_states();
        assert!(snapshot.values().all(|s| s.instance.is_none()));
        assert!(ctl.is_closed());
    }

    #[tokio::test]
    async fn test_update_unknown_id_errors() {
        let ctl = controller("unknown");
        ctl.bootstrap().await.unwrap();
        assert!(ctl.update_server_active_state("nope", true).await.is_err());
        assert!(ctl
            .update_server_profile("nope", inactive_profile("nope"))
            .await
            .is_err());
    }
}
