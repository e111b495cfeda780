//! Service registry
//!
//! [`Registry`] is the single handle the process builds at startup. It owns
//! the allocation config, the registration table, the heartbeat monitor and
//! the conflict detector, and is shared by reference with every request
//! handler and background task.

pub mod persist;
pub mod store;

pub use persist::{Persistence, REGISTRY_FILE};
pub use store::{NewRegistration, RecordUpdate, RegistryStore};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::allocation::{AllocationConfig, ConfigManager};
use crate::config::Config;
use crate::conflicts::{self, ConflictDetector, Prober, ScanReport, TcpProber};
use crate::error::{RegistryError, Result};
use crate::heartbeat::{self, HeartbeatMonitor, HeartbeatOutcome, HeartbeatView, SweepReport};
use crate::types::{Conflict, ServiceRegistration, ServiceStatus};

/// Registration request as received from a service
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub service_id: String,
    pub service_name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub preferred_port: Option<u16>,
    /// Address to register instead of the configured base ip
    #[serde(default)]
    pub host: Option<IpAddr>,
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
}

fn default_service_type() -> String {
    "generic".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

/// Filter for listing registrations
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceFilter {
    pub service_type: Option<String>,
    pub status: Option<ServiceStatus>,
}

impl ServiceFilter {
    fn matches(&self, reg: &ServiceRegistration) -> bool {
        self.service_type
            .as_deref()
            .map_or(true, |t| reg.service_type == t)
            && self.status.map_or(true, |s| reg.status == s)
    }
}

/// The registry handle
pub struct Registry {
    config: ConfigManager,
    store: RegistryStore,
    heartbeat: HeartbeatMonitor,
    conflicts: ConflictDetector,
    shutdown_tx: broadcast::Sender<()>,
}

impl Registry {
    /// Build an in-memory registry with the given prober
    pub fn new(config: &Config, prober: Arc<dyn Prober>) -> Result<Self> {
        Self::with_store(config, RegistryStore::new(), prober)
    }

    fn with_store(config: &Config, store: RegistryStore, prober: Arc<dyn Prober>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config: ConfigManager::new(config.allocation.clone())?,
            store,
            heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
            conflicts: ConflictDetector::new(config.conflicts.clone(), prober),
            shutdown_tx,
        })
    }

    /// Build the production registry: TCP probes, persistence when a data dir is set
    pub async fn open(config: &Config) -> Result<Self> {
        let store = match &config.server.data_dir {
            Some(dir) => RegistryStore::with_persistence(Persistence::new(dir)),
            None => RegistryStore::new(),
        };
        let registry = Self::with_store(config, store, Arc::new(TcpProber))?;

        let loaded = registry.store.load().await?;
        if loaded > 0 {
            info!(count = loaded, "Restored registrations from disk");
        }
        Ok(registry)
    }

    // === Registrations ===

    pub async fn register(&self, request: RegisterRequest) -> Result<ServiceRegistration> {
        if request.service_id.trim().is_empty() {
            return Err(RegistryError::BadRequest("service_id must not be empty".into()));
        }
        if request.service_name.trim().is_empty() {
            return Err(RegistryError::BadRequest("service_name must not be empty".into()));
        }
        let interval = request
            .heartbeat_interval_seconds
            .unwrap_or(self.heartbeat.settings().default_interval_secs);
        if interval == 0 {
            return Err(RegistryError::BadRequest(
                "heartbeat_interval_seconds must be at least 1".into(),
            ));
        }

        let config = self.config.get_config().await;
        let new = NewRegistration {
            service_id: request.service_id,
            service_name: request.service_name,
            service_type: request.service_type,
            environment: request.environment,
            preferred_port: request.preferred_port,
            host: request.host,
            heartbeat_interval_seconds: interval,
        };
        self.store.register(new, &config, Utc::now()).await
    }

    pub async fn deregister(&self, service_id: &str) -> Result<ServiceRegistration> {
        self.store.deregister(service_id).await
    }

    /// One registration, status computed at call time
    pub async fn get(&self, service_id: &str) -> Result<ServiceRegistration> {
        let reg = self
            .store
            .get(service_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(format!("service {service_id}")))?;
        Ok(self.heartbeat.refreshed(reg, Utc::now()))
    }

    /// Registrations matching `filter`, status computed at call time
    pub async fn list(&self, filter: &ServiceFilter) -> Vec<ServiceRegistration> {
        let now = Utc::now();
        self.store
            .snapshot()
            .await
            .into_iter()
            .map(|reg| self.heartbeat.refreshed(reg, now))
            .filter(|reg| filter.matches(reg))
            .collect()
    }

    /// `http://ip:port` of a registration
    pub async fn endpoint(&self, service_id: &str) -> Result<String> {
        Ok(self.get(service_id).await?.endpoint_url())
    }

    /// Load records verbatim, bypassing allocation
    pub async fn restore(&self, registrations: Vec<ServiceRegistration>) {
        self.store.restore(registrations).await;
    }

    // === Heartbeats ===

    /// Record a heartbeat sent at `at`
    ///
    /// Timestamps ahead of server time by more than the allowed clock skew
    /// are rejected.
    pub async fn heartbeat(&self, service_id: &str, at: DateTime<Utc>) -> Result<HeartbeatOutcome> {
        let skew = self.heartbeat.settings().max_clock_skew_secs;
        let limit = Utc::now() + chrono::Duration::seconds(skew as i64);
        if at > limit {
            return Err(RegistryError::BadRequest(format!(
                "heartbeat timestamp {at} is more than {skew}s ahead of server time"
            )));
        }
        self.heartbeat.heartbeat(&self.store, service_id, at).await
    }

    pub async fn heartbeats(&self, now: DateTime<Utc>) -> Vec<HeartbeatView> {
        self.store
            .snapshot()
            .await
            .iter()
            .map(|reg| self.heartbeat.view(reg, now))
            .collect()
    }

    pub async fn sweep_heartbeats(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        self.heartbeat.sweep(&self.store, now).await
    }

    pub async fn heartbeat_sweep_period(&self) -> Duration {
        let min_interval = self.store.min_heartbeat_interval().await;
        self.heartbeat.sweep_period(min_interval)
    }

    // === Conflicts ===

    pub async fn scan_conflicts(&self) -> ScanReport {
        self.conflicts.scan(&self.store, &self.heartbeat).await
    }

    pub async fn conflicts(&self, include_resolved: bool) -> Vec<Conflict> {
        self.conflicts.list(include_resolved).await
    }

    pub async fn resolve_conflict(&self, conflict_id: &str, solution_index: usize) -> Result<Conflict> {
        self.conflicts
            .resolve(
                conflict_id,
                solution_index,
                &self.store,
                &self.config,
                &self.heartbeat,
            )
            .await
    }

    pub fn conflict_scan_interval_secs(&self) -> u64 {
        self.conflicts.settings().scan_interval_secs
    }

    // === Config ===

    pub async fn get_config(&self) -> Arc<AllocationConfig> {
        self.config.get_config().await
    }

    pub async fn set_config(&self, config: AllocationConfig) -> Result<()> {
        self.config.set_config(config).await
    }

    /// Merge the given top-level fields into the current config and apply it
    pub async fn update_config(&self, patch: serde_json::Value) -> Result<Arc<AllocationConfig>> {
        self.config.apply_patch(patch).await
    }

    // === Lifecycle ===

    /// Start the heartbeat sweep and conflict scan
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(heartbeat::run_sweep_loop(
                Arc::clone(self),
                self.shutdown_tx.subscribe(),
            )),
            tokio::spawn(conflicts::run_scan_loop(
                Arc::clone(self),
                self.shutdown_tx.subscribe(),
            )),
        ]
    }

    /// Write pending heartbeat updates to disk
    pub async fn flush(&self) {
        self.store.flush().await;
    }

    /// Signal background tasks to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for background tasks to stop, then flush; returns how many failed
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>) -> usize {
        let mut failed = 0;
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
                failed += 1;
            }
        }
        self.flush().await;
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::PortRange;
    use crate::conflicts::ProbeError;
    use async_trait::async_trait;

    struct AlwaysReachable;

    #[async_trait]
    impl Prober for AlwaysReachable {
        async fn probe(&self, _ip: IpAddr, _ports: &[u16], _timeout: Duration) -> std::result::Result<(), ProbeError> {
            Ok(())
        }
    }

    fn registry(config: Config) -> Registry {
        Registry::new(&config, Arc::new(AlwaysReachable)).unwrap()
    }

    fn request(id: &str, service_type: &str) -> RegisterRequest {
        RegisterRequest {
            service_id: id.into(),
            service_name: id.into(),
            service_type: service_type.into(),
            environment: "test".into(),
            preferred_port: None,
            host: None,
            heartbeat_interval_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_register_uses_type_range_and_default_interval() {
        let registry = registry(Config::default());
        let reg = registry.register(request("web-1", "web")).await.unwrap();

        // 3000 and 3001 are reserved by default
        assert_eq!(reg.port, 3002);
        assert_eq!(reg.heartbeat_interval_seconds, 60);
        assert_eq!(reg.ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_register_rejects_empty_id() {
        let registry = registry(Config::default());
        let err = registry.register(request(" ", "api")).await.unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_saturated_range_with_fallback() {
        let mut config = Config::default();
        config
            .allocation
            .service_type_ranges
            .insert("tiny".into(), PortRange::new(8500, 8500));
        let registry = registry(config);

        let first = registry.register(request("a", "tiny")).await.unwrap();
        assert_eq!(first.port, 8500);
        assert!(!first.fallback);

        let second = registry.register(request("b", "tiny")).await.unwrap();
        assert!(second.fallback);
        assert_eq!(second.fallback_reason.as_deref(), Some("no_available_port"));
        assert!(!PortRange::new(8500, 8500).contains(second.port));
    }

    #[tokio::test]
    async fn test_drain_reports_failed_tasks() {
        let registry = Arc::new(registry(Config::default()));
        let mut tasks = registry.spawn_background_tasks();
        tasks.push(tokio::spawn(async { panic!("sweep blew up") }));

        registry.shutdown();
        assert_eq!(registry.drain(tasks).await, 1);
    }

    #[tokio::test]
    async fn test_future_dated_heartbeat_rejected() {
        let registry = registry(Config::default());
        let before = registry.register(request("a", "api")).await.unwrap();

        let far_future = Utc::now() + chrono::Duration::days(365);
        let err = registry.heartbeat("a", far_future).await.unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(_)));
        assert_eq!(registry.get("a").await.unwrap().last_heartbeat, before.last_heartbeat);

        // Later heartbeats at server time still apply
        let outcome = registry.heartbeat("a", Utc::now()).await.unwrap();
        assert!(outcome.applied);

        // Small drift within the allowed skew is accepted
        let drift = Utc::now() + chrono::Duration::seconds(2);
        assert!(registry.heartbeat("a", drift).await.unwrap().applied);
    }

    #[tokio::test]
    async fn test_list_filters_by_type() {
        let registry = registry(Config::default());
        registry.register(request("a", "api")).await.unwrap();
        registry.register(request("w", "web")).await.unwrap();

        let filter = ServiceFilter {
            service_type: Some("web".into()),
            status: None,
        };
        let listed = registry.list(&filter).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].service_id, "w");
        assert_eq!(registry.list(&ServiceFilter::default()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_endpoint_lookup() {
        let registry = registry(Config::default());
        registry.register(request("a", "api")).await.unwrap();
        assert_eq!(registry.endpoint("a").await.unwrap(), "http://127.0.0.1:8000");
        assert!(registry.endpoint("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_config_change_affects_future_allocations_only() {
        let registry = registry(Config::default());
        let before = registry.register(request("a", "api")).await.unwrap();

        let mut config = (*registry.get_config().await).clone();
        config
            .service_type_ranges
            .insert("api".into(), PortRange::new(8200, 8299));
        registry.set_config(config).await.unwrap();

        let after = registry.register(request("b", "api")).await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().port, before.port);
        assert_eq!(after.port, 8200);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let registry = Arc::new(registry(Config::default()));
        let handles = registry.spawn_background_tasks();
        registry.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
