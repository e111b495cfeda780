//! Heartbeat monitor for service liveness
//!
//! ## Status derivation
//!
//! Status is a pure function of the time since the last heartbeat and the
//! registration's interval:
//!
//! - `elapsed < interval` → active
//! - `interval <= elapsed < K * interval` → warning
//! - `elapsed >= K * interval` → inactive
//!
//! K is the configured inactive multiplier (default 4). A fresh heartbeat
//! always resets the registration to active.
//!
//! ## Sweep
//!
//! A background sweep recomputes the stored status of every registration
//! every `min(interval) / 2`, and optionally expires registrations that have
//! been silent for too long.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::HeartbeatSettings;
use crate::error::Result;
use crate::registry::{RecordUpdate, Registry, RegistryStore};
use crate::types::{ServiceRegistration, ServiceStatus};

/// Derive liveness status from elapsed time
pub fn derive_status(elapsed_secs: u64, interval_secs: u64, inactive_multiplier: u32) -> ServiceStatus {
    if elapsed_secs < interval_secs {
        ServiceStatus::Active
    } else if elapsed_secs < interval_secs.saturating_mul(u64::from(inactive_multiplier)) {
        ServiceStatus::Warning
    } else {
        ServiceStatus::Inactive
    }
}

/// Result of a heartbeat call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatOutcome {
    pub status: ServiceStatus,
    pub elapsed_seconds: u64,
    /// False when the heartbeat was older than the stored one and dropped
    pub applied: bool,
}

/// Liveness view of one registration
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatView {
    pub service_id: String,
    pub service_name: String,
    pub service_type: String,
    pub status: ServiceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_interval_seconds: u64,
    pub elapsed_seconds: u64,
}

/// Summary of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub transitions: usize,
    pub failures: usize,
    pub expired: Vec<String>,
}

/// Tracks liveness and runs the status sweep
pub struct HeartbeatMonitor {
    settings: HeartbeatSettings,
    sweeping: AtomicBool,
}

/// Clears the in-progress flag when a sweep ends, however it ends
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HeartbeatMonitor {
    pub fn new(settings: HeartbeatSettings) -> Self {
        Self {
            settings,
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &HeartbeatSettings {
        &self.settings
    }

    /// Status of a registration at `now`
    pub fn status_of(&self, reg: &ServiceRegistration, now: DateTime<Utc>) -> ServiceStatus {
        derive_status(
            reg.elapsed_seconds(now),
            reg.heartbeat_interval_seconds,
            self.settings.inactive_multiplier,
        )
    }

    /// Copy of a registration with its status recomputed at `now`
    pub fn refreshed(&self, mut reg: ServiceRegistration, now: DateTime<Utc>) -> ServiceRegistration {
        reg.status = self.status_of(&reg, now);
        reg
    }

    pub fn view(&self, reg: &ServiceRegistration, now: DateTime<Utc>) -> HeartbeatView {
        HeartbeatView {
            service_id: reg.service_id.clone(),
            service_name: reg.service_name.clone(),
            service_type: reg.service_type.clone(),
            status: self.status_of(reg, now),
            last_heartbeat: reg.last_heartbeat,
            heartbeat_interval_seconds: reg.heartbeat_interval_seconds,
            elapsed_seconds: reg.elapsed_seconds(now),
        }
    }

    /// Record a heartbeat sent at `at`
    ///
    /// Heartbeats older than the stored one are dropped without touching
    /// state.
    pub async fn heartbeat(
        &self,
        store: &RegistryStore,
        service_id: &str,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome> {
        store
            .modify(service_id, |reg| {
                if at < reg.last_heartbeat {
                    debug!(
                        service_id,
                        received = %at,
                        stored = %reg.last_heartbeat,
                        "Dropping out-of-order heartbeat"
                    );
                    let outcome = HeartbeatOutcome {
                        status: reg.status,
                        elapsed_seconds: reg.elapsed_seconds(at),
                        applied: false,
                    };
                    return (outcome, false);
                }

                if reg.status != ServiceStatus::Active {
                    info!(service_id, previous = %reg.status, "Service is active again");
                }
                reg.last_heartbeat = at;
                reg.status = ServiceStatus::Active;

                let outcome = HeartbeatOutcome {
                    status: ServiceStatus::Active,
                    elapsed_seconds: 0,
                    applied: true,
                };
                (outcome, true)
            })
            .await
    }

    /// Recompute stored status for every registration
    ///
    /// Returns `None` if another sweep is already running.
    pub async fn sweep(&self, store: &RegistryStore, now: DateTime<Utc>) -> Option<SweepReport> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Heartbeat sweep already in progress, skipping");
            return None;
        }
        let _guard = SweepGuard(&self.sweeping);

        let mut report = SweepReport::default();
        let removed = store
            .update_all(|reg| {
                report.checked += 1;
                match self.evaluate(reg, now) {
                    Ok(update) => {
                        if update == RecordUpdate::Changed {
                            report.transitions += 1;
                        }
                        update
                    }
                    Err(reason) => {
                        report.failures += 1;
                        warn!(service_id = %reg.service_id, %reason, "Skipping registration in sweep");
                        RecordUpdate::Unchanged
                    }
                }
            })
            .await;

        for reg in &removed {
            info!(
                service_id = %reg.service_id,
                endpoint = %reg.endpoint(),
                "Expired silent service"
            );
        }
        report.expired = removed.into_iter().map(|reg| reg.service_id).collect();

        Some(report)
    }

    fn evaluate(
        &self,
        reg: &mut ServiceRegistration,
        now: DateTime<Utc>,
    ) -> std::result::Result<RecordUpdate, String> {
        if reg.heartbeat_interval_seconds == 0 {
            return Err("heartbeat interval is zero".to_string());
        }

        let elapsed = reg.elapsed_seconds(now);
        if let Some(expire_after) = self.settings.expire_after_secs {
            if elapsed >= expire_after {
                return Ok(RecordUpdate::Remove);
            }
        }

        let status = self.status_of(reg, now);
        if status == reg.status {
            return Ok(RecordUpdate::Unchanged);
        }

        info!(
            service_id = %reg.service_id,
            from = %reg.status,
            to = %status,
            elapsed_secs = elapsed,
            "Service status changed"
        );
        reg.status = status;
        Ok(RecordUpdate::Changed)
    }

    /// Time between sweeps: half the shortest interval, bounded below
    pub fn sweep_period(&self, min_interval_secs: Option<u64>) -> Duration {
        let interval = min_interval_secs.unwrap_or(self.settings.default_interval_secs);
        let half = Duration::from_millis(interval.saturating_mul(1000) / 2);
        half.max(Duration::from_millis(self.settings.min_sweep_interval_ms))
    }
}

/// Run the periodic heartbeat sweep until shutdown
pub async fn run_sweep_loop(registry: Arc<Registry>, mut shutdown: broadcast::Receiver<()>) {
    info!("Starting heartbeat sweep");

    loop {
        let period = registry.heartbeat_sweep_period().await;

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Heartbeat sweep stopped");
                break;
            }
            _ = tokio::time::sleep(period) => {}
        }

        if let Some(report) = registry.sweep_heartbeats(Utc::now()).await {
            debug!(
                checked = report.checked,
                transitions = report.transitions,
                failures = report.failures,
                expired = report.expired.len(),
                "Heartbeat sweep complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationConfig;
    use crate::registry::NewRegistration;
    use chrono::Duration as ChronoDuration;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(HeartbeatSettings::default())
    }

    async fn store_with(id: &str, at: DateTime<Utc>) -> RegistryStore {
        let store = RegistryStore::new();
        store
            .register(
                NewRegistration {
                    service_id: id.into(),
                    service_name: id.into(),
                    service_type: "api".into(),
                    environment: "test".into(),
                    preferred_port: None,
                    host: None,
                    heartbeat_interval_seconds: 60,
                },
                &AllocationConfig::default(),
                at,
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_status_thresholds() {
        assert_eq!(derive_status(10, 60, 4), ServiceStatus::Active);
        assert_eq!(derive_status(59, 60, 4), ServiceStatus::Active);
        assert_eq!(derive_status(60, 60, 4), ServiceStatus::Warning);
        assert_eq!(derive_status(160, 60, 4), ServiceStatus::Warning);
        assert_eq!(derive_status(239, 60, 4), ServiceStatus::Warning);
        assert_eq!(derive_status(240, 60, 4), ServiceStatus::Inactive);
        assert_eq!(derive_status(2380, 60, 4), ServiceStatus::Inactive);
    }

    #[test]
    fn test_sweep_period() {
        let monitor = monitor();
        assert_eq!(monitor.sweep_period(Some(60)), Duration::from_secs(30));
        assert_eq!(monitor.sweep_period(None), Duration::from_secs(30));
        assert_eq!(monitor.sweep_period(Some(0)), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_resets_to_active() {
        let t0 = Utc::now();
        let store = store_with("svc", t0).await;
        let monitor = monitor();

        let later = t0 + ChronoDuration::seconds(2380);
        let report = monitor.sweep(&store, later).await.unwrap();
        assert_eq!(report.transitions, 1);
        assert_eq!(store.get("svc").await.unwrap().status, ServiceStatus::Inactive);

        let outcome = monitor.heartbeat(&store, "svc", later).await.unwrap();
        assert_eq!(
            outcome,
            HeartbeatOutcome {
                status: ServiceStatus::Active,
                elapsed_seconds: 0,
                applied: true
            }
        );
        let reg = store.get("svc").await.unwrap();
        assert_eq!(reg.status, ServiceStatus::Active);
        assert_eq!(reg.last_heartbeat, later);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_dropped() {
        let t0 = Utc::now();
        let store = store_with("svc", t0).await;
        let monitor = monitor();

        let before = store.get("svc").await.unwrap();
        let stale = t0 - ChronoDuration::seconds(5);
        let outcome = monitor.heartbeat(&store, "svc", stale).await.unwrap();

        assert!(!outcome.applied);
        assert_eq!(store.get("svc").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_service() {
        let store = RegistryStore::new();
        let err = monitor()
            .heartbeat(&store, "ghost", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sweep_transitions_and_is_idempotent() {
        let t0 = Utc::now();
        let store = store_with("svc", t0).await;
        let monitor = monitor();

        let at = t0 + ChronoDuration::seconds(160);
        let first = monitor.sweep(&store, at).await.unwrap();
        assert_eq!(first.transitions, 1);
        assert_eq!(store.get("svc").await.unwrap().status, ServiceStatus::Warning);

        let second = monitor.sweep(&store, at).await.unwrap();
        assert_eq!(second.transitions, 0);
        assert_eq!(second.checked, 1);
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let store = store_with("svc", Utc::now()).await;
        let monitor = monitor();

        monitor.sweeping.store(true, Ordering::Release);
        assert!(monitor.sweep(&store, Utc::now()).await.is_none());

        monitor.sweeping.store(false, Ordering::Release);
        assert!(monitor.sweep(&store, Utc::now()).await.is_some());
    }

    #[tokio::test]
    async fn test_expiry_policy_removes_silent_services() {
        let t0 = Utc::now();
        let store = store_with("svc", t0).await;
        let monitor = HeartbeatMonitor::new(HeartbeatSettings {
            expire_after_secs: Some(1800),
            ..HeartbeatSettings::default()
        });

        let report = monitor
            .sweep(&store, t0 + ChronoDuration::seconds(600))
            .await
            .unwrap();
        assert!(report.expired.is_empty());

        let report = monitor
            .sweep(&store, t0 + ChronoDuration::seconds(1800))
            .await
            .unwrap();
        assert_eq!(report.expired, vec!["svc".to_string()]);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_isolates_bad_records() {
        let t0 = Utc::now();
        let store = store_with("good", t0).await;
        let mut bad = store.get("good").await.unwrap();
        bad.service_id = "bad".into();
        bad.port += 1;
        bad.heartbeat_interval_seconds = 0;
        store.restore(vec![bad]).await;

        let report = monitor()
            .sweep(&store, t0 + ChronoDuration::seconds(160))
            .await
            .unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.failures, 1);
        assert_eq!(store.get("good").await.unwrap().status, ServiceStatus::Warning);
    }
}
