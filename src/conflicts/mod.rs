//! Conflict detection and remediation
//!
//! ## Rules
//!
//! 1. **Endpoint grouping**: registrations sharing an `(ip, port)` yield a
//!    `port_conflict`, high severity when at least two members are active,
//!    medium otherwise.
//! 2. **Reachability**: every distinct ip is probed with a hard timeout; a
//!    failed probe yields `address_unreachable` with the highest criticality
//!    hint among the affected service types (default low).
//! 3. **Preference**: a registration that fell back to another port because
//!    its preferred port was taken yields `port_unavailable` (medium).
//!
//! A scan that finds a condition already covered by an unresolved conflict
//! refreshes that record instead of adding a new one. Conflicts are never
//! deleted; resolved ones stay in the history.
//!
//! Accepting a conflict records the condition as intended. Later scans skip
//! it for as long as the same services sit on the same endpoints; if the
//! condition changes it is reported again.
//!
//! `GET /conflicts` reads the cache produced by the last scan; a fresh scan
//! runs on the background tick or on explicit request.

pub mod probe;

pub use probe::{ProbeError, Prober, TcpProber};

use chrono::Utc;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::allocation::ConfigManager;
use crate::config::ConflictSettings;
use crate::error::{RegistryError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::registry::{Registry, RegistryStore};
use crate::types::{
    AffectedService, Conflict, ConflictKey, ConflictType, Remediation, ServiceRegistration,
    ServiceStatus, Severity, Suggestion,
};

/// A condition found by a scan, before it is merged into the conflict list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub key: ConflictKey,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub affected_services: Vec<AffectedService>,
    pub resolution_suggestions: Vec<Suggestion>,
}

impl Finding {
    fn into_conflict(self) -> Conflict {
        Conflict::new(
            self.key,
            self.conflict_type,
            self.severity,
            self.affected_services,
            self.resolution_suggestions,
        )
    }
}

impl Conflict {
    fn refresh_from(&mut self, finding: Finding) {
        self.severity = finding.severity;
        self.affected_services = finding.affected_services;
        self.resolution_suggestions = finding.resolution_suggestions;
    }
}

/// Summary of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub detected: usize,
    pub new: usize,
}

/// Duplicate endpoint rule for one endpoint's holders
pub fn endpoint_finding(endpoint: SocketAddr, holders: &[ServiceRegistration]) -> Option<Finding> {
    if holders.len() < 2 {
        return None;
    }

    let active = holders
        .iter()
        .filter(|reg| reg.status == ServiceStatus::Active)
        .count();
    let severity = if active >= 2 {
        Severity::High
    } else {
        Severity::Medium
    };

    // The oldest holder keeps the endpoint
    let mut ordered: Vec<&ServiceRegistration> = holders.iter().collect();
    ordered.sort_by(|a, b| {
        a.registered_at
            .cmp(&b.registered_at)
            .then_with(|| a.service_id.cmp(&b.service_id))
    });

    let movers = &ordered[1..];
    let mut suggestions: Vec<Suggestion> = movers
        .iter()
        .map(|reg| {
            Suggestion::new(
                format!("Move {} to a free port", reg.service_id),
                Remediation::Reallocate {
                    service_id: reg.service_id.clone(),
                },
            )
        })
        .collect();
    suggestions.extend(movers.iter().map(|reg| {
        Suggestion::new(
            format!("Deregister {} and free {}", reg.service_id, endpoint),
            Remediation::Deregister {
                service_id: reg.service_id.clone(),
            },
        )
    }));

    Some(Finding {
        key: ConflictKey::Endpoint(endpoint),
        conflict_type: ConflictType::PortConflict,
        severity,
        affected_services: ordered.iter().map(|reg| AffectedService::from(*reg)).collect(),
        resolution_suggestions: suggestions,
    })
}

/// Unfulfilled preferred port rule for one registration
///
/// Only fallback allocations count; a nominal allocation that landed on
/// another in-range port is not a conflict.
pub fn preference_finding(reg: &ServiceRegistration) -> Option<Finding> {
    if !reg.fallback {
        return None;
    }
    let preferred = reg.preferred_port.filter(|_| reg.preference_unfulfilled())?;

    Some(Finding {
        key: ConflictKey::Service(reg.service_id.clone()),
        conflict_type: ConflictType::PortUnavailable,
        severity: Severity::Medium,
        affected_services: vec![AffectedService::from(reg)],
        resolution_suggestions: vec![
            Suggestion::new(
                format!("Keep {} on port {}", reg.service_id, reg.port),
                Remediation::Accept,
            ),
            Suggestion::new(
                format!("Retry preferred port {} for {}", preferred, reg.service_id),
                Remediation::Reallocate {
                    service_id: reg.service_id.clone(),
                },
            ),
        ],
    })
}

fn address_finding(ip: IpAddr, members: &[ServiceRegistration], severity: Severity) -> Finding {
    let mut suggestions = vec![Suggestion::new(
        format!("Probe {ip} again"),
        Remediation::Reprobe,
    )];
    suggestions.extend(members.iter().map(|reg| {
        Suggestion::new(
            format!("Deregister {}", reg.service_id),
            Remediation::Deregister {
                service_id: reg.service_id.clone(),
            },
        )
    }));

    Finding {
        key: ConflictKey::Address(ip),
        conflict_type: ConflictType::AddressUnreachable,
        severity,
        affected_services: members.iter().map(AffectedService::from).collect(),
        resolution_suggestions: suggestions,
    }
}

/// Scans the registry for conflicts and applies remediations
pub struct ConflictDetector {
    settings: ConflictSettings,
    prober: Arc<dyn Prober>,
    conflicts: RwLock<Vec<Conflict>>,
    /// Accepted conditions, keyed by conflict key with the services they covered
    accepted: RwLock<HashMap<ConflictKey, Vec<AffectedService>>>,
    /// Serializes scans and resolutions so merges never interleave
    scan_lock: Mutex<()>,
}

impl ConflictDetector {
    pub fn new(settings: ConflictSettings, prober: Arc<dyn Prober>) -> Self {
        Self {
            settings,
            prober,
            conflicts: RwLock::new(Vec::new()),
            accepted: RwLock::new(HashMap::new()),
            scan_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ConflictSettings {
        &self.settings
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.probe_timeout_ms)
    }

    fn criticality(&self, service_type: &str) -> Severity {
        self.settings
            .criticality
            .get(service_type)
            .copied()
            .unwrap_or(Severity::Low)
    }

    async fn snapshot(store: &RegistryStore, monitor: &HeartbeatMonitor) -> Vec<ServiceRegistration> {
        let now = Utc::now();
        store
            .snapshot()
            .await
            .into_iter()
            .map(|reg| monitor.refreshed(reg, now))
            .collect()
    }

    /// Probe one address; timeouts are a detected condition, not an error
    async fn is_unreachable(&self, ip: IpAddr, members: &[ServiceRegistration]) -> bool {
        let ports: Vec<u16> = members.iter().map(|reg| reg.port).collect();
        match self.prober.probe(ip, &ports, self.probe_timeout()).await {
            Ok(()) => false,
            Err(ProbeError::Timeout(after)) => {
                debug!(%ip, ?after, "Probe timed out, unreachable for this cycle");
                true
            }
            Err(e) => {
                debug!(%ip, error = %e, "Probe failed");
                true
            }
        }
    }

    fn address_severity(&self, members: &[ServiceRegistration]) -> Severity {
        members
            .iter()
            .map(|reg| self.criticality(&reg.service_type))
            .max()
            .unwrap_or(Severity::Low)
    }

    /// Evaluate every rule against a snapshot
    pub async fn detect(&self, registrations: &[ServiceRegistration]) -> Vec<Finding> {
        let mut findings = Vec::new();

        let mut by_endpoint: HashMap<SocketAddr, Vec<ServiceRegistration>> = HashMap::new();
        for reg in registrations {
            by_endpoint.entry(reg.endpoint()).or_default().push(reg.clone());
        }
        let mut endpoints: Vec<_> = by_endpoint.into_iter().collect();
        endpoints.sort_by_key(|(endpoint, _)| *endpoint);
        findings.extend(
            endpoints
                .iter()
                .filter_map(|(endpoint, holders)| endpoint_finding(*endpoint, holders)),
        );

        if self.settings.probe_enabled {
            let mut by_ip: HashMap<IpAddr, Vec<ServiceRegistration>> = HashMap::new();
            for reg in registrations {
                by_ip.entry(reg.ip).or_default().push(reg.clone());
            }
            let mut addresses: Vec<_> = by_ip.into_iter().collect();
            addresses.sort_by_key(|(ip, _)| *ip);

            let probes = addresses.iter().map(|(ip, members)| async move {
                let unreachable = self.is_unreachable(*ip, members).await;
                (*ip, members, unreachable)
            });
            for (ip, members, unreachable) in futures::future::join_all(probes).await {
                if unreachable {
                    findings.push(address_finding(ip, members, self.address_severity(members)));
                }
            }
        }

        findings.extend(registrations.iter().filter_map(preference_finding));
        findings
    }

    /// Run all rules and merge the results into the conflict list
    pub async fn scan(&self, store: &RegistryStore, monitor: &HeartbeatMonitor) -> ScanReport {
        let _scan = self.scan_lock.lock().await;

        let registrations = Self::snapshot(store, monitor).await;
        let mut findings = self.detect(&registrations).await;

        {
            let mut accepted = self.accepted.write().await;
            accepted.retain(|key, affected| {
                findings
                    .iter()
                    .any(|f| &f.key == key && &f.affected_services == affected)
            });
            findings.retain(|f| !accepted.contains_key(&f.key));
        }

        let mut report = ScanReport {
            detected: findings.len(),
            new: 0,
        };

        let mut conflicts = self.conflicts.write().await;
        for finding in findings {
            if let Some(existing) = conflicts
                .iter_mut()
                .find(|c| !c.resolved && c.key == finding.key)
            {
                existing.refresh_from(finding);
                continue;
            }

            let conflict = finding.into_conflict();
            warn!(
                conflict_id = %conflict.id,
                conflict_type = ?conflict.conflict_type,
                severity = ?conflict.severity,
                services = conflict.affected_services.len(),
                "Conflict detected"
            );
            conflicts.push(conflict);
            report.new += 1;
        }

        report
    }

    /// Cached conflicts, unresolved only unless `include_resolved`
    pub async fn list(&self, include_resolved: bool) -> Vec<Conflict> {
        self.conflicts
            .read()
            .await
            .iter()
            .filter(|c| include_resolved || !c.resolved)
            .cloned()
            .collect()
    }

    pub async fn get(&self, conflict_id: &str) -> Option<Conflict> {
        self.conflicts
            .read()
            .await
            .iter()
            .find(|c| c.id == conflict_id)
            .cloned()
    }

    /// Re-run the rule that produced `key`
    async fn recheck(
        &self,
        key: &ConflictKey,
        store: &RegistryStore,
        monitor: &HeartbeatMonitor,
    ) -> Option<Finding> {
        let now = Utc::now();
        match key {
            ConflictKey::Endpoint(endpoint) => {
                let holders: Vec<_> = store
                    .holders_of(*endpoint)
                    .await
                    .into_iter()
                    .map(|reg| monitor.refreshed(reg, now))
                    .collect();
                endpoint_finding(*endpoint, &holders)
            }
            ConflictKey::Service(service_id) => {
                let reg = store.get(service_id).await?;
                preference_finding(&reg)
            }
            ConflictKey::Address(ip) => {
                let members: Vec<_> = Self::snapshot(store, monitor)
                    .await
                    .into_iter()
                    .filter(|reg| reg.ip == *ip)
                    .collect();
                if members.is_empty() || !self.is_unreachable(*ip, &members).await {
                    return None;
                }
                Some(address_finding(*ip, &members, self.address_severity(&members)))
            }
        }
    }

    /// Apply a remediation; returns true when it accepts the condition as is
    async fn apply(
        &self,
        remediation: &Remediation,
        store: &RegistryStore,
        config: &ConfigManager,
    ) -> Result<bool> {
        match remediation {
            Remediation::Reallocate { service_id } => {
                let config = config.get_config().await;
                match store.reallocate(service_id, &config).await {
                    Ok(_) => {}
                    Err(RegistryError::NotFound(_)) => {
                        debug!(%service_id, "Service already gone, nothing to reallocate");
                    }
                    Err(e) => return Err(e),
                }
                Ok(false)
            }
            Remediation::Deregister { service_id } => {
                match store.deregister(service_id).await {
                    Ok(_) | Err(RegistryError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                Ok(false)
            }
            Remediation::Reprobe => Ok(false),
            Remediation::Accept => Ok(true),
        }
    }

    /// Apply suggestion `solution_index` of a conflict and re-check it
    ///
    /// An out-of-range index changes nothing. When the condition persists
    /// after the remediation, the record is refreshed and stays unresolved.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        solution_index: usize,
        store: &RegistryStore,
        config: &ConfigManager,
        monitor: &HeartbeatMonitor,
    ) -> Result<Conflict> {
        let _scan = self.scan_lock.lock().await;

        let conflict = self
            .get(conflict_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(format!("conflict {conflict_id}")))?;
        if conflict.resolved {
            return Ok(conflict);
        }

        let suggestion = conflict
            .resolution_suggestions
            .get(solution_index)
            .cloned()
            .ok_or(RegistryError::InvalidIndex {
                index: solution_index,
                available: conflict.resolution_suggestions.len(),
            })?;

        info!(
            conflict_id,
            action = %suggestion.description,
            "Applying conflict remediation"
        );
        let accept = self.apply(&suggestion.remediation, store, config).await?;
        let mut remaining = self.recheck(&conflict.key, store, monitor).await;

        if accept {
            if let Some(finding) = remaining.take() {
                debug!(conflict_id, "Condition accepted as intended");
                self.accepted
                    .write()
                    .await
                    .insert(conflict.key.clone(), finding.affected_services);
            }
        }

        let mut conflicts = self.conflicts.write().await;
        let record = conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| RegistryError::NotFound(format!("conflict {conflict_id}")))?;

        match remaining {
            Some(finding) => {
                warn!(conflict_id, "Conflict persists after remediation");
                record.refresh_from(finding);
                Err(RegistryError::StillConflicting(conflict_id.to_string()))
            }
            None => {
                record.resolved = true;
                record.resolved_at = Some(Utc::now());
                info!(conflict_id, "Conflict resolved");
                Ok(record.clone())
            }
        }
    }
}

/// Run the periodic conflict scan until shutdown
pub async fn run_scan_loop(registry: Arc<Registry>, mut shutdown: broadcast::Receiver<()>) {
    let period = Duration::from_secs(registry.conflict_scan_interval_secs().max(1));
    info!(?period, "Starting conflict scan");

    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Conflict scan stopped");
                break;
            }
            _ = interval.tick() => {}
        }

        let report = registry.scan_conflicts().await;
        debug!(detected = report.detected, new = report.new, "Conflict scan complete");
    }
}
