//! Registry store
//!
//! The authoritative registration table. Every mutation runs under one write
//! lock; allocation happens inside that same critical section so two
//! concurrent registrations can never both see a port as free. Readers get
//! cloned snapshots.
//!
//! Structural changes (register, deregister, reallocate) write the snapshot
//! immediately. Heartbeat updates only mark the table dirty; the next sweep,
//! structural change or [`RegistryStore::flush`] writes them out.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::persist::Persistence;
use crate::allocation::{AllocationConfig, Allocator, Occupancy};
use crate::error::{RegistryError, Result};
use crate::types::{ServiceRegistration, ServiceStatus};

/// Fields needed to create a registration
#[derive(Debug, Clone)]
pub struct NewRegistration {
    pub service_id: String,
    pub service_name: String,
    pub service_type: String,
    pub environment: String,
    pub preferred_port: Option<u16>,
    pub host: Option<IpAddr>,
    pub heartbeat_interval_seconds: u64,
}

/// Outcome of a per-record update during a bulk pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordUpdate {
    Unchanged,
    Changed,
    Remove,
}

/// Registration table with optional on-disk persistence
pub struct RegistryStore {
    services: RwLock<BTreeMap<String, ServiceRegistration>>,
    persistence: Option<Persistence>,
    /// Unpersisted heartbeat updates
    dirty: AtomicBool,
}

impl RegistryStore {
    /// In-memory store
    pub fn new() -> Self {
        Self {
            services: RwLock::new(BTreeMap::new()),
            persistence: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Store that snapshots every committed mutation to disk
    pub fn with_persistence(persistence: Persistence) -> Self {
        Self {
            services: RwLock::new(BTreeMap::new()),
            persistence: Some(persistence),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the persisted snapshot, if persistence is configured
    pub async fn load(&self) -> Result<usize> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let registrations = persistence.load().await?;
        let count = registrations.len();
        self.restore(registrations).await;
        Ok(count)
    }

    /// Insert records verbatim, bypassing allocation
    ///
    /// Used for loading snapshots; existing records with the same id are
    /// replaced.
    pub async fn restore(&self, registrations: Vec<ServiceRegistration>) {
        let mut services = self.services.write().await;
        for reg in registrations {
            services.insert(reg.service_id.clone(), reg);
        }
    }

    /// Allocate an endpoint and commit the registration in one critical section
    pub async fn register(
        &self,
        new: NewRegistration,
        config: &AllocationConfig,
        now: DateTime<Utc>,
    ) -> Result<ServiceRegistration> {
        let mut services = self.services.write().await;

        if services.contains_key(&new.service_id) {
            warn!(service_id = %new.service_id, "Duplicate registration rejected");
            return Err(RegistryError::DuplicateService(new.service_id));
        }

        let occupancy = Occupancy::from_registrations(services.values());
        let allocation = Allocator::new(config, &occupancy).allocate(
            &new.service_type,
            new.preferred_port,
            new.host,
            &mut rand::thread_rng(),
        )?;

        let registration = ServiceRegistration {
            service_id: new.service_id,
            service_name: new.service_name,
            service_type: new.service_type,
            environment: new.environment,
            ip: allocation.ip,
            port: allocation.port,
            status: ServiceStatus::Active,
            fallback: allocation.fallback,
            fallback_reason: allocation.fallback_reason,
            preferred_port: new.preferred_port,
            heartbeat_interval_seconds: new.heartbeat_interval_seconds,
            last_heartbeat: now,
            registered_at: now,
        };

        info!(
            service_id = %registration.service_id,
            service_type = %registration.service_type,
            endpoint = %registration.endpoint(),
            fallback = registration.fallback,
            "Service registered"
        );

        services.insert(registration.service_id.clone(), registration.clone());
        self.persist(&services).await;

        Ok(registration)
    }

    /// Remove a registration, freeing its endpoint
    pub async fn deregister(&self, service_id: &str) -> Result<ServiceRegistration> {
        let mut services = self.services.write().await;

        let removed = services.remove(service_id).ok_or_else(|| {
            warn!(service_id, "Service not found for deregistration");
            RegistryError::NotFound(format!("service {service_id}"))
        })?;

        info!(service_id, endpoint = %removed.endpoint(), "Service deregistered");
        self.persist(&services).await;

        Ok(removed)
    }

    /// Move a registration to a freshly allocated endpoint on the same ip
    ///
    /// The registration's own endpoint does not count as occupied, but every
    /// other holder does, so a duplicated endpoint is always left.
    pub async fn reallocate(
        &self,
        service_id: &str,
        config: &AllocationConfig,
    ) -> Result<ServiceRegistration> {
        let mut services = self.services.write().await;

        let current = services
            .get(service_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("service {service_id}")))?;

        let occupancy = Occupancy::from_registrations(
            services.values().filter(|reg| reg.service_id != service_id),
        );
        let allocation = Allocator::new(config, &occupancy).allocate(
            &current.service_type,
            current.preferred_port,
            Some(current.ip),
            &mut rand::thread_rng(),
        )?;

        let Some(reg) = services.get_mut(service_id) else {
            return Err(RegistryError::NotFound(format!("service {service_id}")));
        };
        reg.ip = allocation.ip;
        reg.port = allocation.port;
        reg.fallback = allocation.fallback;
        reg.fallback_reason = allocation.fallback_reason;
        let updated = reg.clone();

        info!(
            service_id,
            from = %current.endpoint(),
            to = %updated.endpoint(),
            "Service reallocated"
        );
        self.persist(&services).await;

        Ok(updated)
    }

    /// Apply a change to one registration; the closure reports whether it changed anything
    ///
    /// Changes are not written to disk here, only marked for the next write.
    pub async fn modify<T, F>(&self, service_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut ServiceRegistration) -> (T, bool),
    {
        let mut services = self.services.write().await;

        let reg = services
            .get_mut(service_id)
            .ok_or_else(|| RegistryError::NotFound(format!("service {service_id}")))?;

        let (value, changed) = f(reg);
        if changed && self.persistence.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(value)
    }

    /// Write pending changes to disk
    pub async fn flush(&self) {
        if !self.dirty.load(Ordering::Acquire) {
            return;
        }
        let services = self.services.write().await;
        self.persist(&services).await;
    }

    /// Visit every registration under one write lock, removing those marked `Remove`
    ///
    /// Returns the removed records.
    pub async fn update_all<F>(&self, mut f: F) -> Vec<ServiceRegistration>
    where
        F: FnMut(&mut ServiceRegistration) -> RecordUpdate,
    {
        let mut services = self.services.write().await;

        let mut changed = false;
        let mut to_remove = Vec::new();
        for (id, reg) in services.iter_mut() {
            match f(reg) {
                RecordUpdate::Unchanged => {}
                RecordUpdate::Changed => changed = true,
                RecordUpdate::Remove => to_remove.push(id.clone()),
            }
        }

        let removed: Vec<ServiceRegistration> = to_remove
            .iter()
            .filter_map(|id| services.remove(id))
            .collect();

        if changed || !removed.is_empty() || self.dirty.load(Ordering::Acquire) {
            self.persist(&services).await;
        }
        removed
    }

    pub async fn get(&self, service_id: &str) -> Option<ServiceRegistration> {
        self.services.read().await.get(service_id).cloned()
    }

    /// Snapshot of all registrations, ordered by service id
    pub async fn snapshot(&self) -> Vec<ServiceRegistration> {
        self.services.read().await.values().cloned().collect()
    }

    /// Registrations currently holding an endpoint
    pub async fn holders_of(&self, endpoint: SocketAddr) -> Vec<ServiceRegistration> {
        self.services
            .read()
            .await
            .values()
            .filter(|reg| reg.endpoint() == endpoint)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// Shortest heartbeat interval across all registrations
    pub async fn min_heartbeat_interval(&self) -> Option<u64> {
        self.services
            .read()
            .await
            .values()
            .map(|reg| reg.heartbeat_interval_seconds)
            .filter(|&interval| interval > 0)
            .min()
    }

    async fn persist(&self, services: &BTreeMap<String, ServiceRegistration>) {
        if let Some(persistence) = &self.persistence {
            match persistence.save(services.values()).await {
                Ok(()) => self.dirty.store(false, Ordering::Release),
                Err(e) => warn!(error = %e, "Failed to persist registry snapshot"),
            }
        }
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}
