//! Port allocator
//!
//! Picks a free `(ip, port)` for a service type from the configured ranges.
//! The allocator is a pure function of the config, the current occupancy and
//! the random source; the registry runs it inside its write lock so the
//! check and the reservation cannot be split.

use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

use super::{AllocationConfig, AllocationStrategy, PortRange};
use crate::error::{RegistryError, Result};
use crate::types::ServiceRegistration;

/// Reason recorded on allocations granted outside the nominal range
pub const FALLBACK_NO_AVAILABLE_PORT: &str = "no_available_port";

/// Endpoints currently held by registrations
#[derive(Debug, Default, Clone)]
pub struct Occupancy {
    held: HashSet<SocketAddr>,
}

impl Occupancy {
    pub fn from_registrations<'a>(
        registrations: impl IntoIterator<Item = &'a ServiceRegistration>,
    ) -> Self {
        Self {
            held: registrations
                .into_iter()
                .map(ServiceRegistration::endpoint)
                .collect(),
        }
    }

    pub fn is_held(&self, addr: &SocketAddr) -> bool {
        self.held.contains(addr)
    }

    pub fn insert(&mut self, addr: SocketAddr) {
        self.held.insert(addr);
    }

    pub fn remove(&mut self, addr: &SocketAddr) {
        self.held.remove(addr);
    }
}

/// Result of a successful allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub ip: IpAddr,
    pub port: u16,
    pub fallback: bool,
    pub fallback_reason: Option<String>,
}

impl Allocation {
    fn nominal(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            fallback: false,
            fallback_reason: None,
        }
    }

    fn fallback(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            fallback: true,
            fallback_reason: Some(FALLBACK_NO_AVAILABLE_PORT.to_string()),
        }
    }
}

/// Allocator over one config snapshot and occupancy view
pub struct Allocator<'a> {
    config: &'a AllocationConfig,
    occupancy: &'a Occupancy,
}

impl<'a> Allocator<'a> {
    pub fn new(config: &'a AllocationConfig, occupancy: &'a Occupancy) -> Self {
        Self { config, occupancy }
    }

    /// Allocate an endpoint for `service_type`
    ///
    /// Order: preferred port, nominal range scan, overflow pool (fallback
    /// mode only), forced preferred port (fallback mode only).
    pub fn allocate<R: Rng + ?Sized>(
        &self,
        service_type: &str,
        preferred_port: Option<u16>,
        host: Option<IpAddr>,
        rng: &mut R,
    ) -> Result<Allocation> {
        let ip = host.unwrap_or(self.config.service_ip_base);
        let range = self.config.range_for(service_type);

        if let Some(port) = preferred_port {
            let in_bounds = range.contains(port)
                || (self.config.fallback_mode && self.config.default_port_range.contains(port));
            if in_bounds && self.is_free(ip, port) {
                debug!(service_type, port, "Preferred port granted");
                return Ok(Allocation::nominal(ip, port));
            }
            debug!(service_type, port, "Preferred port unavailable, scanning range");
        }

        if let Some(port) = self.scan(ip, range, None, rng) {
            return Ok(Allocation::nominal(ip, port));
        }

        if !self.config.fallback_mode {
            warn!(service_type, start = range.start, end = range.end, "Port range exhausted");
            return Err(RegistryError::ExhaustedPortRange {
                service_type: service_type.to_string(),
            });
        }

        warn!(
            service_type,
            "No free port in nominal range, searching overflow pool"
        );
        if let Some(port) = self.scan(ip, self.config.default_port_range, Some(range), rng) {
            return Ok(Allocation::fallback(ip, port));
        }

        // Last resort: hand out the requested port even though it is held;
        // the conflict detector reports the duplicate.
        if let Some(port) = preferred_port {
            if port != 0 && !self.config.reserved_ports.contains(&port) {
                warn!(service_type, port, "Overflow pool exhausted, forcing preferred port");
                return Ok(Allocation::fallback(ip, port));
            }
        }

        warn!(service_type, "Overflow pool exhausted");
        Err(RegistryError::ExhaustedPortRange {
            service_type: service_type.to_string(),
        })
    }

    fn is_free(&self, ip: IpAddr, port: u16) -> bool {
        port != 0
            && !self.config.reserved_ports.contains(&port)
            && !self.occupancy.is_held(&SocketAddr::new(ip, port))
    }

    fn is_candidate(&self, ip: IpAddr, port: u16, exclude: Option<PortRange>) -> bool {
        !exclude.is_some_and(|r| r.contains(port)) && self.is_free(ip, port)
    }

    fn scan<R: Rng + ?Sized>(
        &self,
        ip: IpAddr,
        range: PortRange,
        exclude: Option<PortRange>,
        rng: &mut R,
    ) -> Option<u16> {
        if range.is_empty() {
            return None;
        }

        if self.config.allocation_strategy == AllocationStrategy::Random {
            let attempts = range.len() * 2;
            for _ in 0..attempts {
                let port = rng.gen_range(range.start..=range.end);
                if self.is_candidate(ip, port, exclude) {
                    return Some(port);
                }
            }
            debug!(attempts, "Random sampling failed, falling back to sequential scan");
        }

        range
            .ports()
            .find(|&port| self.is_candidate(ip, port, exclude))
    }
}
