//! Endpoint allocation
//!
//! Owns the hot-swappable allocation config and the port allocator that
//! picks free endpoints from it.

pub mod allocator;

pub use allocator::{Allocation, Allocator, Occupancy, FALLBACK_NO_AVAILABLE_PORT};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{RegistryError, Result};

/// Inclusive port range, serialized as `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u16; 2]", into = "[u16; 2]")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports in the range (0 for an inverted range)
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    fn validate(&self, label: &str) -> std::result::Result<(), String> {
        if self.start == 0 {
            return Err(format!("{label}: start port must be at least 1"));
        }
        if self.start > self.end {
            return Err(format!(
                "{label}: start {} is greater than end {}",
                self.start, self.end
            ));
        }
        Ok(())
    }
}

impl From<[u16; 2]> for PortRange {
    fn from([start, end]: [u16; 2]) -> Self {
        Self { start, end }
    }
}

impl From<PortRange> for [u16; 2] {
    fn from(range: PortRange) -> Self {
        [range.start, range.end]
    }
}

/// How free ports are picked within a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    #[default]
    Sequential,
    Random,
}

/// Allocation configuration, replaceable at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Address handed out unless a registration overrides it
    #[serde(default = "default_ip_base")]
    pub service_ip_base: IpAddr,

    /// Range for unknown service types and the overflow pool for fallback
    #[serde(default = "default_port_range")]
    pub default_port_range: PortRange,

    #[serde(default)]
    pub allocation_strategy: AllocationStrategy,

    /// Allow allocations outside a service type's nominal range
    #[serde(default = "default_true")]
    pub fallback_mode: bool,

    #[serde(default = "default_type_ranges")]
    pub service_type_ranges: BTreeMap<String, PortRange>,

    /// Ports that are never handed out
    #[serde(default = "default_reserved_ports")]
    pub reserved_ports: BTreeSet<u16>,
}

fn default_ip_base() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_port_range() -> PortRange {
    PortRange::new(8000, 9000)
}
fn default_true() -> bool {
    true
}
fn default_type_ranges() -> BTreeMap<String, PortRange> {
    [
        ("api", PortRange::new(8000, 8099)),
        ("web", PortRange::new(3000, 3099)),
        ("database", PortRange::new(5000, 5099)),
        ("observer", PortRange::new(8010, 8010)),
        ("finance", PortRange::new(8007, 8007)),
        ("minimal", PortRange::new(8005, 8005)),
    ]
    .into_iter()
    .map(|(name, range)| (name.to_string(), range))
    .collect()
}
fn default_reserved_ports() -> BTreeSet<u16> {
    [80, 443, 3000, 3001, 5000, 5001].into_iter().collect()
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            service_ip_base: default_ip_base(),
            default_port_range: default_port_range(),
            allocation_strategy: AllocationStrategy::default(),
            fallback_mode: true,
            service_type_ranges: default_type_ranges(),
            reserved_ports: default_reserved_ports(),
        }
    }
}

impl AllocationConfig {
    /// Nominal range for a service type, falling back to the default range
    pub fn range_for(&self, service_type: &str) -> PortRange {
        self.service_type_ranges
            .get(service_type)
            .copied()
            .unwrap_or(self.default_port_range)
    }

    /// Check every field, reporting all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.service_ip_base.is_unspecified() {
            problems.push(format!(
                "service_ip_base {} is not a routable address",
                self.service_ip_base
            ));
        }

        if let Err(e) = self.default_port_range.validate("default_port_range") {
            problems.push(e);
        }

        for (service_type, range) in &self.service_type_ranges {
            if service_type.trim().is_empty() {
                problems.push("service_type_ranges: empty service type name".to_string());
            }
            if let Err(e) = range.validate(&format!("service_type_ranges.{service_type}")) {
                problems.push(e);
            }
        }

        if self.reserved_ports.contains(&0) {
            problems.push("reserved_ports: port 0 is not a valid port".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::InvalidConfig(problems.join("; ")))
        }
    }
}

/// Holder of the live allocation config
///
/// Readers get an `Arc` snapshot; updates swap the whole config only after
/// it validates, and affect future allocations only.
pub struct ConfigManager {
    current: RwLock<Arc<AllocationConfig>>,
}

impl ConfigManager {
    /// Create a manager from an initial config, validating it first
    pub fn new(config: AllocationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Current config snapshot
    pub async fn get_config(&self) -> Arc<AllocationConfig> {
        Arc::clone(&*self.current.read().await)
    }

    /// Replace the config atomically, rejecting it whole if any field is invalid
    pub async fn set_config(&self, new_config: AllocationConfig) -> Result<()> {
        new_config.validate()?;

        let mut current = self.current.write().await;
        *current = Arc::new(new_config);

        info!(
            strategy = ?current.allocation_strategy,
            fallback_mode = current.fallback_mode,
            service_types = current.service_type_ranges.len(),
            "Allocation config updated"
        );
        Ok(())
    }

    /// Merge top-level fields of `patch` into the current config and apply it
    ///
    /// Fields absent from the patch keep their current values. The merged
    /// config is validated as a whole before it replaces the current one.
    pub async fn apply_patch(&self, patch: serde_json::Value) -> Result<Arc<AllocationConfig>> {
        let fields = match patch {
            serde_json::Value::Object(fields) => fields,
            other => {
                return Err(RegistryError::InvalidConfig(format!(
                    "expected a JSON object, got {other}"
                )))
            }
        };

        let mut current = self.current.write().await;
        let mut merged = serde_json::to_value(current.as_ref())
            .map_err(|e| RegistryError::Internal(e.to_string()))?;
        if let serde_json::Value::Object(ref mut map) = merged {
            for (key, value) in fields {
                if !map.contains_key(&key) {
                    return Err(RegistryError::InvalidConfig(format!("unknown field '{key}'")));
                }
                map.insert(key, value);
            }
        }

        let new_config: AllocationConfig = serde_json::from_value(merged)
            .map_err(|e| RegistryError::InvalidConfig(e.to_string()))?;
        new_config.validate()?;

        *current = Arc::new(new_config);
        info!(
            strategy = ?current.allocation_strategy,
            fallback_mode = current.fallback_mode,
            service_types = current.service_type_ranges.len(),
            "Allocation config updated"
        );
        Ok(Arc::clone(&current))
    }
}
