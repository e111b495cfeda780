//! Configuration for the IP manager
//!
//! Process arguments come from clap (with environment fallbacks); the
//! registry itself is configured from a TOML file whose sections all have
//! defaults, so a missing file means a working default setup.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::allocation::AllocationConfig;
use crate::error::{RegistryError, Result};
use crate::types::Severity;

/// IP Manager - service registry and endpoint allocator
#[derive(Parser, Debug, Clone)]
#[command(name = "ip-manager")]
#[command(about = "Service registry and endpoint allocator for microservice fleets")]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "IP_MANAGER_CONFIG", default_value = "ip-manager.toml")]
    pub config: PathBuf,

    /// Address to listen on (overrides config file)
    #[arg(long, env = "IP_MANAGER_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Directory for the persisted registry (overrides config file)
    #[arg(long, env = "IP_MANAGER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub conflicts: ConflictSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// HTTP listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Where the registry snapshot lives; unset keeps the registry in memory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Interval for registrations that do not ask for one
    #[serde(default = "default_heartbeat_interval")]
    pub default_interval_secs: u64,

    /// K: a service is inactive after K missed intervals
    #[serde(default = "default_inactive_multiplier")]
    pub inactive_multiplier: u32,

    /// Lower bound for the sweep period
    #[serde(default = "default_min_sweep_interval")]
    pub min_sweep_interval_ms: u64,

    /// Remove registrations silent for this long; unset disables expiry
    #[serde(default)]
    pub expire_after_secs: Option<u64>,

    /// How far ahead of server time a heartbeat timestamp may be
    #[serde(default = "default_max_clock_skew")]
    pub max_clock_skew_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSettings {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    #[serde(default = "default_true")]
    pub probe_enabled: bool,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Severity of an unreachable address, per service type
    #[serde(default)]
    pub criticality: BTreeMap<String, Severity>,
}

/// Upper bound for `heartbeat.max_clock_skew_secs` (one day)
pub const MAX_CLOCK_SKEW_SECS: u64 = 86_400;

// Defaults
fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8020))
}
fn default_heartbeat_interval() -> u64 { 60 }
fn default_inactive_multiplier() -> u32 { 4 }
fn default_min_sweep_interval() -> u64 { 500 }
fn default_max_clock_skew() -> u64 { 5 }
fn default_scan_interval() -> u64 { 30 }
fn default_probe_timeout() -> u64 { 2000 }
fn default_true() -> bool { true }

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: None,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: default_heartbeat_interval(),
            inactive_multiplier: default_inactive_multiplier(),
            min_sweep_interval_ms: default_min_sweep_interval(),
            expire_after_secs: None,
            max_clock_skew_secs: default_max_clock_skew(),
        }
    }
}

impl Default for ConflictSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            probe_enabled: true,
            probe_timeout_ms: default_probe_timeout(),
            criticality: BTreeMap::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            allocation: AllocationConfig::default(),
            heartbeat: HeartbeatSettings::default(),
            conflicts: ConflictSettings::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RegistryError::InvalidConfig(e.to_string()))
    }

    /// Load from a file, using defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Apply command-line overrides
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = args.listen {
            self.server.listen = listen;
        }
        if let Some(ref data_dir) = args.data_dir {
            self.server.data_dir = Some(data_dir.clone());
        }
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.allocation.validate()?;

        if self.heartbeat.default_interval_secs == 0 {
            return Err(RegistryError::InvalidConfig(
                "heartbeat.default_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.inactive_multiplier < 1 {
            return Err(RegistryError::InvalidConfig(
                "heartbeat.inactive_multiplier must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.max_clock_skew_secs > MAX_CLOCK_SKEW_SECS {
            return Err(RegistryError::InvalidConfig(format!(
                "heartbeat.max_clock_skew_secs must be at most {MAX_CLOCK_SKEW_SECS}"
            )));
        }
        if self.conflicts.probe_timeout_ms == 0 {
            return Err(RegistryError::InvalidConfig(
                "conflicts.probe_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationStrategy, PortRange};

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_file() {
        let config = Config::from_toml(
            r#"
[server]
listen = "127.0.0.1:9999"
data_dir = "/var/lib/ip-manager"

[allocation]
service_ip_base = "10.0.0.1"
default_port_range = [20000, 21000]
allocation_strategy = "random"
fallback_mode = false
reserved_ports = [20001]

[allocation.service_type_ranges]
api = [20000, 20099]

[heartbeat]
default_interval_secs = 30
inactive_multiplier = 5
expire_after_secs = 3600

[conflicts]
scan_interval_secs = 10
probe_enabled = false

[conflicts.criticality]
finance = "high"
"#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.allocation.allocation_strategy, AllocationStrategy::Random);
        assert_eq!(config.allocation.default_port_range, PortRange::new(20000, 21000));
        assert_eq!(config.allocation.service_type_ranges.len(), 1);
        assert!(!config.allocation.fallback_mode);
        assert_eq!(config.heartbeat.inactive_multiplier, 5);
        assert_eq!(config.heartbeat.expire_after_secs, Some(3600));
        assert_eq!(config.conflicts.criticality.get("finance"), Some(&Severity::High));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_range_fails_validation() {
        let config = Config::from_toml(
            r#"
[allocation]
default_port_range = [9000, 8000]
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(RegistryError::InvalidConfig(_))));
    }

    #[test]
    fn test_args_override_file() {
        let args = Args::parse_from([
            "ip-manager",
            "--listen",
            "127.0.0.1:7000",
            "--data-dir",
            "/tmp/registry",
        ]);
        let mut config = Config::default();
        config.apply_args(&args);
        assert_eq!(config.server.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.server.data_dir, Some(PathBuf::from("/tmp/registry")));
    }

    #[test]
    fn test_clock_skew_is_bounded() {
        let mut config = Config::default();
        assert_eq!(config.heartbeat.max_clock_skew_secs, 5);

        config.heartbeat.max_clock_skew_secs = MAX_CLOCK_SKEW_SECS + 1;
        assert!(matches!(config.validate(), Err(RegistryError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/ip-manager.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
