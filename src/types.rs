//! Shared data model
//!
//! Registrations, liveness status and conflict records as exposed by the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Liveness status derived from heartbeat timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Warning,
    Inactive,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Warning => "warning",
            Self::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

/// One registered service instance and its claimed endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_id: String,
    pub service_name: String,
    pub service_type: String,
    pub environment: String,
    pub ip: IpAddr,
    pub port: u16,
    pub status: ServiceStatus,
    /// Granted outside the nominal allocation path
    pub fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Port the service asked for, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_port: Option<u16>,
    pub heartbeat_interval_seconds: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl ServiceRegistration {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// HTTP URL of the endpoint
    pub fn endpoint_url(&self) -> String {
        format!("http://{}", self.endpoint())
    }

    /// Seconds since the last heartbeat, never negative
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> u64 {
        (now - self.last_heartbeat).num_seconds().max(0) as u64
    }

    /// Nominal allocations are covered by the endpoint uniqueness invariant
    pub fn is_nominal(&self) -> bool {
        !self.fallback
    }

    /// A preferred port was requested but a different one was granted
    pub fn preference_unfulfilled(&self) -> bool {
        matches!(self.preferred_port, Some(preferred) if preferred != self.port)
    }
}

/// Kind of detected inconsistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    PortConflict,
    PortUnavailable,
    AddressUnreachable,
}

/// Conflict severity, ordered low to high
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A service touched by a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedService {
    pub service_id: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl From<&ServiceRegistration> for AffectedService {
    fn from(reg: &ServiceRegistration) -> Self {
        Self {
            service_id: reg.service_id.clone(),
            ip: reg.ip,
            port: reg.port,
        }
    }
}

/// Concrete remediation behind a resolution suggestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Remediation {
    /// Move the service to a freshly allocated port
    Reallocate { service_id: String },
    /// Remove the service from the registry
    Deregister { service_id: String },
    /// Probe the address again
    Reprobe,
    /// Accept the current state as intended
    Accept,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub description: String,
    #[serde(flatten)]
    pub remediation: Remediation,
}

impl Suggestion {
    pub fn new(description: impl Into<String>, remediation: Remediation) -> Self {
        Self {
            description: description.into(),
            remediation,
        }
    }
}

/// Identity of the condition a conflict describes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConflictKey {
    Endpoint(SocketAddr),
    Address(IpAddr),
    Service(String),
}

/// A detected inconsistency in the allocation table
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub affected_services: Vec<AffectedService>,
    pub resolution_suggestions: Vec<Suggestion>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub key: ConflictKey,
}

impl Conflict {
    pub fn new(
        key: ConflictKey,
        conflict_type: ConflictType,
        severity: Severity,
        affected_services: Vec<AffectedService>,
        resolution_suggestions: Vec<Suggestion>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conflict_type,
            severity,
            timestamp: Utc::now(),
            affected_services,
            resolution_suggestions,
            resolved: false,
            resolved_at: None,
            key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registration(port: u16, preferred: Option<u16>) -> ServiceRegistration {
        let now = Utc::now();
        ServiceRegistration {
            service_id: "svc-1".into(),
            service_name: "Service".into(),
            service_type: "api".into(),
            environment: "development".into(),
            ip: "127.0.0.1".parse().unwrap(),
            port,
            status: ServiceStatus::Active,
            fallback: false,
            fallback_reason: None,
            preferred_port: preferred,
            heartbeat_interval_seconds: 60,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(registration(8001, None).endpoint_url(), "http://127.0.0.1:8001");
    }

    #[test]
    fn test_elapsed_never_negative() {
        let reg = registration(8001, None);
        let earlier = reg.last_heartbeat - Duration::seconds(30);
        assert_eq!(reg.elapsed_seconds(earlier), 0);
        let later = reg.last_heartbeat + Duration::seconds(160);
        assert_eq!(reg.elapsed_seconds(later), 160);
    }

    #[test]
    fn test_preference_unfulfilled() {
        assert!(!registration(8001, None).preference_unfulfilled());
        assert!(!registration(8001, Some(8001)).preference_unfulfilled());
        assert!(registration(8002, Some(8001)).preference_unfulfilled());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_suggestion_serialization() {
        let suggestion = Suggestion::new(
            "Move svc-2 to a free port",
            Remediation::Reallocate {
                service_id: "svc-2".into(),
            },
        );
        let json = serde_json::to_value(&suggestion).unwrap();
        assert_eq!(json["action"], "reallocate");
        assert_eq!(json["service_id"], "svc-2");
        assert_eq!(json["description"], "Move svc-2 to a free port");
    }
}
