//! On-disk snapshot of the registration table
//!
//! The table is written as a JSON object keyed by service id. Writes go to a
//! temporary file first and are renamed into place, so a crash never leaves a
//! half-written registry behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::types::ServiceRegistration;

/// File name of the registry snapshot inside the data directory
pub const REGISTRY_FILE: &str = "ip_registry.json";

/// JSON snapshot store for registrations
#[derive(Debug, Clone)]
pub struct Persistence {
    path: PathBuf,
}

impl Persistence {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot; a missing file is an empty registry
    pub async fn load(&self) -> Result<Vec<ServiceRegistration>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No registry snapshot found");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let table: BTreeMap<String, ServiceRegistration> =
            serde_json::from_str(&content).map_err(|e| {
                RegistryError::Internal(format!(
                    "corrupt registry snapshot {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        info!(
            path = %self.path.display(),
            count = table.len(),
            "Loaded registry snapshot"
        );
        Ok(table.into_values().collect())
    }

    /// Write the snapshot atomically
    pub async fn save<'a>(
        &self,
        registrations: impl IntoIterator<Item = &'a ServiceRegistration>,
    ) -> Result<()> {
        let table: BTreeMap<&str, &ServiceRegistration> = registrations
            .into_iter()
            .map(|reg| (reg.service_id.as_str(), reg))
            .collect();
        let json = serde_json::to_vec_pretty(&table)
            .map_err(|e| RegistryError::Internal(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), count = table.len(), "Saved registry snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceStatus;
    use chrono::Utc;

    fn registration(id: &str, port: u16) -> ServiceRegistration {
        let now = Utc::now();
        ServiceRegistration {
            service_id: id.into(),
            service_name: id.into(),
            service_type: "api".into(),
            environment: "test".into(),
            ip: "127.0.0.1".parse().unwrap(),
            port,
            status: ServiceStatus::Active,
            fallback: false,
            fallback_reason: None,
            preferred_port: None,
            heartbeat_interval_seconds: 60,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let persistence = Persistence::new(dir.path());
        assert!(persistence.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let persistence = Persistence::new(dir.path().join("nested"));

        let regs = vec![registration("a", 8000), registration("b", 8001)];
        persistence.save(&regs).await.unwrap();

        let mut loaded = persistence.load().await.unwrap();
        loaded.sort_by(|x, y| x.service_id.cmp(&y.service_id));
        assert_eq!(loaded, regs);
        assert!(!persistence.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let persistence = Persistence::new(dir.path());
        std::fs::write(persistence.path(), "not json").unwrap();
        let err = persistence.load().await.unwrap_err();
        assert!(matches!(err, RegistryError::Internal(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
