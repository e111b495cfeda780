//! Registry persistence across restarts

use ip_manager::registry::{RegisterRequest, REGISTRY_FILE};
use ip_manager::{Config, Registry, RegistryError};

fn request(id: &str, service_type: &str) -> RegisterRequest {
    serde_json::from_value(serde_json::json!({
        "service_id": id,
        "service_name": id,
        "service_type": service_type,
    }))
    .unwrap()
}

fn config_in(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.server.data_dir = Some(dir.to_path_buf());
    config.conflicts.probe_enabled = false;
    config
}

#[tokio::test]
async fn test_registrations_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let (api_port, web_port) = {
        let registry = Registry::open(&config).await.unwrap();
        let api = registry.register(request("api-1", "api")).await.unwrap();
        let web = registry.register(request("web-1", "web")).await.unwrap();
        registry.deregister("web-1").await.unwrap();
        registry.register(request("web-2", "web")).await.unwrap();
        (api.port, web.port)
    };
    assert!(dir.path().join(REGISTRY_FILE).exists());

    let registry = Registry::open(&config).await.unwrap();
    assert_eq!(registry.get("api-1").await.unwrap().port, api_port);
    assert!(registry.get("web-1").await.is_err());
    assert_eq!(registry.get("web-2").await.unwrap().port, web_port);

    // Restored endpoints stay held
    let next = registry.register(request("api-2", "api")).await.unwrap();
    assert_ne!(next.port, api_port);
}

#[tokio::test]
async fn test_corrupt_snapshot_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(REGISTRY_FILE), "{ not json").unwrap();

    let err = Registry::open(&config_in(dir.path())).await.err().unwrap();
    assert!(matches!(err, RegistryError::Internal(_)));
}

#[tokio::test]
async fn test_config_file_drives_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ip-manager.toml");
    std::fs::write(
        &path,
        r#"
[allocation]
service_ip_base = "10.1.2.3"
reserved_ports = [9100]

[allocation.service_type_ranges]
metrics = [9100, 9101]

[conflicts]
probe_enabled = false
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    let registry = Registry::open(&config).await.unwrap();
    let reg = registry.register(request("m", "metrics")).await.unwrap();

    assert_eq!(reg.ip.to_string(), "10.1.2.3");
    assert_eq!(reg.port, 9101);
}
