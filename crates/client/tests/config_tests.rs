//! Configuration file loading and saving

use client::ClientConfig;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_save_and_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("client.toml");

    let mut config = ClientConfig::default();
    config.device.selector = "05ac:12a8".to_string();
    config.device.interface = 2;
    config.timing.discovery_deadline_ms = Some(1500);
    config.save(&path).unwrap();

    let loaded = ClientConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.device.selector, "05ac:12a8");
    assert_eq!(loaded.device.interface, 2);
    assert_eq!(loaded.timing.discovery_deadline_ms, Some(1500));
}

#[test]
fn test_load_minimal_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("client.toml");
    fs::write(
        &path,
        r#"
[client]
log_level = "debug"

[device]
selector = "0x1234:0x5678"

[timing]
retry_interval_ms = 50
control_timeout_ms = 10
async_timeout_ms = 250
"#,
    )
    .unwrap();

    let config = ClientConfig::load(Some(path)).unwrap();
    assert_eq!(config.client.log_level, "debug");
    assert_eq!(config.device.interface, 0);
    assert_eq!(config.device.alt_setting, 0);
    assert_eq!(config.async_timeout(), Duration::from_millis(250));

    let selector = config.selector().unwrap();
    assert_eq!(selector.vendor_id, 0x1234);
    assert_eq!(selector.product_id, 0x5678);

    let options = config.session_options();
    assert_eq!(options.connect.retry_interval, Duration::from_millis(50));
    assert_eq!(options.control_timeout, Duration::from_millis(10));
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("client.toml");

    let mut config = ClientConfig::default();
    config.device.selector = "not-a-device".to_string();
    fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
    assert!(ClientConfig::load(Some(path.clone())).is_err());

    fs::write(&path, "[client]\nlog_level = \"info\"\n").unwrap();
    assert!(ClientConfig::load(Some(path)).is_err());
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    assert!(ClientConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}
