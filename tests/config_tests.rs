use siobus::config::*;
use siobus::*;
use std::path::PathBuf;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("siobus-{}-{}.toml", name, std::process::id()))
}

#[test]
fn test_defaults() {
    let config = BusConfig::default();

    assert_eq!(config.link.baud, 19_200);
    assert_eq!(config.link.high_speed_index, 6);
    assert_eq!(config.link.checksum, ChecksumPolicy::Additive);
    assert_eq!(config.link.checksum_failure_threshold, 2);
    assert_eq!(config.protocol.broadcast_id, 0x4F);
    assert_eq!(config.timing.t4_us, 850);
    assert_eq!(config.timing.t5_us, 250);
    assert_eq!(config.transport.kind, TransportKind::NetSio);
    assert_eq!(config.transport.port, DEFAULT_NETSIO_PORT);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_overrides() {
    let text = r#"
        [link]
        high_speed_index = 10
        checksum = "xor"

        [transport]
        host = "hub.local"
        port = 9999

        [devices.disk]
        id = 0x32
        sectors = 1040
    "#;
    let config = BusConfig::from_toml_str(text).unwrap();

    assert_eq!(config.link.high_speed_index, 10);
    assert_eq!(config.link.checksum, ChecksumPolicy::Xor);
    assert_eq!(config.link.baud, 19_200);
    assert_eq!(config.transport.host, "hub.local");
    assert_eq!(config.transport.port, 9999);
    assert_eq!(config.devices.disk.id, 0x32);
    assert_eq!(config.devices.disk.sectors, 1040);
    assert!(config.devices.clock.enabled);

    let engine = config.engine();
    assert_eq!(engine.link.checksum, ChecksumPolicy::Xor);
}

#[test]
fn test_invalid_values_rejected() {
    assert!(matches!(
        BusConfig::from_toml_str("[link]\nhigh_speed_index = -2\n"),
        Err(ConfigError::Invalid(_))
    ));
    assert!(matches!(
        BusConfig::from_toml_str("[link]\nhigh_speed_index = 256\n"),
        Err(ConfigError::Invalid(_))
    ));
    assert!(BusConfig::from_toml_str("[link]\nhigh_speed_index = 255\n").is_ok());
    assert!(matches!(
        BusConfig::from_toml_str("[devices.clock]\nid = 0x31\n"),
        Err(ConfigError::Invalid(_))
    ));
    assert!(matches!(
        BusConfig::from_toml_str("[link]\nchecksum = \"crc\"\n"),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_missing_file_gives_defaults() {
    let path = temp_path("missing");
    let _ = std::fs::remove_file(&path);
    assert_eq!(BusConfig::load(&path).unwrap(), BusConfig::default());
}

#[test]
fn test_save_then_load_persists_index() {
    let path = temp_path("persist");
    let mut config = BusConfig::default();
    config.link.high_speed_index = 16;
    config.save(&path).unwrap();

    let loaded = BusConfig::load(&path).unwrap();
    assert_eq!(loaded.link.high_speed_index, 16);
    assert_eq!(loaded, config);

    std::fs::remove_file(&path).unwrap();
}
