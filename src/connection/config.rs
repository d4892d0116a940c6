//! Per-connection policy
//!
//! `ConnectionConfig` is fixed when a connection is opened. Only the
//! auto-reconnect toggle and the write-type overrides can change later, and
//! those changes go through the connection's command channel.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::gatt::CharacteristicId;
use crate::ble::transport::{PhyMask, TransportMode, WriteType};

/// Requests are never given less than this long to complete.
pub const MIN_REQUEST_TIMEOUT_MILLIS: u64 = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Delay between link-up and service discovery.
    pub discover_services_delay_millis: u64,
    /// How long a connect attempt may take to reach ServiceDiscovered.
    pub connect_timeout_millis: u64,
    pub request_timeout_millis: u64,
    /// Maximum reconnect attempts; `None` retries forever.
    pub try_reconnect_times: Option<u32>,
    /// Pause between the packets of a fragmented write.
    pub package_write_delay_millis: u64,
    /// Pause before every write request. Falls back to
    /// `package_write_delay_millis` when unset.
    pub request_write_delay_millis: Option<u64>,
    /// Bytes per packet for characteristic writes.
    pub package_size: usize,
    /// Wait for the peer to acknowledge each packet before sending the next.
    pub wait_write_result: bool,
    /// Address-based reconnects before falling back to scanning.
    pub reconnect_immediately_times: u32,
    /// Write-type overrides keyed by `"service:characteristic"`.
    pub write_types: HashMap<String, WriteType>,
    pub auto_reconnect: bool,
    pub transport_mode: TransportMode,
    /// PHYs to prefer when opening an LE link.
    pub phy: PhyMask,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            discover_services_delay_millis: 500,
            connect_timeout_millis: 10_000,
            request_timeout_millis: 3_000,
            try_reconnect_times: None,
            package_write_delay_millis: 0,
            request_write_delay_millis: None,
            package_size: 20,
            wait_write_result: true,
            reconnect_immediately_times: 3,
            write_types: HashMap::new(),
            auto_reconnect: true,
            transport_mode: TransportMode::Le,
            phy: PhyMask::LE_1M,
        }
    }
}

impl ConnectionConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: ConnectionConfig = serde_json::from_slice(&data)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        Ok(config.normalized())
    }

    /// Clamp values that would otherwise stall the connection.
    pub fn normalized(mut self) -> Self {
        self.request_timeout_millis = self.request_timeout_millis.max(MIN_REQUEST_TIMEOUT_MILLIS);
        if self.package_size == 0 {
            self.package_size = ConnectionConfig::default().package_size;
        }
        self
    }

    pub fn discover_services_delay(&self) -> Duration {
        Duration::from_millis(self.discover_services_delay_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis.max(MIN_REQUEST_TIMEOUT_MILLIS))
    }

    pub fn package_write_delay(&self) -> Duration {
        Duration::from_millis(self.package_write_delay_millis)
    }

    /// Delay applied before the first packet of every write request.
    pub fn request_write_delay(&self) -> Duration {
        Duration::from_millis(
            self.request_write_delay_millis
                .unwrap_or(self.package_write_delay_millis),
        )
    }

    pub fn write_type(&self, target: &CharacteristicId) -> WriteType {
        self.write_types
            .get(&target.config_key())
            .copied()
            .unwrap_or_default()
    }

    pub fn set_write_type(&mut self, target: &CharacteristicId, write_type: WriteType) {
        self.write_types.insert(target.config_key(), write_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::uuid_from_short;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.discover_services_delay(), Duration::from_millis(500));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.try_reconnect_times, None);
        assert_eq!(config.package_size, 20);
        assert!(config.wait_write_result);
        assert_eq!(config.reconnect_immediately_times, 3);
        assert!(config.auto_reconnect);
        assert_eq!(config.transport_mode, TransportMode::Le);
        assert_eq!(config.phy, PhyMask::LE_1M);
    }

    #[test]
    fn test_request_timeout_floor() {
        let config = ConnectionConfig {
            request_timeout_millis: 10,
            package_size: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.request_timeout_millis, MIN_REQUEST_TIMEOUT_MILLIS);
        assert_eq!(config.package_size, 20);
    }

    #[test]
    fn test_request_write_delay_fallback() {
        let mut config = ConnectionConfig {
            package_write_delay_millis: 15,
            ..Default::default()
        };
        assert_eq!(config.request_write_delay(), Duration::from_millis(15));
        config.request_write_delay_millis = Some(40);
        assert_eq!(config.request_write_delay(), Duration::from_millis(40));
    }

    #[test]
    fn test_write_type_overrides() {
        let target = CharacteristicId::new(uuid_from_short(0xFFE0), uuid_from_short(0xFFE1));
        let mut config = ConnectionConfig::default();
        assert_eq!(config.write_type(&target), WriteType::Default);
        config.set_write_type(&target, WriteType::NoResponse);
        assert_eq!(config.write_type(&target), WriteType::NoResponse);
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"package_size": 64, "wait_write_result": false, "try_reconnect_times": 5, "request_timeout_millis": 200, "phy": 3}}"#
        )
        .unwrap();

        let config = ConnectionConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.package_size, 64);
        assert!(!config.wait_write_result);
        assert_eq!(config.try_reconnect_times, Some(5));
        assert_eq!(config.request_timeout_millis, MIN_REQUEST_TIMEOUT_MILLIS);
        assert_eq!(config.connect_timeout_millis, 10_000);
        assert_eq!(config.phy, PhyMask::LE_1M | PhyMask::LE_2M);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(
            ConnectionConfig::from_json_file(&missing),
            Err(ConfigError::IoError(_))
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"{ not json").unwrap();
        assert!(matches!(
            ConnectionConfig::from_json_file(&bad),
            Err(ConfigError::DeserializationError(_))
        ));
    }
}
