//! Adapter configuration
//!
//! YAML-loadable configuration for the daemon and embedding hosts: which
//! channel to use, which devices to drive and how often to poll them.
//! CAN identifiers are written as hex strings ("0x680") the way the bus
//! documentation spells them.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use e3can_core::OpMode;

/// Default request timeout per exchange, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 7500;

/// Offset between a device's transmit ID and its receive ID.
pub const RX_ID_OFFSET: u16 = 0x10;

/// Transmit-ID offset of the companion SID-0x77 session.
pub const SERVICE77_TX_OFFSET: u16 = 0x02;

/// Top-level adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Root of the published state key space
    #[serde(default = "default_state_prefix")]
    pub state_prefix: String,
    /// CAN channel selection
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Catalog shared by every device on the bus
    #[serde(default)]
    pub common_catalog: Option<PathBuf>,
    /// Devices to drive
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_state_prefix() -> String {
    "e3can".to_string()
}

impl AdapterConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// CAN channel selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// In-memory channel for tests and demos
    Mock,
    /// Raw SocketCAN interface (Linux only)
    SocketCan(SocketCanConfig),
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::Mock
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// Interface name (e.g. "can0")
    pub interface: String,
}

/// One logical E3 device on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name; doubles as the state path segment for this device
    pub name: String,
    /// 11-bit transmit identifier (adapter -> device)
    #[serde(with = "hex_id")]
    pub tx_id: u16,
    /// Per-exchange timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Initial operation mode
    #[serde(default)]
    pub op_mode: OpMode,
    /// Periodic read schedules
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    /// Device-specific catalog layered over the common one
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl DeviceConfig {
    /// Minimal configuration with defaults everywhere else.
    pub fn new(name: impl Into<String>, tx_id: u16) -> Self {
        Self {
            name: name.into(),
            tx_id,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            op_mode: OpMode::default(),
            schedules: Vec::new(),
            catalog: None,
        }
    }

    /// Receive identifier (device -> adapter); fixed at `tx_id + 0x10`.
    pub fn rx_id(&self) -> u16 {
        self.tx_id + RX_ID_OFFSET
    }

    /// Derive the companion session configuration for SID-0x77 writes.
    pub fn service77_companion(&self) -> Self {
        Self {
            name: format!("{}_77", self.name),
            tx_id: self.tx_id + SERVICE77_TX_OFFSET,
            timeout_ms: self.timeout_ms,
            op_mode: OpMode::Service77,
            schedules: Vec::new(),
            catalog: self.catalog.clone(),
        }
    }
}

/// One periodic read loop: period 0 fires once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub period_s: u32,
    pub dids: Vec<u16>,
}

/// Serde helper for 11-bit CAN identifiers written as "0x680".
mod hex_id {
    use super::*;

    pub fn serialize<S: Serializer>(id: &u16, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format!("0x{:03X}", id))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<u16, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u16),
            Text(String),
        }

        let id = match Raw::deserialize(de)? {
            Raw::Num(n) => n,
            Raw::Text(s) => {
                let t = s.trim().trim_start_matches("0x").trim_start_matches("0X");
                u16::from_str_radix(t, 16)
                    .map_err(|_| serde::de::Error::custom(format!("invalid CAN id '{}'", s)))?
            }
        };
        if id > 0x7FF {
            return Err(serde::de::Error::custom(format!(
                "CAN id 0x{:X} exceeds 11 bits",
                id
            )));
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ids() {
        let dev = DeviceConfig::new("vitocal", 0x680);
        assert_eq!(dev.rx_id(), 0x690);

        let companion = dev.service77_companion();
        assert_eq!(companion.tx_id, 0x682);
        assert_eq!(companion.rx_id(), 0x692);
        assert_eq!(companion.op_mode, OpMode::Service77);
        assert!(companion.schedules.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
state_prefix: e3can
channel:
  type: mock
devices:
  - name: vitocal
    tx_id: "0x680"
    timeout_ms: 5000
    schedules:
      - period_s: 60
        dids: [396, 600]
      - period_s: 0
        dids: [268]
"#;
        let config = AdapterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.devices.len(), 1);

        let dev = &config.devices[0];
        assert_eq!(dev.tx_id, 0x680);
        assert_eq!(dev.timeout_ms, 5000);
        assert_eq!(dev.op_mode, OpMode::Normal);
        assert_eq!(dev.schedules.len(), 2);
        assert_eq!(dev.schedules[1].period_s, 0);
    }

    #[test]
    fn test_rejects_oversized_id() {
        let yaml = r#"
devices:
  - name: broken
    tx_id: "0x800"
"#;
        assert!(AdapterConfig::from_yaml(yaml).is_err());
    }
}
