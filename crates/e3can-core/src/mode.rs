//! Session operation modes

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse lifecycle switch controlling what a device session will do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpMode {
    /// All exchanges blocked; commands stay queued.
    Standby,
    /// Schedules, user commands and the automatic write retry are active.
    #[default]
    Normal,
    /// Device scan: probe addresses, report every decoded result.
    UdsDevScan,
    /// DID scan: probe identifiers one by one, report every decoded result.
    UdsDidScan,
    /// Only the SID-0x77 write path is served.
    Service77,
    /// Decode and report, but never publish to the state store.
    Test,
}

impl OpMode {
    /// Whether the queue drain may dispatch anything at all.
    pub fn allows_dispatch(&self) -> bool {
        !matches!(self, OpMode::Standby)
    }

    /// Whether decoded read results are written to the state store.
    /// The scan and test modes decode and report through the callback only.
    pub fn publishes(&self) -> bool {
        matches!(self, OpMode::Normal)
    }
}

impl fmt::Display for OpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpMode::Standby => "standby",
            OpMode::Normal => "normal",
            OpMode::UdsDevScan => "uds_dev_scan",
            OpMode::UdsDidScan => "uds_did_scan",
            OpMode::Service77 => "service77",
            OpMode::Test => "test",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_gate() {
        assert!(!OpMode::Standby.allows_dispatch());
        assert!(OpMode::Normal.allows_dispatch());
        assert!(OpMode::Service77.allows_dispatch());
    }

    #[test]
    fn test_publish_gate() {
        assert!(OpMode::Normal.publishes());
        assert!(!OpMode::Test.publishes());
        assert!(!OpMode::UdsDidScan.publishes());
    }

    #[test]
    fn test_serde_round_trip() {
        let mode: OpMode = serde_json::from_str("\"uds_did_scan\"").unwrap();
        assert_eq!(mode, OpMode::UdsDidScan);
        assert_eq!(serde_json::to_string(&mode).unwrap(), "\"uds_did_scan\"");
    }
}
