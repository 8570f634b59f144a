//! DID descriptors
//!
//! The YAML-facing shape of a catalog entry and its resolved in-memory form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::{ByteOrder, Codec};
use crate::error::ConvResult;

/// A fully resolved catalog entry for one DID.
#[derive(Debug, Clone)]
pub struct DidDescriptor {
    /// DID number
    pub did: u16,
    /// Symbolic identifier the value is published under
    pub id: String,
    /// Human-readable display name
    pub name: Option<String>,
    /// Declared payload length in bytes
    pub len: u16,
    /// Resolved codec
    pub codec: Codec,
}

impl DidDescriptor {
    /// Flattened `(codec-name, length)` structural signature.
    pub fn signature(&self) -> Vec<(String, u16)> {
        self.codec.signature()
    }
}

/// Catalog-file shape of a DID entry, before codec resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDescriptor {
    /// Symbolic identifier (e.g. "FlowTempSensor")
    pub id: String,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Codec name out of the closed family
    pub codec: String,
    /// Declared payload length in bytes
    pub len: u16,
    /// Codec arguments
    #[serde(default)]
    pub args: CodecArgs,
}

impl RawDescriptor {
    /// Resolve into a [`DidDescriptor`], validating the codec spec.
    pub fn resolve(&self, did: u16) -> ConvResult<DidDescriptor> {
        Ok(DidDescriptor {
            did,
            id: self.id.clone(),
            name: self.name.clone(),
            len: self.len,
            codec: Codec::from_spec(&self.codec, self.len, &self.args)?,
        })
    }
}

/// Arguments a codec spec may carry.
///
/// Which ones are required depends on the codec; `Codec::from_spec` checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodecArgs {
    /// `int`: two's complement interpretation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed: Option<bool>,
    /// `int`: physical = raw * scale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    /// `int`/`float`: byte order, big-endian when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_order: Option<ByteOrder>,
    /// `mapping`: raw value to label table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<BTreeMap<u32, String>>,
    /// `struct`: ordered member fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<RawField>>,
}

/// One member of a `struct` codec spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawField {
    pub name: String,
    pub codec: String,
    pub len: u16,
    #[serde(default)]
    pub args: CodecArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_from_yaml() {
        let yaml = r#"
id: FlowTempSensor
name: Flow temperature sensor
codec: int
len: 2
args:
  signed: true
  scale: 0.1
"#;
        let raw: RawDescriptor = serde_yaml::from_str(yaml).unwrap();
        let desc = raw.resolve(0x018C).unwrap();

        assert_eq!(desc.did, 0x018C);
        assert_eq!(desc.id, "FlowTempSensor");
        assert_eq!(desc.len, 2);
        assert_eq!(
            desc.codec,
            Codec::Int {
                bytes: 2,
                signed: true,
                scale: 0.1,
                byte_order: ByteOrder::Big,
            }
        );
    }

    #[test]
    fn test_resolve_struct_from_yaml() {
        let yaml = r#"
id: MixerCircuit
codec: struct
len: 5
args:
  fields:
    - name: Mode
      codec: mapping
      len: 1
      args:
        map:
          0: "Off"
          1: "Heating"
    - name: FlowTemp
      codec: int
      len: 2
      args: { signed: true, scale: 0.1 }
    - name: Pump
      codec: int
      len: 2
"#;
        let raw: RawDescriptor = serde_yaml::from_str(yaml).unwrap();
        let desc = raw.resolve(0x0100).unwrap();

        assert_eq!(desc.codec.declared_len(), 5);
        assert_eq!(
            desc.signature(),
            vec![
                ("mapping".to_string(), 1),
                ("int".to_string(), 2),
                ("int".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_resolve_rejects_bad_length() {
        let yaml = r#"
id: Broken
codec: struct
len: 4
args:
  fields:
    - name: OnlyByte
      codec: int
      len: 1
"#;
        let raw: RawDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert!(raw.resolve(0x0001).is_err());
    }
}
