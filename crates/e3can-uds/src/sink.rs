//! Decode sink
//!
//! Takes `(did, raw bytes)` from a successful read, runs the catalog codec
//! and publishes the result through three parallel views:
//!
//! - `{prefix}.raw.{id}`  - hex string of the payload
//! - `{prefix}.json.{id}` - decoded value as a compact JSON string
//! - `{prefix}.tree.{id}` - hierarchical objects, one state per leaf
//!
//! DIDs whose stored length disagrees with the catalog, and DIDs missing
//! from the catalog entirely, are treated as device-specific: raw hex only.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use e3can_conv::{format_did, DidCatalog};
use e3can_core::{sanitize_id, StateStore};

/// Safety cap on children expanded per tree level.
pub const TREE_CHILD_CAP: usize = 100;

/// Publishes decoded values for one device.
pub struct DecodeSink {
    catalog: Arc<DidCatalog>,
    store: Arc<dyn StateStore>,
    prefix: String,
}

impl DecodeSink {
    pub fn new(catalog: Arc<DidCatalog>, store: Arc<dyn StateStore>, prefix: impl Into<String>) -> Self {
        Self {
            catalog,
            store,
            prefix: prefix.into(),
        }
    }

    pub fn catalog(&self) -> &DidCatalog {
        &self.catalog
    }

    pub fn catalog_arc(&self) -> Arc<DidCatalog> {
        self.catalog.clone()
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The sanitized publish id for a DID: its catalog id, or the
    /// device-specific fallback when the catalog has nothing.
    pub fn symbolic_id(&self, did: u16) -> String {
        match self.catalog.get(did) {
            Some(desc) => sanitize_id(&desc.id),
            None => device_specific_id(did),
        }
    }

    /// Decode without touching the store. Returns the publish id and the
    /// decoded value (None for device-specific or failed decodes).
    pub fn decode_only(&self, did: u16, raw: &[u8]) -> (String, Option<Value>) {
        match self.catalog.get(did) {
            Some(desc) if desc.len as usize == raw.len() => {
                let id = sanitize_id(&desc.id);
                match desc.codec.decode(raw) {
                    Ok(value) => (id, Some(value)),
                    Err(e) => {
                        warn!(
                            did = %format_did(did),
                            error = %e,
                            "decode failed, falling back to raw hex"
                        );
                        (id, None)
                    }
                }
            }
            Some(desc) => {
                debug!(
                    did = %format_did(did),
                    declared = desc.len,
                    actual = raw.len(),
                    "length mismatch, treating as device-specific"
                );
                (device_specific_id(did), None)
            }
            None => (device_specific_id(did), None),
        }
    }

    /// Decode and publish all three views. Returns the publish id and the
    /// decoded value.
    pub fn publish(&self, did: u16, raw: &[u8]) -> (String, Option<Value>) {
        let (id, value) = self.decode_only(did, raw);

        self.store
            .set(&format!("{}.raw.{}", self.prefix, id), json!(hex::encode(raw)));

        if let Some(value) = &value {
            let compact = serde_json::to_string(value).unwrap_or_default();
            self.store
                .set(&format!("{}.json.{}", self.prefix, id), json!(compact));
            self.publish_tree(&format!("{}.tree.{}", self.prefix, id), value);
        }

        (id, value)
    }

    /// Delete the published tree for one publish id.
    pub fn delete_tree(&self, id: &str) {
        let path = format!("{}.tree.{}", self.prefix, id);
        self.store.delete(&path);
        // children only; a sibling id sharing this one as a prefix stays
        self.store.delete_prefix(&format!("{}.", path));
    }

    /// Re-publish a DID from the raw hex already in the store. Used by the
    /// catalog migration to rebuild views after a codec change.
    pub fn republish_from_stored(&self, did: u16) {
        let id = self.symbolic_id(did);
        let raw_path = format!("{}.raw.{}", self.prefix, id);
        let Some(Value::String(hex_str)) = self.store.get(&raw_path) else {
            return;
        };
        let Ok(raw) = hex::decode(&hex_str) else {
            warn!(path = %raw_path, "stored raw value is not valid hex");
            return;
        };
        self.publish(did, &raw);
    }

    fn publish_tree(&self, path: &str, value: &Value) {
        match value {
            Value::Object(map) => {
                if map.len() > TREE_CHILD_CAP {
                    warn!(path, children = map.len(), "tree level truncated");
                }
                for (key, child) in map.iter().take(TREE_CHILD_CAP) {
                    self.publish_tree(&format!("{}.{}", path, sanitize_id(key)), child);
                }
            }
            Value::Array(items) => {
                if items.len() > TREE_CHILD_CAP {
                    warn!(path, children = items.len(), "tree level truncated");
                }
                for (i, child) in items.iter().take(TREE_CHILD_CAP).enumerate() {
                    self.publish_tree(&format!("{}.{}", path, i), child);
                }
            }
            Value::Number(_) => self.store.set(path, value.clone()),
            Value::String(s) => self.store.set(path, json!(s)),
            other => self.store.set(path, json!(other.to_string())),
        }
    }
}

fn device_specific_id(did: u16) -> String {
    format!("{}_DeviceSpecific", format_did(did))
}

#[cfg(test)]
mod tests {
    use super::*;
    use e3can_core::MemoryStore;

    fn sink_with(catalog_yaml: &str) -> (DecodeSink, Arc<MemoryStore>) {
        let catalog = Arc::new(DidCatalog::from_yaml(catalog_yaml).unwrap());
        let store = Arc::new(MemoryStore::new());
        let sink = DecodeSink::new(catalog, store.clone(), "e3can.vitocal");
        (sink, store)
    }

    const CATALOG: &str = r#"
meta: { version: "0.6.2" }
dids:
  "0x018C":
    id: FlowTempSensor
    codec: int
    len: 2
    args: { signed: true, scale: 0.1 }
  "0x0100":
    id: MixerOneCircuit
    codec: struct
    len: 3
    args:
      fields:
        - name: Mode
          codec: mapping
          len: 1
          args:
            map: { 0: "Off", 2: "Heating" }
        - name: FlowTemp
          codec: int
          len: 2
          args: { signed: true, scale: 0.1 }
"#;

    #[test]
    fn test_publish_scalar_views() {
        let (sink, store) = sink_with(CATALOG);

        let (id, value) = sink.publish(0x018C, &[0x01, 0xC2]);
        assert_eq!(id, "FlowTempSensor");
        assert_eq!(value, Some(json!(45)));

        assert_eq!(
            store.get("e3can.vitocal.raw.FlowTempSensor"),
            Some(json!("01c2"))
        );
        assert_eq!(
            store.get("e3can.vitocal.json.FlowTempSensor"),
            Some(json!("45"))
        );
        assert_eq!(
            store.get("e3can.vitocal.tree.FlowTempSensor"),
            Some(json!(45))
        );
    }

    #[test]
    fn test_publish_struct_tree() {
        let (sink, store) = sink_with(CATALOG);

        sink.publish(0x0100, &[0x02, 0x01, 0xC2]);

        assert_eq!(
            store.get("e3can.vitocal.tree.MixerOneCircuit.Mode.value"),
            Some(json!(2))
        );
        assert_eq!(
            store.get("e3can.vitocal.tree.MixerOneCircuit.Mode.label"),
            Some(json!("Heating"))
        );
        assert_eq!(
            store.get("e3can.vitocal.tree.MixerOneCircuit.FlowTemp"),
            Some(json!(45))
        );
    }

    #[test]
    fn test_length_mismatch_is_device_specific() {
        let (sink, store) = sink_with(CATALOG);

        let (id, value) = sink.publish(0x018C, &[0x01, 0xC2, 0x00]);
        assert_eq!(id, "018C_DeviceSpecific");
        assert_eq!(value, None);

        assert_eq!(
            store.get("e3can.vitocal.raw.018C_DeviceSpecific"),
            Some(json!("01c200"))
        );
        // no json/tree views for device-specific payloads
        assert!(store.get("e3can.vitocal.json.018C_DeviceSpecific").is_none());
    }

    #[test]
    fn test_unknown_did_is_device_specific() {
        let (sink, store) = sink_with(CATALOG);

        let (id, _) = sink.publish(0x0BEE, &[0xAA]);
        assert_eq!(id, "0BEE_DeviceSpecific");
        assert_eq!(
            store.get("e3can.vitocal.raw.0BEE_DeviceSpecific"),
            Some(json!("aa"))
        );
    }

    #[test]
    fn test_republish_from_stored() {
        let (sink, store) = sink_with(CATALOG);

        sink.publish(0x018C, &[0x01, 0xC2]);
        sink.delete_tree("FlowTempSensor");
        assert!(store.get("e3can.vitocal.tree.FlowTempSensor").is_none());

        sink.republish_from_stored(0x018C);
        assert_eq!(
            store.get("e3can.vitocal.tree.FlowTempSensor"),
            Some(json!(45))
        );
    }
}
