//! Catalog migration
//!
//! The structural signatures of the last-seen catalog are persisted next to
//! the published values. When a newer catalog ships, every DID whose
//! signature changed gets its tree deleted and re-published from the stored
//! raw bytes with the new codec, so the host never sees a leaf change type
//! under it silently.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use e3can_conv::{format_did, version_cmp, TYPE_FIX_VERSION, VARIABLE_LENGTH_DIDS};

use crate::sink::DecodeSink;

/// Persisted shape of the catalog bookkeeping blob.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCatalog {
    version: String,
    /// Structural signature per DID, hex-keyed
    dids: BTreeMap<String, Vec<(String, u16)>>,
}

/// Reconcile the published state with the shipped catalog.
pub fn sync_catalog(sink: &DecodeSink) {
    let path = format!("{}.info.catalog", sink.prefix());
    let shipped = sink.catalog();

    let stored: Option<StoredCatalog> = sink
        .store()
        .get(&path)
        .and_then(|value| serde_json::from_value(value).ok());

    let Some(stored) = stored else {
        debug!(path, "no stored catalog, publishing current signatures");
        write_signatures(sink, &path);
        return;
    };

    if version_cmp(&stored.version, shipped.version()) != Ordering::Less {
        return;
    }
    info!(
        from = %stored.version,
        to = %shipped.version(),
        "catalog updated, checking structural changes"
    );

    let type_fix = version_cmp(&stored.version, TYPE_FIX_VERSION) == Ordering::Less;
    if type_fix {
        // versions before the type correction published wrong leaf types
        // for the variable-length DIDs; drop those trees up front
        for &did in VARIABLE_LENGTH_DIDS {
            sink.delete_tree(&sink.symbolic_id(did));
        }
    }

    for desc in shipped.descriptors() {
        let key = format_did(desc.did);
        let new_sig = desc.signature();
        match stored.dids.get(&key) {
            Some(old_sig) if *old_sig != new_sig => {
                info!(did = %key, "descriptor structure changed, re-publishing");
                sink.delete_tree(&sink.symbolic_id(desc.did));
                sink.republish_from_stored(desc.did);
            }
            Some(_) if type_fix => {
                sink.republish_from_stored(desc.did);
            }
            _ => {}
        }
    }

    write_signatures(sink, &path);
}

fn write_signatures(sink: &DecodeSink, path: &str) {
    let shipped = sink.catalog();
    let dids: BTreeMap<String, Vec<(String, u16)>> = shipped
        .signatures()
        .into_iter()
        .map(|(did, sig)| (format_did(did), sig))
        .collect();
    let blob = StoredCatalog {
        version: shipped.version().to_string(),
        dids,
    };
    match serde_json::to_value(&blob) {
        Ok(value) => sink.store().set(path, value),
        Err(e) => warn!(error = %e, "could not serialize catalog signatures"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use e3can_conv::DidCatalog;
    use e3can_core::{MemoryStore, StateStore};

    use super::*;

    const SHIPPED: &str = r#"
meta: { version: "0.6.2" }
dids:
  "0x018C":
    id: FlowTempSensor
    codec: int
    len: 2
    args: { signed: true, scale: 0.1 }
"#;

    fn sink_on(store: Arc<MemoryStore>) -> DecodeSink {
        let catalog = Arc::new(DidCatalog::from_yaml(SHIPPED).unwrap());
        DecodeSink::new(catalog, store, "e3can.dev")
    }

    #[test]
    fn test_first_run_writes_signatures() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink_on(store.clone());

        sync_catalog(&sink);

        let blob = store.get("e3can.dev.info.catalog").unwrap();
        assert_eq!(blob["version"], json!("0.6.2"));
        assert_eq!(blob["dids"]["018C"], json!([["int", 2]]));
    }

    #[test]
    fn test_structural_change_republishes_from_raw() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink_on(store.clone());

        // state left behind by an older catalog that decoded the DID as raw
        store.set("e3can.dev.raw.FlowTempSensor", json!("01c2"));
        store.set("e3can.dev.tree.FlowTempSensor", json!("01c2"));
        store.set(
            "e3can.dev.info.catalog",
            json!({
                "version": "0.6.0",
                "dids": { "018C": [["raw", 2]] },
            }),
        );

        sync_catalog(&sink);

        // tree rebuilt with the new int codec from the stored raw bytes
        assert_eq!(store.get("e3can.dev.tree.FlowTempSensor"), Some(json!(45)));
        let blob = store.get("e3can.dev.info.catalog").unwrap();
        assert_eq!(blob["version"], json!("0.6.2"));
        assert_eq!(blob["dids"]["018C"], json!([["int", 2]]));
    }

    #[test]
    fn test_same_version_is_untouched() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink_on(store.clone());

        store.set("e3can.dev.tree.FlowTempSensor", json!("stale"));
        store.set(
            "e3can.dev.info.catalog",
            json!({
                "version": "0.6.2",
                "dids": { "018C": [["raw", 2]] },
            }),
        );

        sync_catalog(&sink);

        // no downgrade-driven rewrite of anything
        assert_eq!(
            store.get("e3can.dev.tree.FlowTempSensor"),
            Some(json!("stale"))
        );
    }

    #[test]
    fn test_type_fix_republishes_unchanged_dids() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink_on(store.clone());

        store.set("e3can.dev.raw.FlowTempSensor", json!("01c2"));
        store.set(
            "e3can.dev.info.catalog",
            json!({
                "version": "0.4.0",
                "dids": { "018C": [["int", 2]] },
            }),
        );

        sync_catalog(&sink);

        // signature unchanged, but the stored version predates the type
        // correction, so leaves are re-published
        assert_eq!(store.get("e3can.dev.tree.FlowTempSensor"), Some(json!(45)));
    }
}
