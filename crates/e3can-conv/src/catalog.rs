//! Versioned DID catalogs
//!
//! A device is described by two catalog files: the common catalog shared by
//! the whole device family and a device-specific one layered on top. Both
//! are merged at load; device entries win. The merged catalog also carries
//! the set of DIDs authorized for WriteDataByIdentifier.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::descriptor::{DidDescriptor, RawDescriptor};
use crate::error::{parse_did, ConvResult};

/// Catalog versions older than this published tree leaves with wrong element
/// types; migration re-publishes them once.
pub const TYPE_FIX_VERSION: &str = "0.5.0";

/// DIDs whose payload length varies between firmware generations. Any
/// structural divergence here must pre-delete the published tree to avoid
/// type conflicts in the host state.
pub const VARIABLE_LENGTH_DIDS: &[u16] = &[0x01A5, 0x0545, 0x056C, 0x0778];

/// Merged, resolved catalog for one device.
#[derive(Debug, Default)]
pub struct DidCatalog {
    version: String,
    entries: HashMap<u16, DidDescriptor>,
    writable: HashSet<u16>,
}

/// Catalog file metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub version: String,
}

/// On-disk catalog file shape
#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    meta: CatalogMeta,
    #[serde(default)]
    dids: BTreeMap<String, RawDescriptor>,
    #[serde(default)]
    writable: Vec<String>,
}

impl DidCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a single catalog file from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConvResult<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)?;

        let mut entries = HashMap::with_capacity(file.dids.len());
        for (did_str, raw) in &file.dids {
            let did = parse_did(did_str)?;
            entries.insert(did, raw.resolve(did)?);
        }

        let mut writable = HashSet::with_capacity(file.writable.len());
        for did_str in &file.writable {
            writable.insert(parse_did(did_str)?);
        }

        Ok(Self {
            version: file.meta.version,
            entries,
            writable,
        })
    }

    /// Load a single catalog file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> ConvResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Merge the common and device-specific catalogs. Device entries win;
    /// the merged version is the device catalog's version (falling back to
    /// the common one when the device file carries none).
    pub fn merged(common: Self, device: Self) -> Self {
        let mut entries = common.entries;
        let overridden = device
            .entries
            .keys()
            .filter(|did| entries.contains_key(*did))
            .count();
        if overridden > 0 {
            debug!(overridden, "device catalog overrides common entries");
        }
        entries.extend(device.entries);

        let mut writable = common.writable;
        writable.extend(device.writable);

        let version = if device.version.is_empty() {
            common.version
        } else {
            device.version
        };

        Self {
            version,
            entries,
            writable,
        }
    }

    /// Catalog version string, compared numerically via [`version_cmp`].
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, did: u16) -> Option<&DidDescriptor> {
        self.entries.get(&did)
    }

    /// Whether the DID is authorized for WriteDataByIdentifier.
    pub fn is_writable(&self, did: u16) -> bool {
        self.writable.contains(&did)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all descriptors.
    pub fn descriptors(&self) -> impl Iterator<Item = &DidDescriptor> {
        self.entries.values()
    }

    /// Structural signatures of every DID, keyed by DID number.
    pub fn signatures(&self) -> BTreeMap<u16, Vec<(String, u16)>> {
        self.entries
            .iter()
            .map(|(&did, desc)| (did, desc.signature()))
            .collect()
    }
}

/// Compare two dotted version strings numerically, segment by segment.
///
/// Missing segments count as zero, so "0.5" == "0.5.0".
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let seg = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|p| p.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (va, vb) = (seg(a), seg(b));
    let n = va.len().max(vb.len());
    for i in 0..n {
        let (x, y) = (
            va.get(i).copied().unwrap_or(0),
            vb.get(i).copied().unwrap_or(0),
        );
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
