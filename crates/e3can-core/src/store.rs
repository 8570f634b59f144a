//! Host state surface
//!
//! The adapter publishes decoded values, statistics and catalog bookkeeping
//! through a flat, dot-separated key space owned by the enclosing host
//! framework. `StateStore` is the only thing the engine knows about that
//! framework; `MemoryStore` backs tests and the demo daemon.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::Value;

/// Characters that may not appear in a state path segment.
const FORBIDDEN: &[char] = &[
    '[', ']', '*', ',', ';', '\'', '"', '`', '<', '>', '\\', '?', '.',
];

/// Replace characters a state path segment may not contain with `_`.
///
/// The dot is included because it is the path separator.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if FORBIDDEN.contains(&c) { '_' } else { c })
        .collect()
}

/// Key/value surface of the host framework.
///
/// Implementations must be cheap and non-blocking: the session engine calls
/// into the store while holding its own state lock, so a store must never
/// suspend or perform I/O inline.
pub trait StateStore: Send + Sync {
    /// Create or overwrite a state object.
    fn set(&self, path: &str, value: Value);

    /// Read a state object back.
    fn get(&self, path: &str) -> Option<Value>;

    /// Delete a single state object. Missing paths are a no-op.
    fn delete(&self, path: &str);

    /// Delete every state object whose path starts with `prefix`.
    fn delete_prefix(&self, prefix: &str);

    /// List the paths under `prefix`.
    fn list(&self, prefix: &str) -> Vec<String>;
}

/// In-memory `StateStore` used by tests and the demo daemon.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStore {
    fn set(&self, path: &str, value: Value) {
        self.entries.write().insert(path.to_string(), value);
    }

    fn get(&self, path: &str) -> Option<Value> {
        self.entries.read().get(path).cloned()
    }

    fn delete(&self, path: &str) {
        self.entries.write().remove(path);
    }

    fn delete_prefix(&self, prefix: &str) {
        let mut entries = self.entries.write();
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            entries.remove(&key);
        }
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}
