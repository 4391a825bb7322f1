use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

/// Immutable point-in-time view of shared memory.
pub type MemorySnapshot = BTreeMap<String, Value>;

/// Run-scoped shared memory: single writer per key, many readers.
///
/// A node's outputs commit through [`SharedMemory::commit`], which takes
/// the write lock once for the whole batch so concurrently scheduled
/// siblings never observe a partially written output set.
#[derive(Debug, Clone, Default)]
pub struct SharedMemory {
    data: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds memory from initial run input.
    pub async fn seed(&self, input: &serde_json::Map<String, Value>) {
        let mut data = self.data.write().await;
        for (k, v) in input {
            data.insert(k.clone(), v.clone());
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.data.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.data.read().await.contains_key(key)
    }

    /// Returns the keys from `keys` that are absent.
    pub async fn missing_keys(&self, keys: &[String]) -> Vec<String> {
        let data = self.data.read().await;
        keys.iter()
            .filter(|k| !data.contains_key(k.as_str()))
            .cloned()
            .collect()
    }

    /// Atomically writes a full output set. All keys become visible
    /// together or not at all.
    pub async fn commit(&self, outputs: serde_json::Map<String, Value>) {
        let mut data = self.data.write().await;
        for (k, v) in outputs {
            data.insert(k, v);
        }
    }

    pub async fn snapshot(&self) -> MemorySnapshot {
        self.data.read().await.clone()
    }

    /// Rebuilds memory from a persisted snapshot (resume path).
    pub fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        Self {
            data: Arc::new(RwLock::new(snapshot)),
        }
    }
}

/// Dotted-path lookup into a snapshot: `user.profile.name` descends
/// through nested objects.
pub fn lookup_path<'a>(snapshot: &'a MemorySnapshot, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let root = parts.next()?;
    let mut current = snapshot.get(root)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}
