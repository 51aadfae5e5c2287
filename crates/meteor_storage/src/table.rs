//! Sharded in-memory versioned table.
//!
//! The table maps logical key → (GSN → value). Inserts never overwrite an
//! existing GSN; deletions insert a tombstone at a new GSN. Each shard is
//! guarded by its own reader-writer lock; cross-shard scans take shards one
//! at a time, so a scan is not a globally atomic snapshot; isolation above
//! the table is responsible for consistency.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use meteor_common::error::StorageError;
use meteor_common::types::{Gsn, Value, VersionedKey};

/// Number of shards. Compile-time constant; keys are distributed by hash.
pub const SHARD_COUNT: usize = 8;

type VersionChain = BTreeMap<Gsn, Value>;

#[derive(Default)]
struct Shard {
    entries: RwLock<HashMap<String, VersionChain>>,
}

/// The versioned store backing both the committed table and (in shape) the
/// per-transaction staging stores.
pub struct VersionedTable {
    shards: Vec<Shard>,
}

impl Default for VersionedTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Shard {
        let idx = (xxh3_64(key.as_bytes()) as usize) % SHARD_COUNT;
        &self.shards[idx]
    }

    /// Latest version of `key`, whatever its type (tombstones included).
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.shard(key).entries.read();
        entries
            .get(key)
            .and_then(|chain| chain.values().next_back().cloned())
    }

    /// Insert one version. O(1) amortized; an existing GSN is never
    /// overwritten with different content by well-behaved callers (GSNs are
    /// globally unique).
    pub fn put(&self, key: VersionedKey, value: Value) {
        let mut entries = self.shard(&key.key).entries.write();
        entries.entry(key.key).or_default().insert(key.gsn, value);
    }

    /// GSN of the latest version of `key`.
    pub fn latest_gsn(&self, key: &str) -> Result<Gsn, StorageError> {
        let entries = self.shard(key).entries.read();
        entries
            .get(key)
            .and_then(|chain| chain.keys().next_back().copied())
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
    }

    /// Latest version whose GSN is ≤ `max_gsn`. Required for snapshot
    /// isolation.
    pub fn version_at_or_before(&self, key: &str, max_gsn: Gsn) -> Option<Value> {
        let entries = self.shard(key).entries.read();
        entries
            .get(key)
            .and_then(|chain| chain.range(..=max_gsn).next_back())
            .map(|(_, v)| v.clone())
    }

    /// All logical keys. Order unspecified.
    pub fn keys(&self) -> Vec<String> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.entries.read().keys().cloned());
        }
        out
    }

    /// Latest versions of all keys starting with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> HashMap<String, Value> {
        self.scan_filtered(|key, _| key.starts_with(prefix))
    }

    /// Latest versions of all keys in the lexicographic range
    /// `[start, end]` (inclusive both ends).
    pub fn scan_range(&self, start: &str, end: &str) -> HashMap<String, Value> {
        self.scan_filtered(|key, _| key >= start && key <= end)
    }

    /// Latest versions of all keys for which `filter(key, latest)` holds.
    pub fn scan_filtered(&self, filter: impl Fn(&str, &Value) -> bool) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for shard in &self.shards {
            let entries = shard.entries.read();
            for (key, chain) in entries.iter() {
                if let Some(value) = chain.values().next_back() {
                    if filter(key, value) {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        out
    }

    /// Number of keys whose latest version passes `filter`.
    pub fn count_filtered(&self, filter: impl Fn(&str, &Value) -> bool) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            let entries = shard.entries.read();
            for (key, chain) in entries.iter() {
                if let Some(value) = chain.values().next_back() {
                    if filter(key, value) {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Number of logical keys.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.entries.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every key and version. For tests.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.entries.write().clear();
        }
    }
}
