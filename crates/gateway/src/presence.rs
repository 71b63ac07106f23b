use std::collections::HashMap;

use {
    serde::Serialize,
    serde_json::{Value, json},
};

use crate::now_ms;

/// One presence record. Mutated only by whole-entry replacement through
/// [`PresenceTracker::upsert`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub key: String,
    pub status: String,
    pub reason: String,
    pub last_seen_ms: u64,
}

/// Versioned registry of who is currently connected.
///
/// Every upsert replaces the entry wholesale and bumps the single global
/// presence version by exactly one, whether or not the key existed.
pub struct PresenceTracker {
    entries: HashMap<String, PresenceEntry>,
    version: u64,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            version: 0,
        }
    }

    /// Replace the entry for `key` and bump the global version.
    /// Returns the new version.
    pub fn upsert(&mut self, key: &str, status: &str, reason: &str) -> u64 {
        self.entries.insert(key.to_string(), PresenceEntry {
            key: key.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            last_seen_ms: now_ms(),
        });
        self.version += 1;
        self.version
    }

    /// Immutable snapshot of all entries, ordered by key for stable output.
    pub fn list(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn get(&self, key: &str) -> Option<&PresenceEntry> {
        self.entries.get(key)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Snapshot as a wire payload.
    pub fn payload(&self) -> Value {
        json!({ "presence": self.list() })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_bumps_version_by_exactly_one() {
        let mut tracker = PresenceTracker::new();
        assert_eq!(tracker.version(), 0);

        assert_eq!(tracker.upsert("a", "online", "connect"), 1);
        // Same key again still bumps.
        assert_eq!(tracker.upsert("a", "online", "connect"), 2);
        assert_eq!(tracker.upsert("b", "online", "connect"), 3);
        assert_eq!(tracker.upsert("a", "offline", "disconnect"), 4);
        assert_eq!(tracker.version(), 4);
    }

    #[test]
    fn upsert_replaces_whole_entry() {
        let mut tracker = PresenceTracker::new();
        tracker.upsert("a", "online", "connect");
        tracker.upsert("a", "offline", "disconnect");

        let entry = tracker.get("a").unwrap();
        assert_eq!(entry.status, "offline");
        assert_eq!(entry.reason, "disconnect");
        assert_eq!(tracker.list().len(), 1);
    }

    #[test]
    fn list_is_a_detached_snapshot() {
        let mut tracker = PresenceTracker::new();
        tracker.upsert("b", "online", "connect");
        tracker.upsert("a", "online", "connect");

        let snapshot = tracker.list();
        assert_eq!(snapshot[0].key, "a");
        assert_eq!(snapshot[1].key, "b");

        tracker.upsert("c", "online", "connect");
        // Earlier snapshot unaffected.
        assert_eq!(snapshot.len(), 2);
    }
}
