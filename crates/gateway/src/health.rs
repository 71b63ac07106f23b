use {serde::Serialize, serde_json::Value};

use crate::now_ms;

/// Point-in-time summary of gateway health. Replaced wholesale on every
/// tick; readers never observe a partially updated snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub connections: usize,
    pub nodes: usize,
    pub refreshed_at_ms: u64,
}

impl HealthSnapshot {
    pub fn initial(version: &str) -> Self {
        Self {
            status: "ok".into(),
            version: version.to_string(),
            uptime_secs: 0,
            connections: 0,
            nodes: 0,
            refreshed_at_ms: now_ms(),
        }
    }
}

/// Versioned cache of the latest health snapshot.
///
/// Refreshed only by the tick task; the handshake and the `health`
/// method serve the cached value and never recompute it inline.
pub struct HealthCache {
    snapshot: HealthSnapshot,
    version: u64,
}

impl HealthCache {
    pub fn new(initial: HealthSnapshot) -> Self {
        Self {
            snapshot: initial,
            version: 1,
        }
    }

    /// Replace the snapshot and bump the global health version.
    /// Returns the new version.
    pub fn replace(&mut self, snapshot: HealthSnapshot) -> u64 {
        self.snapshot = snapshot;
        self.version += 1;
        self.version
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.clone()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn payload(&self) -> Value {
        serde_json::to_value(&self.snapshot).unwrap_or(Value::Null)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_bumps_version() {
        let mut cache = HealthCache::new(HealthSnapshot::initial("0.0.1"));
        assert_eq!(cache.version(), 1);

        let mut next = cache.snapshot();
        next.connections = 3;
        assert_eq!(cache.replace(next), 2);
        assert_eq!(cache.snapshot().connections, 3);
        assert_eq!(cache.version(), 2);
    }

    #[test]
    fn payload_is_complete() {
        let cache = HealthCache::new(HealthSnapshot::initial("1.2.3"));
        let payload = cache.payload();
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["version"], "1.2.3");
        assert!(payload["refreshedAtMs"].as_u64().is_some());
    }
}
