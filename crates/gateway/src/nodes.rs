use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

/// A connected automation-agent node.
#[derive(Debug, Clone)]
pub struct NodeSession {
    pub node_id: String,
    pub conn_id: String,
    pub display_name: Option<String>,
    pub platform: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub commands: Vec<String>,
    pub connected_at: Instant,
}

/// Registry of connected nodes, their connections, and their event
/// subscriptions. A node id maps to at most one live connection.
pub struct NodeRegistry {
    /// node_id → NodeSession
    nodes: HashMap<String, NodeSession>,
    /// conn_id → node_id (reverse lookup for cleanup on disconnect)
    by_conn: HashMap<String, String>,
    /// node_id → subscribed event names
    subscriptions: HashMap<String, HashSet<String>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            by_conn: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Register a node session. If the node id already has a live
    /// registration it is torn down first (subscriptions included) and
    /// returned, so the caller can log the supersession.
    pub fn register(&mut self, session: NodeSession) -> Option<NodeSession> {
        let superseded = self.nodes.remove(&session.node_id).inspect(|old| {
            self.by_conn.remove(&old.conn_id);
            self.subscriptions.remove(&old.node_id);
        });
        self.by_conn
            .insert(session.conn_id.clone(), session.node_id.clone());
        self.nodes.insert(session.node_id.clone(), session);
        superseded
    }

    /// Remove the registration owned by `conn_id`, cascading removal of
    /// every subscription owned by that node.
    pub fn unregister_by_conn(&mut self, conn_id: &str) -> Option<NodeSession> {
        let node_id = self.by_conn.remove(conn_id)?;
        self.subscriptions.remove(&node_id);
        self.nodes.remove(&node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeSession> {
        self.nodes.get(node_id)
    }

    pub fn node_id_for_conn(&self, conn_id: &str) -> Option<&str> {
        self.by_conn.get(conn_id).map(String::as_str)
    }

    pub fn list(&self) -> Vec<&NodeSession> {
        self.nodes.values().collect()
    }

    pub fn has_mobile_node(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.platform == "ios" || n.platform == "android")
    }

    pub fn rename(&mut self, node_id: &str, display_name: &str) -> Result<(), String> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| "node not found".to_string())?;
        node.display_name = Some(display_name.to_string());
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    /// Subscribe a registered node to an event. Returns whether the
    /// subscription is new.
    pub fn subscribe(&mut self, node_id: &str, event: &str) -> Result<bool, String> {
        if !self.nodes.contains_key(node_id) {
            return Err("node not found".to_string());
        }
        Ok(self
            .subscriptions
            .entry(node_id.to_string())
            .or_default()
            .insert(event.to_string()))
    }

    /// Returns whether a subscription existed.
    pub fn unsubscribe(&mut self, node_id: &str, event: &str) -> bool {
        let Some(events) = self.subscriptions.get_mut(node_id) else {
            return false;
        };
        let removed = events.remove(event);
        if events.is_empty() {
            self.subscriptions.remove(node_id);
        }
        removed
    }

    pub fn is_subscribed(&self, node_id: &str, event: &str) -> bool {
        self.subscriptions
            .get(node_id)
            .is_some_and(|events| events.contains(event))
    }

    /// Sorted subscription list for one node.
    pub fn subscriptions(&self, node_id: &str) -> Vec<String> {
        let mut events: Vec<_> = self
            .subscriptions
            .get(node_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        events.sort();
        events
    }

    pub fn subscription_count(&self, node_id: &str) -> usize {
        self.subscriptions.get(node_id).map_or(0, HashSet::len)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn session(node_id: &str, conn_id: &str) -> NodeSession {
        NodeSession {
            node_id: node_id.into(),
            conn_id: conn_id.into(),
            display_name: None,
            platform: "macos".into(),
            version: "1.0".into(),
            capabilities: vec!["exec".into()],
            commands: vec![],
            connected_at: Instant::now(),
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = NodeRegistry::new();
        assert!(reg.register(session("n1", "c1")).is_none());
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.node_id_for_conn("c1"), Some("n1"));
        assert!(reg.get("n1").is_some());
    }

    #[test]
    fn unregister_cascades_subscriptions() {
        let mut reg = NodeRegistry::new();
        reg.register(session("n1", "c1"));
        reg.subscribe("n1", "jobs.done").unwrap();
        reg.subscribe("n1", "jobs.failed").unwrap();
        assert_eq!(reg.subscription_count("n1"), 2);

        let removed = reg.unregister_by_conn("c1").unwrap();
        assert_eq!(removed.node_id, "n1");
        assert_eq!(reg.count(), 0);
        assert_eq!(reg.subscription_count("n1"), 0);
        assert!(!reg.is_subscribed("n1", "jobs.done"));
    }

    #[test]
    fn unregister_unknown_conn_is_none() {
        let mut reg = NodeRegistry::new();
        assert!(reg.unregister_by_conn("ghost").is_none());
    }

    #[test]
    fn reregister_supersedes_and_tears_down_old() {
        let mut reg = NodeRegistry::new();
        reg.register(session("n1", "c1"));
        reg.subscribe("n1", "jobs.done").unwrap();

        let superseded = reg.register(session("n1", "c2")).unwrap();
        assert_eq!(superseded.conn_id, "c1");

        // Old connection mapping and subscriptions are gone.
        assert_eq!(reg.node_id_for_conn("c1"), None);
        assert_eq!(reg.node_id_for_conn("c2"), Some("n1"));
        assert_eq!(reg.subscription_count("n1"), 0);
        assert_eq!(reg.count(), 1);

        // Old connection closing later must not disturb the new registration.
        assert!(reg.unregister_by_conn("c1").is_none());
        assert!(reg.get("n1").is_some());
    }

    #[test]
    fn subscribe_requires_registration() {
        let mut reg = NodeRegistry::new();
        assert!(reg.subscribe("n1", "jobs.done").is_err());

        reg.register(session("n1", "c1"));
        assert!(reg.subscribe("n1", "jobs.done").unwrap());
        // Duplicate subscribe is not new.
        assert!(!reg.subscribe("n1", "jobs.done").unwrap());
    }

    #[test]
    fn unsubscribe_clears_empty_sets() {
        let mut reg = NodeRegistry::new();
        reg.register(session("n1", "c1"));
        reg.subscribe("n1", "jobs.done").unwrap();
        assert!(reg.unsubscribe("n1", "jobs.done"));
        assert!(!reg.unsubscribe("n1", "jobs.done"));
        assert_eq!(reg.subscriptions("n1").len(), 0);
    }

    #[test]
    fn rename_updates_display_name() {
        let mut reg = NodeRegistry::new();
        reg.register(session("n1", "c1"));
        reg.rename("n1", "Office Mac").unwrap();
        assert_eq!(reg.get("n1").unwrap().display_name.as_deref(), Some("Office Mac"));
        assert!(reg.rename("ghost", "x").is_err());
    }

    #[test]
    fn mobile_platform_detection() {
        let mut reg = NodeRegistry::new();
        reg.register(session("n1", "c1"));
        assert!(!reg.has_mobile_node());

        let mut ios = session("n2", "c2");
        ios.platform = "ios".into();
        reg.register(ios);
        assert!(reg.has_mobile_node());
    }
}
