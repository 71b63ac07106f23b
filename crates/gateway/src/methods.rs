use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use tracing::{debug, warn};

use portico_protocol::{ErrorShape, ResponseFrame, error_codes, roles};

use crate::{nodes::NodeRegistry, now_ms, state::GatewayState};

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: serde_json::Value,
    pub client_conn_id: String,
    pub client_role: String,
    pub state: Arc<GatewayState>,
}

/// The result a method handler produces.
pub type MethodResult = Result<serde_json::Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

/// Event names the gateway can push, advertised in the handshake reply.
pub const EVENT_NAMES: &[&str] = &["connect.challenge", "presence", "health"];

// ── Role authorization ───────────────────────────────────────────────────────

const NODE_METHODS: &[&str] = &["node.subscribe", "node.unsubscribe"];

const READ_METHODS: &[&str] = &[
    "ping",
    "health",
    "status",
    "system-presence",
    "node.list",
    "node.describe",
];

const ADMIN_METHODS: &[&str] = &[
    "device.pair.list",
    "device.pair.approve",
    "device.pair.reject",
    "node.rename",
];

fn is_in(method: &str, list: &[&str]) -> bool {
    list.contains(&method)
}

/// Check a role against a method. Returns None if authorized, Some(error) if not.
pub fn authorize_method(method: &str, role: &str) -> Option<ErrorShape> {
    if is_in(method, NODE_METHODS) {
        if role == roles::NODE {
            return None;
        }
        return Some(ErrorShape::new(
            error_codes::INVALID_REQUEST,
            format!("unauthorized role: {role}"),
        ));
    }

    match role {
        roles::ADMIN => None,
        roles::NODE => {
            // Nodes keep a minimal surface beyond their own methods.
            if method == "ping" {
                None
            } else {
                Some(ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    format!("unauthorized role: {role}"),
                ))
            }
        },
        roles::WEBCHAT => {
            if is_in(method, READ_METHODS) {
                return None;
            }
            let message = if is_in(method, ADMIN_METHODS) {
                format!("method requires admin role: {method}")
            } else {
                format!("method not available to webchat: {method}")
            };
            Some(ErrorShape::new(error_codes::INVALID_REQUEST, message))
        },
        other => Some(ErrorShape::new(
            error_codes::INVALID_REQUEST,
            format!("unauthorized role: {other}"),
        )),
    }
}

// ── Method registry ──────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    /// Route one authenticated request to its handler and fold the
    /// outcome into exactly one response frame.
    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.client_conn_id.clone();

        if let Some(err) = authorize_method(&method, &ctx.client_role) {
            warn!(method, conn_id = %conn_id, code = %err.code, "method auth denied");
            return ResponseFrame::err(&request_id, err);
        }

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return ResponseFrame::err(
                &request_id,
                ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    format!("unknown method: {method}"),
                ),
            );
        };

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => {
                debug!(method, request_id = %request_id, "method ok");
                ResponseFrame::ok(&request_id, payload)
            },
            Err(err) => {
                warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(&request_id, err)
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register_gateway_methods();
        self.register_node_methods();
        self.register_pairing_methods();
    }

    // ── Gateway-internal methods ─────────────────────────────────────────

    fn register_gateway_methods(&mut self) {
        // ping
        self.register(
            "ping",
            Box::new(|_ctx| {
                Box::pin(async move {
                    Ok(serde_json::json!({
                        "pong": true,
                        "ts": now_ms(),
                    }))
                })
            }),
        );

        // health: cached snapshot, never recomputed here
        self.register(
            "health",
            Box::new(|ctx| {
                Box::pin(async move {
                    let health = ctx.state.health.read().await;
                    Ok(serde_json::json!({
                        "snapshot": health.payload(),
                        "healthVersion": health.version(),
                    }))
                })
            }),
        );

        // status
        self.register(
            "status",
            Box::new(|ctx| {
                Box::pin(async move {
                    let nodes = ctx.state.nodes.read().await;
                    Ok(serde_json::json!({
                        "version": ctx.state.version,
                        "hostname": ctx.state.hostname,
                        "uptimeSecs": ctx.state.started_at.elapsed().as_secs(),
                        "connections": ctx.state.client_count().await,
                        "nodes": nodes.count(),
                        "hasMobileNode": nodes.has_mobile_node(),
                        "presenceVersion": ctx.state.presence.read().await.version(),
                        "healthVersion": ctx.state.health.read().await.version(),
                    }))
                })
            }),
        );

        // system-presence
        self.register(
            "system-presence",
            Box::new(|ctx| {
                Box::pin(async move {
                    let presence = ctx.state.presence.read().await;
                    Ok(serde_json::json!({
                        "presence": presence.list(),
                        "presenceVersion": presence.version(),
                    }))
                })
            }),
        );
    }

    // ── Node registry methods ────────────────────────────────────────────

    fn register_node_methods(&mut self) {
        self.register(
            "node.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let nodes = ctx.state.nodes.read().await;
                    let list: Vec<_> = nodes.list().iter().map(|n| node_json(n, &nodes)).collect();
                    Ok(serde_json::json!({ "nodes": list }))
                })
            }),
        );

        self.register(
            "node.describe",
            Box::new(|ctx| {
                Box::pin(async move {
                    let node_id = require_str(&ctx.params, "nodeId")?;
                    let nodes = ctx.state.nodes.read().await;
                    let node = nodes.get(node_id).ok_or_else(|| {
                        ErrorShape::new(
                            error_codes::INVALID_REQUEST,
                            format!("node not found: {node_id}"),
                        )
                    })?;
                    Ok(node_json(node, &nodes))
                })
            }),
        );

        self.register(
            "node.rename",
            Box::new(|ctx| {
                Box::pin(async move {
                    let node_id = require_str(&ctx.params, "nodeId")?;
                    let display_name = require_str(&ctx.params, "displayName")?;
                    ctx.state
                        .nodes
                        .write()
                        .await
                        .rename(node_id, display_name)
                        .map_err(|e| ErrorShape::new(error_codes::INVALID_REQUEST, e))?;
                    Ok(serde_json::json!({ "nodeId": node_id, "displayName": display_name }))
                })
            }),
        );

        // Subscriptions are owned by the calling node's own registration.
        self.register(
            "node.subscribe",
            Box::new(|ctx| {
                Box::pin(async move {
                    let event = require_str(&ctx.params, "event")?.to_string();
                    let mut nodes = ctx.state.nodes.write().await;
                    let node_id = nodes
                        .node_id_for_conn(&ctx.client_conn_id)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            ErrorShape::new(
                                error_codes::INVALID_REQUEST,
                                "connection is not a registered node",
                            )
                        })?;
                    let added = nodes
                        .subscribe(&node_id, &event)
                        .map_err(|e| ErrorShape::new(error_codes::INVALID_REQUEST, e))?;
                    Ok(serde_json::json!({ "event": event, "added": added }))
                })
            }),
        );

        self.register(
            "node.unsubscribe",
            Box::new(|ctx| {
                Box::pin(async move {
                    let event = require_str(&ctx.params, "event")?.to_string();
                    let mut nodes = ctx.state.nodes.write().await;
                    let node_id = nodes
                        .node_id_for_conn(&ctx.client_conn_id)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            ErrorShape::new(
                                error_codes::INVALID_REQUEST,
                                "connection is not a registered node",
                            )
                        })?;
                    let removed = nodes.unsubscribe(&node_id, &event);
                    Ok(serde_json::json!({ "event": event, "removed": removed }))
                })
            }),
        );
    }

    // ── Device pairing methods ───────────────────────────────────────────

    fn register_pairing_methods(&mut self) {
        self.register(
            "device.pair.list",
            Box::new(|ctx| {
                Box::pin(async move {
                    let pairing = ctx.state.pairing.read().await;
                    let pending: Vec<_> = pairing
                        .list_pending()
                        .iter()
                        .map(|p| {
                            serde_json::json!({
                                "deviceId": p.device_id,
                                "requestedAtMs": p.requested_at_ms,
                            })
                        })
                        .collect();
                    let paired: Vec<_> = pairing
                        .list_paired()
                        .iter()
                        .map(|d| {
                            serde_json::json!({
                                "deviceId": d.device_id,
                                "pairedAtMs": d.paired_at_ms,
                            })
                        })
                        .collect();
                    Ok(serde_json::json!({ "pending": pending, "paired": paired }))
                })
            }),
        );

        self.register(
            "device.pair.approve",
            Box::new(|ctx| {
                Box::pin(async move {
                    let device_id = require_str(&ctx.params, "deviceId")?;
                    let mut pairing = ctx.state.pairing.write().await;
                    let device = pairing
                        .approve(device_id)
                        .map_err(|e| ErrorShape::new(error_codes::INVALID_REQUEST, e.to_string()))?;
                    Ok(serde_json::json!({
                        "deviceId": device.device_id,
                        "pairedAtMs": device.paired_at_ms,
                    }))
                })
            }),
        );

        self.register(
            "device.pair.reject",
            Box::new(|ctx| {
                Box::pin(async move {
                    let device_id = require_str(&ctx.params, "deviceId")?;
                    let rejected = ctx.state.pairing.write().await.reject(device_id);
                    Ok(serde_json::json!({ "deviceId": device_id, "rejected": rejected }))
                })
            }),
        );
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn require_str<'a>(params: &'a serde_json::Value, field: &str) -> Result<&'a str, ErrorShape> {
    params
        .get(field)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ErrorShape::new(
                error_codes::INVALID_REQUEST,
                format!("missing param: {field}"),
            )
        })
}

fn node_json(node: &crate::nodes::NodeSession, registry: &NodeRegistry) -> serde_json::Value {
    serde_json::json!({
        "nodeId": node.node_id,
        "displayName": node.display_name,
        "platform": node.platform,
        "version": node.version,
        "capabilities": node.capabilities,
        "commands": node.commands,
        "connectedAtSecs": node.connected_at.elapsed().as_secs(),
        "subscriptions": registry.subscriptions(&node.node_id),
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::resolve_auth,
        nodes::NodeSession,
        state::ConnectionPolicy,
    };

    fn test_state() -> Arc<GatewayState> {
        GatewayState::new(
            resolve_auth(Some("t".into()), None),
            ConnectionPolicy::default(),
        )
    }

    fn ctx(state: &Arc<GatewayState>, method: &str, role: &str) -> MethodContext {
        MethodContext {
            request_id: "1".into(),
            method: method.into(),
            params: serde_json::json!({}),
            client_conn_id: "c1".into(),
            client_role: role.into(),
            state: Arc::clone(state),
        }
    }

    #[test]
    fn admin_passes_everything_registered() {
        assert!(authorize_method("ping", "admin").is_none());
        assert!(authorize_method("device.pair.approve", "admin").is_none());
        assert!(authorize_method("node.rename", "admin").is_none());
    }

    #[test]
    fn webchat_is_read_only() {
        assert!(authorize_method("ping", "webchat").is_none());
        assert!(authorize_method("system-presence", "webchat").is_none());
        assert!(authorize_method("device.pair.approve", "webchat").is_some());
        assert!(authorize_method("node.rename", "webchat").is_some());
    }

    #[test]
    fn node_methods_require_node_role() {
        assert!(authorize_method("node.subscribe", "node").is_none());
        assert!(authorize_method("node.subscribe", "admin").is_some());
        assert!(authorize_method("node.unsubscribe", "webchat").is_some());
    }

    #[test]
    fn node_role_is_otherwise_restricted() {
        assert!(authorize_method("ping", "node").is_none());
        assert!(authorize_method("status", "node").is_some());
        assert!(authorize_method("device.pair.list", "node").is_some());
    }

    #[test]
    fn unknown_roles_are_rejected() {
        assert!(authorize_method("ping", "intruder").is_some());
    }

    #[tokio::test]
    async fn dispatch_ping_replies_ok() {
        let state = test_state();
        let registry = MethodRegistry::new();
        let res = registry.dispatch(ctx(&state, "ping", "admin")).await;
        assert!(res.ok);
        assert_eq!(res.payload.unwrap()["pong"], true);
    }

    #[tokio::test]
    async fn dispatch_unknown_method_is_data_error() {
        let state = test_state();
        let registry = MethodRegistry::new();
        let res = registry.dispatch(ctx(&state, "no.such.method", "admin")).await;
        assert!(!res.ok);
        assert_eq!(res.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn node_describe_requires_known_node() {
        let state = test_state();
        let registry = MethodRegistry::new();

        let mut missing = ctx(&state, "node.describe", "admin");
        missing.params = serde_json::json!({});
        let res = registry.dispatch(missing).await;
        assert!(!res.ok);

        state.nodes.write().await.register(NodeSession {
            node_id: "n1".into(),
            conn_id: "c9".into(),
            display_name: Some("Mac".into()),
            platform: "macos".into(),
            version: "1".into(),
            capabilities: vec![],
            commands: vec![],
            connected_at: std::time::Instant::now(),
        });
        let mut found = ctx(&state, "node.describe", "admin");
        found.params = serde_json::json!({"nodeId": "n1"});
        let res = registry.dispatch(found).await;
        assert!(res.ok);
        assert_eq!(res.payload.unwrap()["nodeId"], "n1");
    }

    #[tokio::test]
    async fn subscribe_requires_own_registration() {
        let state = test_state();
        let registry = MethodRegistry::new();

        let mut unregistered = ctx(&state, "node.subscribe", "node");
        unregistered.params = serde_json::json!({"event": "jobs.done"});
        assert!(!registry.dispatch(unregistered).await.ok);

        state.nodes.write().await.register(NodeSession {
            node_id: "n1".into(),
            conn_id: "c1".into(),
            display_name: None,
            platform: "linux".into(),
            version: "1".into(),
            capabilities: vec![],
            commands: vec![],
            connected_at: std::time::Instant::now(),
        });
        let mut subscribe = ctx(&state, "node.subscribe", "node");
        subscribe.params = serde_json::json!({"event": "jobs.done"});
        let res = registry.dispatch(subscribe).await;
        assert!(res.ok);
        assert_eq!(res.payload.unwrap()["added"], true);
        assert!(state.nodes.read().await.is_subscribed("n1", "jobs.done"));
    }

    #[tokio::test]
    async fn pairing_approve_flow_over_methods() {
        let state = test_state();
        let registry = MethodRegistry::new();

        // Seed a pending request the way the handshake path would.
        let key = {
            use p256::ecdsa::SigningKey;
            use base64::{Engine as _, engine::general_purpose::STANDARD};
            let sk = SigningKey::from_slice(&[3u8; 32]).unwrap();
            STANDARD.encode(sk.verifying_key().to_encoded_point(true).as_bytes())
        };
        state.pairing.write().await.request("dev-1", &key).unwrap();

        let mut list = ctx(&state, "device.pair.list", "admin");
        list.params = serde_json::json!({});
        let res = registry.dispatch(list).await;
        assert_eq!(res.payload.unwrap()["pending"][0]["deviceId"], "dev-1");

        let mut approve = ctx(&state, "device.pair.approve", "admin");
        approve.params = serde_json::json!({"deviceId": "dev-1"});
        assert!(registry.dispatch(approve).await.ok);
        assert!(state.pairing.read().await.is_paired("dev-1"));
    }
}
