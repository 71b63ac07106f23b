use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::{RwLock, mpsc};

use {
    portico_config::GatewayConfig,
    portico_protocol::{
        ConnectParams, HANDSHAKE_TIMEOUT_MS, MAX_BUFFERED_BYTES, MAX_PAYLOAD_BYTES, roles,
        TICK_INTERVAL_MS,
    },
};

use crate::{
    auth::ResolvedAuth,
    health::{HealthCache, HealthSnapshot},
    nodes::NodeRegistry,
    pairing::PairingState,
    presence::PresenceTracker,
};

// ── Outbound channel ─────────────────────────────────────────────────────────

/// Message to a connection's write loop.
#[derive(Debug)]
pub enum Outbound {
    /// One serialized frame per physical send.
    Frame(String),
    /// Close the transport with the given code, then stop writing.
    Close { code: u16, reason: String },
}

// ── Connection policy ────────────────────────────────────────────────────────

/// Read-only per-connection limits, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    pub handshake_timeout: Duration,
    pub max_payload_bytes: usize,
    pub max_buffered_bytes: usize,
    pub tick_interval: Duration,
    pub allowed_origins: Vec<String>,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
            allowed_origins: Vec::new(),
        }
    }
}

impl From<&GatewayConfig> for ConnectionPolicy {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_millis(cfg.handshake_timeout_ms),
            max_payload_bytes: cfg.max_payload_bytes,
            max_buffered_bytes: cfg.max_buffered_bytes,
            tick_interval: Duration::from_millis(cfg.tick_interval_ms),
            allowed_origins: cfg.allowed_origins.clone(),
        }
    }
}

// ── Connected client ─────────────────────────────────────────────────────────

/// An authenticated client session currently connected to the gateway.
/// Exists only after a successful handshake.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    pub connect_params: ConnectParams,
    pub presence_key: String,
    /// Bounded channel to this client's write loop. Broadcasts use
    /// `try_send` and may drop under backpressure.
    pub sender: mpsc::Sender<Outbound>,
    pub connected_at: Instant,
}

impl ConnectedClient {
    pub fn role(&self) -> &str {
        self.connect_params.role()
    }

    pub fn is_node(&self) -> bool {
        self.role() == roles::NODE
    }

    /// Queue a serialized frame without waiting. Returns false when the
    /// client's buffer is full or its write loop is gone.
    pub fn send(&self, frame: &str) -> bool {
        self.sender
            .try_send(Outbound::Frame(frame.to_string()))
            .is_ok()
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across
/// connection tasks. All of it is process-lifetime; nothing persists.
pub struct GatewayState {
    /// All authenticated clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Monotonically increasing sequence counter for broadcast events.
    pub seq: AtomicU64,
    /// Server version string.
    pub version: String,
    /// Hostname for the handshake reply.
    pub hostname: String,
    /// Process start, for uptime in health snapshots.
    pub started_at: Instant,
    /// Auth configuration.
    pub auth: ResolvedAuth,
    /// Connection limits.
    pub policy: ConnectionPolicy,
    /// Live presence registry.
    pub presence: RwLock<PresenceTracker>,
    /// Cached health snapshot, tick-refreshed.
    pub health: RwLock<HealthCache>,
    /// Connected automation nodes.
    pub nodes: RwLock<NodeRegistry>,
    /// Device pairing state.
    pub pairing: RwLock<PairingState>,
}

impl GatewayState {
    pub fn new(auth: ResolvedAuth, policy: ConnectionPolicy) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());
        let version = env!("CARGO_PKG_VERSION").to_string();

        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            hostname,
            started_at: Instant::now(),
            auth,
            policy,
            presence: RwLock::new(PresenceTracker::new()),
            health: RwLock::new(HealthCache::new(HealthSnapshot::initial(&version))),
            nodes: RwLock::new(NodeRegistry::new()),
            pairing: RwLock::new(PairingState::new()),
            version,
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a new authenticated client.
    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
    }

    /// Remove a client by conn_id. Returns the removed client if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    /// Number of authenticated clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Build a fresh health snapshot from current counters. Called by
    /// the tick task only; everything else reads the cache.
    pub async fn build_health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok".into(),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            connections: self.client_count().await,
            nodes: self.nodes.read().await.count(),
            refreshed_at_ms: crate::now_ms(),
        }
    }
}
