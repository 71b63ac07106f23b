//! Gateway control plane: WebSocket session layer, handshake auth,
//! request dispatch, presence/health broadcasting, node registry.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Resolve auth, bind address
//! 3. Start HTTP server (health, WebSocket upgrade)
//! 4. Drive one session task per connection
//! 5. Refresh + broadcast the health snapshot on a fixed tick
//!
//! Method business logic (pairing math aside) is intentionally thin;
//! handlers are registered in `methods.rs` and everything else in this
//! crate is connection lifecycle, authentication, and shared state.

pub mod auth;
pub mod broadcast;
pub mod health;
pub mod methods;
pub mod nodes;
pub mod pairing;
pub mod presence;
pub mod server;
pub mod state;
pub mod ws;

/// Milliseconds since the Unix epoch, for wire timestamps.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
