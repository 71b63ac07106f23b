use {serde_json::Value, tracing::debug};

use portico_protocol::{EventFrame, Frame, StateVersion};

use crate::state::GatewayState;

/// Options for one broadcast fan-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOpts {
    /// Drop the frame for clients whose outbound buffer is full instead
    /// of failing the broadcast. All fan-out is non-blocking either way;
    /// this only controls how the drop is reported.
    pub drop_if_slow: bool,
    pub state_version: Option<StateVersion>,
}

/// Push an event frame to every connected session.
///
/// Delivery is best-effort: a backpressured client misses the frame
/// without delaying anyone else. Node sessions only receive events they
/// subscribed to, so dispatch never targets a dead or uninterested node.
/// Returns the number of clients the frame was queued for.
pub async fn broadcast(
    state: &GatewayState,
    event: &str,
    payload: Value,
    opts: BroadcastOpts,
) -> usize {
    let mut frame = EventFrame::new(event, payload).with_seq(state.next_seq());
    if let Some(version) = opts.state_version {
        frame = frame.with_state_version(version);
    }
    let text = Frame::from(frame).to_text();

    let clients = state.clients.read().await;
    let nodes = state.nodes.read().await;

    let mut delivered = 0;
    for client in clients.values() {
        if client.is_node() {
            let subscribed = nodes
                .node_id_for_conn(&client.conn_id)
                .is_some_and(|node_id| nodes.is_subscribed(node_id, event));
            if !subscribed {
                continue;
            }
        }
        if client.send(&text) {
            delivered += 1;
        } else if opts.drop_if_slow {
            debug!(event, conn_id = %client.conn_id, "broadcast dropped for slow client");
        } else {
            tracing::warn!(event, conn_id = %client.conn_id, "broadcast dropped, client buffer full");
        }
    }
    delivered
}

/// Broadcast the full presence list with current version stamps.
pub async fn broadcast_presence(state: &GatewayState) {
    let (payload, presence_version) = {
        let presence = state.presence.read().await;
        (presence.payload(), presence.version())
    };
    let health_version = state.health.read().await.version();
    broadcast(state, "presence", payload, BroadcastOpts {
        drop_if_slow: true,
        state_version: Some(StateVersion {
            presence: Some(presence_version),
            health: Some(health_version),
        }),
    })
    .await;
}

/// One health tick: rebuild the snapshot, replace the cache, broadcast
/// the new value. This is the only place the snapshot is recomputed.
pub async fn broadcast_tick(state: &GatewayState) {
    let snapshot = state.build_health_snapshot().await;
    let (payload, health_version) = {
        let mut health = state.health.write().await;
        let version = health.replace(snapshot);
        (health.payload(), version)
    };
    let presence_version = state.presence.read().await.version();
    broadcast(state, "health", payload, BroadcastOpts {
        drop_if_slow: true,
        state_version: Some(StateVersion {
            presence: Some(presence_version),
            health: Some(health_version),
        }),
    })
    .await;
}
