use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        http::{HeaderMap, header::ORIGIN},
        response::{IntoResponse, Json},
        routing::get,
    },
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use {
    portico_config::{AuthModeConfig, GatewayConfig},
    portico_protocol::PROTOCOL_VERSION,
};

use crate::{
    auth::{self, ResolvedAuth},
    broadcast::broadcast_tick,
    methods::MethodRegistry,
    state::{ConnectionPolicy, GatewayState},
    ws::{ConnectionInfo, handle_connection},
};

type SharedState = (Arc<GatewayState>, Arc<MethodRegistry>);

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(cors)
        .with_state((state, methods))
}

/// Credentials come from the environment when present, from the config
/// file otherwise; the configured mode picks which kind is honored.
fn resolve_runtime_auth(cfg: &GatewayConfig) -> ResolvedAuth {
    let token = std::env::var("PORTICO_TOKEN")
        .ok()
        .or_else(|| cfg.auth.token.clone());
    let password = std::env::var("PORTICO_PASSWORD")
        .ok()
        .or_else(|| cfg.auth.password.clone());
    match cfg.auth.mode {
        AuthModeConfig::Token => auth::resolve_auth(token, None),
        AuthModeConfig::Password => auth::resolve_auth(None, password),
    }
}

/// Start the gateway HTTP + WebSocket server and run until shutdown.
pub async fn start_gateway(bind: &str, port: u16) -> anyhow::Result<()> {
    let config = portico_config::discover_and_load();
    let resolved_auth = resolve_runtime_auth(&config.gateway);
    let policy = ConnectionPolicy::from(&config.gateway);
    let tick_interval = policy.tick_interval;

    let state = GatewayState::new(resolved_auth, policy);
    let methods = Arc::new(MethodRegistry::new());
    let app = build_gateway_app(Arc::clone(&state), Arc::clone(&methods));

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        version = %state.version,
        protocol = PROTOCOL_VERSION,
        %addr,
        methods = methods.method_names().len(),
        "gateway listening"
    );

    // Health refresh runs on its own task for the life of the process.
    let tick_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        // The first tick fires immediately; skip it so the initial
        // snapshot keeps version 1 until a full interval has passed.
        interval.tick().await;
        loop {
            interval.tick().await;
            broadcast_tick(&tick_state).await;
        }
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn health_handler(State((gateway, _)): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": gateway.version,
        "protocol": PROTOCOL_VERSION,
        "uptimeSecs": gateway.started_at.elapsed().as_secs(),
        "connections": gateway.client_count().await,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State((gateway, methods)): State<SharedState>,
) -> impl IntoResponse {
    // The Origin header is captured at upgrade time; the handshake
    // validates it for browser-declared clients.
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| {
        handle_connection(socket, gateway, methods, ConnectionInfo {
            remote_addr: addr,
            origin,
        })
    })
}
