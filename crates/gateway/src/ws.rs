use std::{
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{Arc, OnceLock},
    time::Instant,
};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    futures::{FutureExt, SinkExt, StreamExt, stream::SplitSink},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use portico_protocol::{
    CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, ConnectParams, ErrorShape, EventFrame, Frame,
    OUTBOUND_QUEUE_FRAMES, PROTOCOL_VERSION, RequestFrame, ResponseFrame, error_codes,
    recover_request_id, roles,
};

use crate::{
    auth::{ConnectDecision, evaluate_connect},
    broadcast::broadcast_presence,
    methods::{EVENT_NAMES, MethodContext, MethodRegistry},
    nodes::NodeSession,
    now_ms,
    state::{ConnectedClient, GatewayState, Outbound},
};

// ── Types ────────────────────────────────────────────────────────────────────

/// Transport-level facts captured at upgrade time.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Connected,
    Closed,
}

/// What the reader loop should do after folding in one input.
enum Flow {
    Continue,
    Close,
}

/// Facts about the authenticated session, present only after a
/// successful handshake.
struct Established {
    presence_key: String,
    role: String,
    is_node: bool,
}

#[derive(Default)]
struct LastFrame {
    ty: Option<&'static str>,
    method: Option<String>,
    id: Option<String>,
}

/// One connection's session: owns the lifecycle state machine and folds
/// open/message/close/error/timer inputs in sequentially.
struct Session {
    conn_id: String,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    info: ConnectionInfo,
    out_tx: mpsc::Sender<Outbound>,
    phase: Phase,
    /// Challenge nonce; consumed by the first `connect` decision.
    nonce: Option<String>,
    established: Option<Established>,
    opened_at: Instant,
    /// First-recorded close cause; later writes lose.
    close_cause: OnceLock<&'static str>,
    close_code: u16,
    last_frame: LastFrame,
}

// ── Connection entry point ───────────────────────────────────────────────────

/// Drive one WebSocket connection from open to teardown.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    info: ConnectionInfo,
) {
    let conn_id = Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_FRAMES);
    let writer = tokio::spawn(write_loop(sink, out_rx));

    debug!(
        conn_id = %conn_id,
        remote = %info.remote_addr,
        origin = info.origin.as_deref().unwrap_or("-"),
        "connection open"
    );

    let handshake_timeout = state.policy.handshake_timeout;
    let mut session = Session {
        conn_id,
        state,
        methods,
        info,
        out_tx,
        phase: Phase::Pending,
        nonce: Some(Uuid::new_v4().to_string()),
        established: None,
        opened_at: Instant::now(),
        close_cause: OnceLock::new(),
        close_code: CLOSE_NORMAL,
        last_frame: LastFrame::default(),
    };

    session.send_challenge().await;

    let handshake_deadline = tokio::time::sleep(handshake_timeout);
    tokio::pin!(handshake_deadline);

    loop {
        tokio::select! {
            // Armed only while the handshake is pending; transitioning to
            // Connected disarms it for good.
            _ = &mut handshake_deadline, if session.phase == Phase::Pending => {
                session.fail_handshake_timeout();
                break;
            }
            inbound = stream.next() => match inbound {
                None => {
                    session.set_close_cause("transport-closed", CLOSE_NORMAL);
                    break;
                },
                Some(Err(err)) => {
                    warn!(conn_id = %session.conn_id, error = %err, "transport error");
                    session.set_close_cause("transport-error", CLOSE_NORMAL);
                    break;
                },
                Some(Ok(Message::Text(text))) => {
                    if matches!(session.on_text(text.as_str()).await, Flow::Close) {
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) => {
                    session.set_close_cause("client-close", CLOSE_NORMAL);
                    break;
                },
                // Pings are answered by the transport layer; binary is not
                // part of the protocol.
                Some(Ok(_)) => {},
            },
        }
    }

    session.teardown().await;
    drop(session); // releases out_tx so the write loop drains and exits
    let _ = writer.await;
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            },
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            },
        }
    }
}

// ── Session state machine ────────────────────────────────────────────────────

impl Session {
    async fn send_frame(&self, frame: Frame) {
        let _ = self.out_tx.send(Outbound::Frame(frame.to_text())).await;
    }

    async fn send_challenge(&self) {
        let Some(nonce) = self.nonce.as_deref() else {
            return;
        };
        self.send_frame(
            EventFrame::new(
                "connect.challenge",
                serde_json::json!({ "nonce": nonce, "ts": now_ms() }),
            )
            .into(),
        )
        .await;
    }

    /// Record the close cause; the first recorded cause wins.
    fn set_close_cause(&mut self, cause: &'static str, code: u16) {
        if self.close_cause.set(cause).is_ok() {
            self.close_code = code;
        }
    }

    fn fail_handshake_timeout(&mut self) {
        self.set_close_cause("handshake-timeout", CLOSE_POLICY_VIOLATION);
        warn!(
            conn_id = %self.conn_id,
            remote = %self.info.remote_addr,
            "handshake timeout"
        );
    }

    fn record_last_frame(&mut self, frame: &Frame) {
        self.last_frame = match frame {
            Frame::Request(req) => LastFrame {
                ty: Some("request"),
                method: Some(req.method.clone()),
                id: Some(req.id.clone()),
            },
            Frame::Response(res) => LastFrame {
                ty: Some("res"),
                method: None,
                id: Some(res.id.clone()),
            },
            Frame::Event(event) => LastFrame {
                ty: Some("event"),
                method: Some(event.event.clone()),
                id: None,
            },
        };
    }

    /// Fold one inbound text message into the state machine.
    async fn on_text(&mut self, text: &str) -> Flow {
        if text.len() > self.state.policy.max_payload_bytes {
            warn!(
                conn_id = %self.conn_id,
                size = text.len(),
                limit = self.state.policy.max_payload_bytes,
                "oversize frame rejected"
            );
            if let Some(id) = recover_request_id(text) {
                self.send_frame(
                    ResponseFrame::err(
                        &id,
                        ErrorShape::new(error_codes::PAYLOAD_TOO_LARGE, "payload exceeds limit"),
                    )
                    .into(),
                )
                .await;
            }
            return Flow::Continue;
        }

        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                // Malformed input never tears the connection down. Prefer
                // an error reply when a request id is recoverable.
                if let Some(id) = recover_request_id(text) {
                    debug!(conn_id = %self.conn_id, error = %err, id, "malformed frame, replying");
                    self.send_frame(
                        ResponseFrame::err(
                            &id,
                            ErrorShape::new(error_codes::INVALID_REQUEST, "malformed frame"),
                        )
                        .into(),
                    )
                    .await;
                } else {
                    debug!(conn_id = %self.conn_id, error = %err, "dropping malformed frame");
                }
                return Flow::Continue;
            },
        };

        self.record_last_frame(&frame);
        match frame {
            Frame::Request(req) => self.on_request(req).await,
            Frame::Response(res) => {
                debug!(conn_id = %self.conn_id, id = %res.id, "ignoring unsolicited response frame");
                Flow::Continue
            },
            Frame::Event(event) => {
                debug!(conn_id = %self.conn_id, event = %event.event, "ignoring inbound event frame");
                Flow::Continue
            },
        }
    }

    async fn on_request(&mut self, req: RequestFrame) -> Flow {
        match self.phase {
            Phase::Pending => {
                if req.method == "connect" {
                    self.on_connect(req).await
                } else {
                    // No state change, timer stays armed.
                    self.send_frame(
                        ResponseFrame::err(
                            &req.id,
                            ErrorShape::new(
                                error_codes::AUTH_REQUIRED,
                                "authenticate with connect first",
                            ),
                        )
                        .into(),
                    )
                    .await;
                    Flow::Continue
                }
            },
            Phase::Connected => {
                if req.method == "connect" {
                    // The challenge nonce was consumed by the first
                    // decision; no second connect is honored.
                    self.send_frame(
                        ResponseFrame::err(
                            &req.id,
                            ErrorShape::new(error_codes::INVALID_REQUEST, "already connected"),
                        )
                        .into(),
                    )
                    .await;
                    return Flow::Continue;
                }
                self.dispatch(req);
                Flow::Continue
            },
            Phase::Closed => Flow::Close,
        }
    }

    /// Run one authenticated request on its own task. In-flight requests
    /// on the same connection execute concurrently; each produces exactly
    /// one reply, and a panicking handler becomes a structured error.
    fn dispatch(&self, req: RequestFrame) {
        let role = self
            .established
            .as_ref()
            .map(|e| e.role.clone())
            .unwrap_or_else(|| roles::ADMIN.to_string());
        let ctx = MethodContext {
            request_id: req.id.clone(),
            method: req.method,
            params: req.params,
            client_conn_id: self.conn_id.clone(),
            client_role: role,
            state: Arc::clone(&self.state),
        };
        let methods = Arc::clone(&self.methods);
        let out_tx = self.out_tx.clone();
        let request_id = req.id;
        tokio::spawn(async move {
            let response = match AssertUnwindSafe(methods.dispatch(ctx)).catch_unwind().await {
                Ok(response) => response,
                Err(_) => {
                    warn!(request_id = %request_id, "method handler panicked");
                    ResponseFrame::err(
                        &request_id,
                        ErrorShape::new(error_codes::INTERNAL_ERROR, "internal error"),
                    )
                },
            };
            let _ = out_tx
                .send(Outbound::Frame(Frame::from(response).to_text()))
                .await;
        });
    }

    async fn on_connect(&mut self, req: RequestFrame) -> Flow {
        let Some(nonce) = self.nonce.take() else {
            self.send_frame(
                ResponseFrame::err(
                    &req.id,
                    ErrorShape::new(error_codes::AUTH_FAILED, "authentication failed"),
                )
                .into(),
            )
            .await;
            self.set_close_cause("auth-failed", CLOSE_POLICY_VIOLATION);
            return Flow::Close;
        };

        let params: ConnectParams = match serde_json::from_value(req.params.clone()) {
            Ok(params) => params,
            Err(err) => {
                debug!(conn_id = %self.conn_id, error = %err, "invalid connect params");
                self.send_frame(
                    ResponseFrame::err(
                        &req.id,
                        ErrorShape::new(error_codes::INVALID_REQUEST, "invalid connect params"),
                    )
                    .into(),
                )
                .await;
                self.set_close_cause("connect-invalid", CLOSE_POLICY_VIOLATION);
                return Flow::Close;
            },
        };

        let decision = {
            let pairing = self.state.pairing.read().await;
            evaluate_connect(
                &self.state.auth,
                &self.state.policy.allowed_origins,
                &params,
                self.info.origin.as_deref(),
                &self.info.remote_addr.ip().to_string(),
                &nonce,
                &pairing,
            )
        };

        match decision {
            ConnectDecision::Accept { method } => {
                info!(
                    conn_id = %self.conn_id,
                    role = params.role(),
                    auth = ?method,
                    client = params.client.name.as_deref().unwrap_or("-"),
                    "handshake ok"
                );
                self.establish(&req.id, params).await;
                Flow::Continue
            },
            ConnectDecision::VersionMismatch => {
                self.send_frame(
                    ResponseFrame::err(
                        &req.id,
                        ErrorShape::new(
                            error_codes::VERSION_MISMATCH,
                            format!("unsupported protocol version; server speaks v{PROTOCOL_VERSION}"),
                        ),
                    )
                    .into(),
                )
                .await;
                self.set_close_cause("version-mismatch", CLOSE_POLICY_VIOLATION);
                Flow::Close
            },
            ConnectDecision::Denied { reason } => {
                // Which check failed stays server-side; the client only
                // sees a generic failure.
                warn!(
                    conn_id = %self.conn_id,
                    remote = %self.info.remote_addr,
                    reason,
                    "handshake denied"
                );
                self.send_frame(
                    ResponseFrame::err(
                        &req.id,
                        ErrorShape::new(error_codes::AUTH_FAILED, "authentication failed"),
                    )
                    .into(),
                )
                .await;
                self.set_close_cause("auth-failed", CLOSE_POLICY_VIOLATION);
                Flow::Close
            },
            ConnectDecision::PairingPending {
                device_id,
                public_key,
            } => {
                let recorded = self
                    .state
                    .pairing
                    .write()
                    .await
                    .request(&device_id, &public_key);
                match recorded {
                    Ok(()) => {
                        info!(conn_id = %self.conn_id, device_id, "pairing request recorded");
                        self.send_frame(
                            ResponseFrame::err(
                                &req.id,
                                ErrorShape::new(
                                    error_codes::PAIRING_PENDING,
                                    "pairing approval pending",
                                ),
                            )
                            .into(),
                        )
                        .await;
                        self.set_close_cause("pairing-pending", CLOSE_NORMAL);
                    },
                    Err(err) => {
                        warn!(conn_id = %self.conn_id, device_id, error = %err, "pairing request invalid");
                        self.send_frame(
                            ResponseFrame::err(
                                &req.id,
                                ErrorShape::new(error_codes::AUTH_FAILED, "authentication failed"),
                            )
                            .into(),
                        )
                        .await;
                        self.set_close_cause("auth-failed", CLOSE_POLICY_VIOLATION);
                    },
                }
                Flow::Close
            },
        }
    }

    /// Handshake succeeded: build the client session, register shared
    /// state, reply with the session-establishment payload.
    async fn establish(&mut self, request_id: &str, params: ConnectParams) {
        self.phase = Phase::Connected;

        let role = params.role().to_string();
        let presence_key = params
            .client
            .id
            .clone()
            .unwrap_or_else(|| self.conn_id.clone());

        let is_node = role == roles::NODE;
        if is_node {
            let node = params.node.clone().unwrap_or_default();
            let node_id = node
                .node_id
                .or_else(|| params.client.id.clone())
                .unwrap_or_else(|| self.conn_id.clone());
            let superseded = self.state.nodes.write().await.register(NodeSession {
                node_id: node_id.clone(),
                conn_id: self.conn_id.clone(),
                display_name: node.display_name,
                platform: node.platform.unwrap_or_else(|| "unknown".into()),
                version: node
                    .version
                    .or_else(|| params.client.version.clone())
                    .unwrap_or_default(),
                capabilities: node.capabilities,
                commands: node.commands,
                connected_at: Instant::now(),
            });
            if let Some(old) = superseded {
                info!(
                    node_id = %node_id,
                    old_conn = %old.conn_id,
                    new_conn = %self.conn_id,
                    "node registration superseded"
                );
            }
        }

        self.state
            .register_client(ConnectedClient {
                conn_id: self.conn_id.clone(),
                connect_params: params,
                presence_key: presence_key.clone(),
                sender: self.out_tx.clone(),
                connected_at: Instant::now(),
            })
            .await;

        self.established = Some(Established {
            presence_key: presence_key.clone(),
            role,
            is_node,
        });

        self.state
            .presence
            .write()
            .await
            .upsert(&presence_key, "online", "connect");
        broadcast_presence(&self.state).await;

        let snapshot = self.state.health.read().await.payload();
        let payload = serde_json::json!({
            "protocol": PROTOCOL_VERSION,
            "server": {
                "version": self.state.version,
                "host": self.state.hostname,
                "connId": self.conn_id,
            },
            "features": {
                "methods": self.methods.method_names(),
                "events": EVENT_NAMES,
            },
            "snapshot": snapshot,
            "policy": {
                "maxPayload": self.state.policy.max_payload_bytes,
                "maxBufferedBytes": self.state.policy.max_buffered_bytes,
                "tickIntervalMs": self.state.policy.tick_interval.as_millis() as u64,
            },
        });
        self.send_frame(ResponseFrame::ok(request_id, payload).into())
            .await;
    }

    /// Tear the session down exactly once. Registry cleanup runs inline
    /// so no stale presence or node state outlives the connection.
    async fn teardown(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        let handshake = match self.phase {
            Phase::Connected => "connected",
            _ => "pending",
        };
        self.phase = Phase::Closed;

        let cause = self.close_cause.get().copied().unwrap_or("normal");
        let code = self.close_code;

        // Queue the close frame first so the peer sees the code promptly.
        let _ = self
            .out_tx
            .send(Outbound::Close {
                code,
                reason: cause.to_string(),
            })
            .await;

        if let Some(established) = self.established.take() {
            self.state.remove_client(&self.conn_id).await;
            self.state
                .presence
                .write()
                .await
                .upsert(&established.presence_key, "offline", "disconnect");
            broadcast_presence(&self.state).await;

            if established.is_node
                && let Some(node) = self
                    .state
                    .nodes
                    .write()
                    .await
                    .unregister_by_conn(&self.conn_id)
            {
                info!(conn_id = %self.conn_id, node_id = %node.node_id, "node unregistered");
            }
        }

        info!(
            conn_id = %self.conn_id,
            cause,
            code,
            handshake,
            duration_ms = self.opened_at.elapsed().as_millis() as u64,
            last_frame_type = self.last_frame.ty.unwrap_or("-"),
            last_frame_method = self.last_frame.method.as_deref().unwrap_or("-"),
            last_frame_id = self.last_frame.id.as_deref().unwrap_or("-"),
            "connection closed"
        );
    }
}
