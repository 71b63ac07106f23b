//! Wire protocol for the gateway control plane.
//!
//! Every message on a connection is a single self-contained JSON frame,
//! one of `request` / `res` / `event`, validated once at the frame
//! boundary. Malformed shapes surface as [`FrameError`] values, never
//! as panics in the session path.

pub mod connect;
pub mod frames;

pub use {
    connect::{AuthPayload, ClientInfo, ConnectParams, DeviceAuth, NodeInfo},
    frames::{
        ErrorShape, EventFrame, Frame, FrameError, RequestFrame, ResponseFrame, StateVersion,
        recover_request_id,
    },
};

/// Protocol revision negotiated during the `connect` handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Interval between health refresh ticks (and the `health` broadcast).
pub const TICK_INTERVAL_MS: u64 = 30_000;

/// Default deadline for a valid `connect` after the socket opens.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Largest inbound frame the gateway will process.
pub const MAX_PAYLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Advertised cap on bytes buffered toward one client.
pub const MAX_BUFFERED_BYTES: usize = 50 * 1024 * 1024;

/// Frames queued toward one client before broadcasts are dropped for it.
pub const OUTBOUND_QUEUE_FRAMES: usize = 256;

/// WebSocket close code for graceful teardown.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code for handshake timeout / auth failure.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Well-known error codes carried in [`ErrorShape::code`].
pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const VERSION_MISMATCH: &str = "VERSION_MISMATCH";
    pub const PAIRING_PENDING: &str = "PAIRING_PENDING";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Client roles declared at `connect` time.
pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const NODE: &str = "node";
    pub const WEBCHAT: &str = "webchat";
}
