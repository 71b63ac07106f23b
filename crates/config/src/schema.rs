//! Config schema types for the gateway server and its handshake policy.

use serde::{Deserialize, Serialize};

use portico_protocol::{
    HANDSHAKE_TIMEOUT_MS, MAX_BUFFERED_BYTES, MAX_PAYLOAD_BYTES, TICK_INTERVAL_MS,
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PorticoConfig {
    pub gateway: GatewayConfig,
}

/// Gateway server + connection policy configuration.
///
/// Loaded once at startup; the session core treats every field as
/// immutable for the life of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,

    /// Deadline for a valid `connect` after the socket opens.
    pub handshake_timeout_ms: u64,
    /// Largest inbound frame accepted on a connection.
    pub max_payload_bytes: usize,
    /// Advertised cap on bytes buffered toward one client.
    pub max_buffered_bytes: usize,
    /// Health refresh / broadcast tick interval.
    pub tick_interval_ms: u64,

    pub auth: AuthConfig,

    /// Origins accepted from browser-based clients. Entries are exact
    /// matches or `*.`-prefixed wildcard patterns.
    pub allowed_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 17700,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
            auth: AuthConfig::default(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthModeConfig {
    #[default]
    Token,
    Password,
}

/// Credential configuration. Values may use `${ENV}` substitution in the
/// config file; `PORTICO_TOKEN` / `PORTICO_PASSWORD` env vars take
/// precedence at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthModeConfig,
    pub token: Option<String>,
    pub password: Option<String>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_protocol_policy() {
        let cfg = PorticoConfig::default();
        assert_eq!(cfg.gateway.handshake_timeout_ms, HANDSHAKE_TIMEOUT_MS);
        assert_eq!(cfg.gateway.max_payload_bytes, MAX_PAYLOAD_BYTES);
        assert_eq!(cfg.gateway.auth.mode, AuthModeConfig::Token);
        assert!(cfg.gateway.allowed_origins.is_empty());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: PorticoConfig = toml::from_str(
            r#"
            [gateway]
            port = 4100
            allowed_origins = ["https://ui.example.com"]

            [gateway.auth]
            mode = "password"
            password = "hunter2"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gateway.port, 4100);
        assert_eq!(cfg.gateway.bind, "127.0.0.1");
        assert_eq!(cfg.gateway.auth.mode, AuthModeConfig::Password);
        assert_eq!(cfg.gateway.allowed_origins.len(), 1);
        assert_eq!(cfg.gateway.max_buffered_bytes, MAX_BUFFERED_BYTES);
    }
}
