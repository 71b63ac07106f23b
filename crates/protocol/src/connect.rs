use serde::{Deserialize, Serialize};

use crate::{PROTOCOL_VERSION, roles};

/// Parameters of the `connect` request, supplied once at handshake time
/// and immutable for the life of the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: Option<u32>,
    pub max_protocol: Option<u32>,
    pub client: ClientInfo,
    pub role: Option<String>,
    pub auth: Option<AuthPayload>,
    pub device: Option<DeviceAuth>,
    pub node: Option<NodeInfo>,
}

/// Declared client identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
}

/// Shared-secret credential material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthPayload {
    pub token: Option<String>,
    pub password: Option<String>,
}

/// Device credential: a signature over this connection's challenge nonce,
/// verified against a previously paired public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    pub device_id: String,
    /// Base64 SEC1 public key.
    pub public_key: String,
    /// Base64 signature over the challenge nonce bytes.
    #[serde(default)]
    pub signature: Option<String>,
}

/// Node metadata supplied by automation-agent clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: Option<String>,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub version: Option<String>,
    pub capabilities: Vec<String>,
    pub commands: Vec<String>,
}

impl ConnectParams {
    /// Declared role, defaulting to `admin` for plain operator clients.
    pub fn role(&self) -> &str {
        self.role.as_deref().unwrap_or(roles::ADMIN)
    }

    /// Whether the client declared itself browser-based. Browser clients
    /// are subject to origin validation.
    pub fn is_browser(&self) -> bool {
        if self.role() == roles::WEBCHAT {
            return true;
        }
        matches!(
            self.client.platform.as_deref(),
            Some("web") | Some("browser")
        )
    }

    /// Whether the declared protocol range overlaps the server's version.
    /// Absent bounds are treated as compatible.
    pub fn protocol_compatible(&self) -> bool {
        if let Some(max) = self.max_protocol
            && max < PROTOCOL_VERSION
        {
            return false;
        }
        if let Some(min) = self.min_protocol
            && min > PROTOCOL_VERSION
        {
            return false;
        }
        true
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_defaults_to_admin() {
        let params = ConnectParams::default();
        assert_eq!(params.role(), "admin");
    }

    #[test]
    fn webchat_and_web_platform_are_browser_clients() {
        let webchat = ConnectParams {
            role: Some("webchat".into()),
            ..Default::default()
        };
        assert!(webchat.is_browser());

        let web = ConnectParams {
            client: ClientInfo {
                platform: Some("web".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(web.is_browser());

        assert!(!ConnectParams::default().is_browser());
    }

    #[test]
    fn protocol_range_overlap() {
        let ok = ConnectParams {
            min_protocol: Some(1),
            max_protocol: Some(4),
            ..Default::default()
        };
        assert!(ok.protocol_compatible());

        let too_new = ConnectParams {
            min_protocol: Some(PROTOCOL_VERSION + 1),
            ..Default::default()
        };
        assert!(!too_new.protocol_compatible());

        let too_old = ConnectParams {
            max_protocol: Some(0),
            ..Default::default()
        };
        assert!(!too_old.protocol_compatible());

        assert!(ConnectParams::default().protocol_compatible());
    }

    #[test]
    fn deserializes_camel_case_wire_names() {
        let params: ConnectParams = serde_json::from_value(serde_json::json!({
            "minProtocol": 1,
            "client": {"id": "cli-1", "name": "cli", "version": "1"},
            "role": "node",
            "node": {"nodeId": "mac-1", "displayName": "Mac", "capabilities": ["exec"]},
        }))
        .unwrap();
        assert_eq!(params.role(), "node");
        assert_eq!(params.client.id.as_deref(), Some("cli-1"));
        assert_eq!(
            params.node.unwrap().node_id.as_deref(),
            Some("mac-1")
        );
    }
}
