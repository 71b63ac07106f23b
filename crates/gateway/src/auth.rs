use serde::{Deserialize, Serialize};

use portico_protocol::ConnectParams;

use crate::pairing::{PairingState, VerifyOutcome};

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Token,
    Password,
}

/// Resolved gateway auth configuration.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
}

/// Result of a shared-secret authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub ok: bool,
    pub method: Option<AuthMethod>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Token,
    Password,
    Device,
}

/// Outcome of evaluating a `connect` request against the full handshake
/// contract: protocol version, origin policy, then credentials.
///
/// `Denied` carries the server-side reason for diagnostics; the client
/// only ever sees a generic failure.
#[derive(Debug, Clone)]
pub enum ConnectDecision {
    Accept {
        method: AuthMethod,
    },
    VersionMismatch,
    Denied {
        reason: String,
    },
    /// Device is not yet paired: the caller should record a pairing
    /// request and answer "pending approval" without granting a session.
    PairingPending {
        device_id: String,
        public_key: String,
    },
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // XOR each byte and accumulate; any difference makes result non-zero.
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

pub fn is_loopback(ip: &str) -> bool {
    ip == "127.0.0.1" || ip.starts_with("127.") || ip == "::1" || ip.starts_with("::ffff:127.")
}

/// Whether `origin` matches the configured allow-list. Entries are exact
/// matches or `*.`-prefixed wildcard patterns (`https://*.example.com`).
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin else {
        return false;
    };
    allowed.iter().any(|pattern| {
        if let Some((scheme, host_pattern)) = pattern.split_once("://")
            && let Some(suffix) = host_pattern.strip_prefix("*.")
        {
            return origin
                .strip_prefix(scheme)
                .and_then(|rest| rest.strip_prefix("://"))
                .is_some_and(|host| host == suffix || host.ends_with(&format!(".{suffix}")));
        }
        pattern == origin
    })
}

// ── Auth logic ───────────────────────────────────────────────────────────────

/// Resolve auth config from environment / config values.
pub fn resolve_auth(token: Option<String>, password: Option<String>) -> ResolvedAuth {
    let mode = if password.is_some() {
        AuthMode::Password
    } else {
        AuthMode::Token
    };
    ResolvedAuth {
        mode,
        token,
        password,
    }
}

/// Validate a shared-secret credential against the resolved auth config.
/// Only the credential kind selected by the configured mode is honored.
pub fn authorize_connect(
    auth: &ResolvedAuth,
    provided_token: Option<&str>,
    provided_password: Option<&str>,
) -> AuthResult {
    match auth.mode {
        AuthMode::Token => check_secret(
            auth.token.as_deref(),
            provided_token,
            AuthMethod::Token,
            "token",
        ),
        AuthMode::Password => check_secret(
            auth.password.as_deref(),
            provided_password,
            AuthMethod::Password,
            "password",
        ),
    }
}

fn check_secret(
    expected: Option<&str>,
    given: Option<&str>,
    method: AuthMethod,
    kind: &str,
) -> AuthResult {
    let failure = |detail: &str| AuthResult {
        ok: false,
        method: None,
        reason: Some(format!("{kind}_{detail}")),
    };
    let Some(expected) = expected else {
        return failure("missing_config");
    };
    let Some(given) = given else {
        return failure("missing");
    };
    if !safe_equal(given, expected) {
        return failure("mismatch");
    }
    AuthResult {
        ok: true,
        method: Some(method),
        reason: None,
    }
}

/// Evaluate the full `connect` contract for one connection.
///
/// Check order: protocol version, origin (browser clients only; loopback
/// remotes exempt), then exactly one credential path — shared secret, or
/// a device signature over this connection's challenge nonce, or the
/// pairing-request flow for unpaired devices. Loopback never exempts the
/// credential check itself.
pub fn evaluate_connect(
    auth: &ResolvedAuth,
    allowed_origins: &[String],
    params: &ConnectParams,
    origin: Option<&str>,
    remote_ip: &str,
    nonce: &str,
    pairing: &PairingState,
) -> ConnectDecision {
    if !params.protocol_compatible() {
        return ConnectDecision::VersionMismatch;
    }

    if params.is_browser() && !is_loopback(remote_ip) && !origin_allowed(origin, allowed_origins) {
        return ConnectDecision::Denied {
            reason: format!("origin_denied: {}", origin.unwrap_or("<none>")),
        };
    }

    if let Some(device) = &params.device {
        if !pairing.is_paired(&device.device_id) {
            return ConnectDecision::PairingPending {
                device_id: device.device_id.clone(),
                public_key: device.public_key.clone(),
            };
        }
        return match pairing.verify(&device.device_id, nonce, device.signature.as_deref()) {
            VerifyOutcome::Verified => ConnectDecision::Accept {
                method: AuthMethod::Device,
            },
            VerifyOutcome::BadSignature => ConnectDecision::Denied {
                reason: format!("device_signature_invalid: {}", device.device_id),
            },
            VerifyOutcome::NotPaired => ConnectDecision::Denied {
                reason: format!("device_not_paired: {}", device.device_id),
            },
        };
    }

    let secret = authorize_connect(
        auth,
        params.auth.as_ref().and_then(|a| a.token.as_deref()),
        params.auth.as_ref().and_then(|a| a.password.as_deref()),
    );
    if secret.ok {
        ConnectDecision::Accept {
            method: secret.method.unwrap_or(AuthMethod::Token),
        }
    } else {
        ConnectDecision::Denied {
            reason: secret.reason.unwrap_or_else(|| "credential_invalid".into()),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use portico_protocol::{AuthPayload, ClientInfo, DeviceAuth};

    use super::*;

    fn token_auth() -> ResolvedAuth {
        resolve_auth(Some("secret".into()), None)
    }

    fn connect_with_token(token: &str) -> ConnectParams {
        ConnectParams {
            auth: Some(AuthPayload {
                token: Some(token.into()),
                password: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn safe_equal_matches_and_rejects() {
        assert!(safe_equal("abc", "abc"));
        assert!(!safe_equal("abc", "abd"));
        assert!(!safe_equal("abc", "abcd"));
        assert!(safe_equal("", ""));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("127.1.2.3"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("::ffff:127.0.0.1"));
        assert!(!is_loopback("192.168.1.10"));
    }

    #[test]
    fn origin_exact_and_wildcard() {
        let allowed = vec![
            "https://ui.example.com".to_string(),
            "https://*.apps.example.com".to_string(),
        ];
        assert!(origin_allowed(Some("https://ui.example.com"), &allowed));
        assert!(origin_allowed(
            Some("https://one.apps.example.com"),
            &allowed
        ));
        assert!(origin_allowed(Some("https://apps.example.com"), &allowed));
        assert!(!origin_allowed(Some("https://evil.example.com"), &allowed));
        assert!(!origin_allowed(
            Some("http://ui.example.com"), // scheme must match
            &allowed
        ));
        assert!(!origin_allowed(None, &allowed));
        assert!(!origin_allowed(Some("https://ui.example.com"), &[]));
    }

    #[test]
    fn password_mode_wins_when_configured() {
        let auth = resolve_auth(Some("tok".into()), Some("pw".into()));
        assert_eq!(auth.mode, AuthMode::Password);
        assert!(authorize_connect(&auth, None, Some("pw")).ok);
        assert!(!authorize_connect(&auth, Some("tok"), None).ok);
    }

    #[test]
    fn token_mode_requires_exact_token() {
        let auth = token_auth();
        assert!(authorize_connect(&auth, Some("secret"), None).ok);

        let wrong = authorize_connect(&auth, Some("nope"), None);
        assert!(!wrong.ok);
        assert_eq!(wrong.reason.as_deref(), Some("token_mismatch"));

        let missing = authorize_connect(&auth, None, None);
        assert_eq!(missing.reason.as_deref(), Some("token_missing"));
    }

    #[test]
    fn unconfigured_token_rejects_everyone() {
        let auth = resolve_auth(None, None);
        let res = authorize_connect(&auth, Some("anything"), None);
        assert!(!res.ok);
        assert_eq!(res.reason.as_deref(), Some("token_missing_config"));
    }

    #[test]
    fn evaluate_rejects_incompatible_protocol() {
        let params = ConnectParams {
            max_protocol: Some(0),
            ..connect_with_token("secret")
        };
        let decision = evaluate_connect(
            &token_auth(),
            &[],
            &params,
            None,
            "203.0.113.9",
            "n",
            &PairingState::new(),
        );
        assert!(matches!(decision, ConnectDecision::VersionMismatch));
    }

    #[test]
    fn browser_client_needs_allowed_origin() {
        let mut params = connect_with_token("secret");
        params.client = ClientInfo {
            platform: Some("web".into()),
            ..Default::default()
        };
        let allowed = vec!["https://ui.example.com".to_string()];

        let denied = evaluate_connect(
            &token_auth(),
            &allowed,
            &params,
            Some("https://evil.example.com"),
            "203.0.113.9",
            "n",
            &PairingState::new(),
        );
        assert!(matches!(denied, ConnectDecision::Denied { .. }));

        let ok = evaluate_connect(
            &token_auth(),
            &allowed,
            &params,
            Some("https://ui.example.com"),
            "203.0.113.9",
            "n",
            &PairingState::new(),
        );
        assert!(matches!(ok, ConnectDecision::Accept { .. }));
    }

    #[test]
    fn loopback_exempts_origin_but_not_credentials() {
        let mut params = connect_with_token("wrong");
        params.role = Some("webchat".into());

        // Origin check skipped for loopback, credential check still bites.
        let decision = evaluate_connect(
            &token_auth(),
            &[],
            &params,
            None,
            "127.0.0.1",
            "n",
            &PairingState::new(),
        );
        assert!(matches!(decision, ConnectDecision::Denied { .. }));

        let mut ok_params = connect_with_token("secret");
        ok_params.role = Some("webchat".into());
        let decision = evaluate_connect(
            &token_auth(),
            &[],
            &ok_params,
            None,
            "127.0.0.1",
            "n",
            &PairingState::new(),
        );
        assert!(matches!(decision, ConnectDecision::Accept { .. }));
    }

    #[test]
    fn unpaired_device_goes_to_pairing() {
        let params = ConnectParams {
            device: Some(DeviceAuth {
                device_id: "dev-1".into(),
                public_key: "AAAA".into(),
                signature: None,
            }),
            ..Default::default()
        };
        let decision = evaluate_connect(
            &token_auth(),
            &[],
            &params,
            None,
            "203.0.113.9",
            "n",
            &PairingState::new(),
        );
        match decision {
            ConnectDecision::PairingPending { device_id, .. } => assert_eq!(device_id, "dev-1"),
            other => panic!("expected pairing pending, got {other:?}"),
        }
    }
}
