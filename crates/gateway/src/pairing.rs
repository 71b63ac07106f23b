use std::collections::HashMap;

use {
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    p256::ecdsa::{Signature, VerifyingKey, signature::Verifier},
};

use crate::now_ms;

/// A device whose public key has been approved out-of-band.
#[derive(Debug, Clone)]
pub struct PairedDevice {
    pub device_id: String,
    /// SEC1-encoded P-256 public key.
    pub public_key: Vec<u8>,
    pub paired_at_ms: u64,
}

/// A pairing request awaiting operator approval.
#[derive(Debug, Clone)]
pub struct PendingPairing {
    pub device_id: String,
    pub public_key: Vec<u8>,
    pub requested_at_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("invalid public key encoding")]
    BadKeyEncoding,
    #[error("unknown device: {0}")]
    UnknownDevice(String),
}

/// Outcome of verifying a device signature over a challenge nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    BadSignature,
    NotPaired,
}

/// In-memory device pairing state. Process-lifetime only; devices
/// re-pair after a gateway restart.
pub struct PairingState {
    paired: HashMap<String, PairedDevice>,
    pending: HashMap<String, PendingPairing>,
}

impl Default for PairingState {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingState {
    pub fn new() -> Self {
        Self {
            paired: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Record a pairing request from an unpaired device. Repeated
    /// requests replace the pending entry (latest key wins).
    pub fn request(&mut self, device_id: &str, public_key_b64: &str) -> Result<(), PairingError> {
        let public_key = BASE64
            .decode(public_key_b64)
            .map_err(|_| PairingError::BadKeyEncoding)?;
        // Reject keys that cannot ever verify.
        VerifyingKey::from_sec1_bytes(&public_key).map_err(|_| PairingError::BadKeyEncoding)?;
        self.pending.insert(device_id.to_string(), PendingPairing {
            device_id: device_id.to_string(),
            public_key,
            requested_at_ms: now_ms(),
        });
        Ok(())
    }

    /// Approve a pending request, moving it to the paired set.
    pub fn approve(&mut self, device_id: &str) -> Result<&PairedDevice, PairingError> {
        let pending = self
            .pending
            .remove(device_id)
            .ok_or_else(|| PairingError::UnknownDevice(device_id.to_string()))?;
        self.paired.insert(device_id.to_string(), PairedDevice {
            device_id: pending.device_id,
            public_key: pending.public_key,
            paired_at_ms: now_ms(),
        });
        self.paired
            .get(device_id)
            .ok_or_else(|| PairingError::UnknownDevice(device_id.to_string()))
    }

    /// Drop a pending request. Returns whether one existed.
    pub fn reject(&mut self, device_id: &str) -> bool {
        self.pending.remove(device_id).is_some()
    }

    pub fn is_paired(&self, device_id: &str) -> bool {
        self.paired.contains_key(device_id)
    }

    pub fn list_pending(&self) -> Vec<&PendingPairing> {
        self.pending.values().collect()
    }

    pub fn list_paired(&self) -> Vec<&PairedDevice> {
        self.paired.values().collect()
    }

    /// Verify a base64 P-256 signature over the challenge nonce bytes
    /// against the paired key for `device_id`.
    pub fn verify(
        &self,
        device_id: &str,
        nonce: &str,
        signature_b64: Option<&str>,
    ) -> VerifyOutcome {
        let Some(device) = self.paired.get(device_id) else {
            return VerifyOutcome::NotPaired;
        };
        let Some(signature_b64) = signature_b64 else {
            return VerifyOutcome::BadSignature;
        };
        let Ok(key) = VerifyingKey::from_sec1_bytes(&device.public_key) else {
            return VerifyOutcome::BadSignature;
        };
        let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
            return VerifyOutcome::BadSignature;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            return VerifyOutcome::BadSignature;
        };
        if key.verify(nonce.as_bytes(), &signature).is_ok() {
            VerifyOutcome::Verified
        } else {
            VerifyOutcome::BadSignature
        }
    }
}
