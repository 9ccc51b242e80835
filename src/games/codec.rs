//! Signed game-state envelopes
//!
//! An envelope is a state snapshot plus an HMAC-SHA256 tag over the
//! snapshot, its timestamp and its nonce. The server re-signs on every
//! transition; clients hand back the last envelope they saw.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew for envelopes stamped slightly in the future
const FUTURE_SKEW_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedStateEnvelope {
    pub data: serde_json::Value,
    /// Hex-encoded HMAC tag
    pub signature: String,
    /// Unix millis at signing
    pub timestamp: u64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope signature does not match")]
    BadSignature,
    #[error("envelope is older than the allowed age")]
    Stale,
    #[error("envelope timestamp is in the future")]
    FromFuture,
}

#[derive(Clone)]
pub struct SignedStateCodec {
    key: Vec<u8>,
    max_age: Duration,
}

impl SignedStateCodec {
    pub fn new(secret: impl AsRef<[u8]>, max_age: Duration) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
            max_age,
        }
    }

    fn mac(&self, data: &serde_json::Value, timestamp: u64, nonce: u64) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("hmac accepts keys of any length"));
        // serde_json::Value maps are ordered, so this encoding is canonical
        let payload = serde_json::to_vec(data).unwrap_or_default();
        mac.update(&(payload.len() as u64).to_be_bytes());
        mac.update(&payload);
        mac.update(&timestamp.to_be_bytes());
        mac.update(&nonce.to_be_bytes());
        mac
    }

    pub fn sign(&self, data: serde_json::Value, nonce: u64, now_millis: u64) -> SignedStateEnvelope {
        let tag = self.mac(&data, now_millis, nonce).finalize().into_bytes();
        SignedStateEnvelope {
            data,
            signature: hex::encode(tag),
            timestamp: now_millis,
            nonce,
        }
    }

    /// Check the tag and the envelope age
    pub fn verify(&self, envelope: &SignedStateEnvelope, now_millis: u64) -> Result<(), EnvelopeError> {
        let provided = hex::decode(&envelope.signature).map_err(|_| EnvelopeError::BadSignature)?;
        let expected = self
            .mac(&envelope.data, envelope.timestamp, envelope.nonce)
            .finalize()
            .into_bytes();

        if provided.len() != expected.len() || !bool::from(expected.as_slice().ct_eq(&provided)) {
            return Err(EnvelopeError::BadSignature);
        }

        if envelope.timestamp > now_millis.saturating_add(FUTURE_SKEW_MS) {
            return Err(EnvelopeError::FromFuture);
        }

        if now_millis.saturating_sub(envelope.timestamp) > self.max_age.as_millis() as u64 {
            return Err(EnvelopeError::Stale);
        }

        Ok(())
    }
}
