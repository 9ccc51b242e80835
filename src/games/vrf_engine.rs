use crate::common::traits::{OracleResponse, VrfOracle};
use crate::errors::{HouseError, HouseResult};
use async_trait::async_trait;
use schnorrkel::{Keypair, PublicKey, Signature};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const VRF_SIGNING_CONTEXT: &[u8] = b"house-randomness";

/// Schnorrkel-signature oracle.
///
/// The proof is a signature over the request id; values are the hash of
/// the signature expanded per index, so anyone holding the public key can
/// recompute them.
pub struct SchnorrkelOracle {
    keypair: Arc<Keypair>,
    counter: AtomicU64,
}

impl SchnorrkelOracle {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair: Arc::new(keypair),
            counter: AtomicU64::new(0),
        }
    }

    /// Create an oracle with a random keypair
    pub fn new_random() -> Self {
        use rand_core::OsRng;
        let keypair = Keypair::generate_with(OsRng);
        Self::new(keypair)
    }

    fn sign(&self, message: &[u8]) -> Signature {
        use schnorrkel::context::SigningContext;

        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        self.keypair.sign(ctx.bytes(message))
    }

    /// `count` values derived from a proof signature
    pub fn derive_values(signature: &[u8], count: usize) -> Vec<u64> {
        (0..count as u64)
            .map(|i| {
                let mut hasher = Sha256::new();
                hasher.update(signature);
                hasher.update(i.to_le_bytes());
                let digest = hasher.finalize();
                let mut word = [0u8; 8];
                word.copy_from_slice(&digest[..8]);
                u64::from_le_bytes(word)
            })
            .collect()
    }

    /// Check a response against this oracle's public key
    pub fn verify(public_key: &[u8], response: &OracleResponse) -> Result<bool, String> {
        let public_key_array: [u8; 32] = public_key
            .try_into()
            .map_err(|_| "Public key must be 32 bytes")?;
        let public_key = PublicKey::from_bytes(&public_key_array)
            .map_err(|e| format!("Invalid public key: {:?}", e))?;

        let proof = hex::decode(&response.proof)
            .map_err(|e| format!("Invalid proof hex: {}", e))?;
        let signature_array: [u8; 64] = proof
            .as_slice()
            .try_into()
            .map_err(|_| "Signature must be 64 bytes")?;
        let signature = Signature::from_bytes(&signature_array)
            .map_err(|e| format!("Invalid signature: {:?}", e))?;

        use schnorrkel::context::SigningContext;
        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        let transcript = ctx.bytes(response.request_id.as_bytes());
        if public_key.verify(transcript, &signature).is_err() {
            return Ok(false);
        }

        Ok(Self::derive_values(&signature_array, response.values.len()) == response.values)
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.keypair.public.to_bytes().to_vec()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }
}

#[async_trait]
impl VrfOracle for SchnorrkelOracle {
    async fn request_randomness(&self, count: usize) -> HouseResult<OracleResponse> {
        if count == 0 {
            return Err(HouseError::Validation(
                "randomness request for zero values".to_string(),
            ));
        }

        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let request_id = format!("vrf_{}_{}", uuid::Uuid::new_v4().simple(), seq);
        let signature = self.sign(request_id.as_bytes()).to_bytes();

        Ok(OracleResponse {
            values: Self::derive_values(&signature, count),
            proof: hex::encode(signature),
            request_id,
        })
    }
}
