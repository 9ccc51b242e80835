//! Randomness for game transitions
//!
//! Wraps the VRF oracle with a timeout. When the oracle errors or is too
//! slow, a locally generated CSPRNG value is used instead and the draw is
//! tagged as non-attestable so disputes can tell the two apart.

use crate::common::traits::VrfOracle;
use crate::errors::{HouseError, HouseResult};
use crate::metrics::MetricsRegistry;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a draw's entropy came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RandomnessOrigin {
    Oracle,
    LocalFallback,
}

/// Randomness consumed by one move, as recorded in the audit trail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RandomnessRecord {
    pub request_id: String,
    pub origin: RandomnessOrigin,
    pub proof: String,
    pub values: Vec<u64>,
    /// Values derived beyond the ones delivered
    #[serde(default)]
    pub extended: u32,
}

impl RandomnessRecord {
    pub fn attestable(&self) -> bool {
        self.origin == RandomnessOrigin::Oracle
    }
}

pub struct RandomnessSource {
    oracle: Arc<dyn VrfOracle>,
    timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl RandomnessSource {
    pub fn new(oracle: Arc<dyn VrfOracle>, timeout: Duration, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            oracle,
            timeout,
            metrics,
        }
    }

    /// Request `count` values, falling back to local entropy
    pub async fn draw(&self, count: usize) -> RandomDraw {
        let count = count.max(1);
        match tokio::time::timeout(self.timeout, self.oracle.request_randomness(count)).await {
            Ok(Ok(response)) if !response.values.is_empty() => {
                debug!(request_id = %response.request_id, count, "oracle randomness");
                RandomDraw::new(RandomnessRecord {
                    request_id: response.request_id,
                    origin: RandomnessOrigin::Oracle,
                    proof: response.proof,
                    values: response.values,
                    extended: 0,
                })
            }
            Ok(Ok(_)) => self.fallback(count, "oracle returned no values"),
            Ok(Err(e)) => self.fallback(count, &e.to_string()),
            Err(_) => self.fallback(count, "oracle timed out"),
        }
    }

    fn fallback(&self, count: usize, reason: &str) -> RandomDraw {
        self.metrics.record_oracle_fallback();
        warn!(reason, count, "oracle unavailable, using local non-attestable randomness");

        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let proof = hex::encode(seed);
        let request_id = format!("local_{}", uuid::Uuid::new_v4().simple());
        // Every value is re-derivable from the recorded seed
        let values = (0..count as u64)
            .map(|i| derive_value(&proof, &request_id, i))
            .collect();

        RandomDraw::new(RandomnessRecord {
            request_id,
            origin: RandomnessOrigin::LocalFallback,
            proof,
            values,
            extended: 0,
        })
    }
}

/// Value `index` of the stream `sha256(proof || request_id || index)`
pub fn derive_value(proof: &str, request_id: &str, index: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(proof.as_bytes());
    hasher.update(request_id.as_bytes());
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}

/// Cursor over the values of one draw.
///
/// Once the delivered values run out, more are derived as
/// `sha256(proof || request_id || index)` so a blackjack dealer turn never
/// needs a second round trip.
pub struct RandomDraw {
    record: RandomnessRecord,
    cursor: usize,
}

impl RandomDraw {
    pub fn new(record: RandomnessRecord) -> Self {
        Self { record, cursor: 0 }
    }

    fn next_u64(&mut self) -> u64 {
        if self.cursor >= self.record.values.len() {
            let value = derive_value(&self.record.proof, &self.record.request_id, self.cursor as u64);
            self.record.values.push(value);
            self.record.extended += 1;
        }
        let value = self.record.values[self.cursor];
        self.cursor += 1;
        value
    }

    /// Unbiased value in `0..bound` by rejection sampling
    pub fn uniform(&mut self, bound: u64) -> HouseResult<u64> {
        if bound == 0 {
            return Err(HouseError::Validation("uniform bound must be > 0".to_string()));
        }
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let v = self.next_u64();
            if v < zone {
                return Ok(v % bound);
            }
        }
    }

    /// Values actually consumed, trimmed to the cursor
    pub fn into_record(mut self) -> RandomnessRecord {
        self.record.values.truncate(self.cursor.max(1).min(self.record.values.len()));
        self.record
    }

    pub fn consumed(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::traits::OracleResponse;
    use crate::games::vrf_engine::SchnorrkelOracle;
    use async_trait::async_trait;

    struct FailingOracle;

    #[async_trait]
    impl VrfOracle for FailingOracle {
        async fn request_randomness(&self, _count: usize) -> HouseResult<OracleResponse> {
            Err(HouseError::Infrastructure("oracle down".to_string()))
        }
    }

    struct SlowOracle;

    #[async_trait]
    impl VrfOracle for SlowOracle {
        async fn request_randomness(&self, count: usize) -> HouseResult<OracleResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(OracleResponse {
                values: vec![0; count],
                proof: String::new(),
                request_id: "late".to_string(),
            })
        }
    }

    fn source(oracle: Arc<dyn VrfOracle>) -> (RandomnessSource, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        (
            RandomnessSource::new(oracle, Duration::from_millis(50), metrics.clone()),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_oracle_draw_is_attestable() {
        let (source, metrics) = source(Arc::new(SchnorrkelOracle::new_random()));
        let mut draw = source.draw(2).await;
        let v = draw.uniform(6).unwrap();
        assert!(v < 6);

        let record = draw.into_record();
        assert!(record.attestable());
        assert_eq!(metrics.snapshot().oracle_fallbacks, 0);
    }

    #[tokio::test]
    async fn test_failure_falls_back() {
        let (source, metrics) = source(Arc::new(FailingOracle));
        let record = source.draw(1).await.into_record();
        assert_eq!(record.origin, RandomnessOrigin::LocalFallback);
        assert!(record.request_id.starts_with("local_"));
        assert_eq!(metrics.snapshot().oracle_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_fallback_values_replay_from_seed() {
        let (source, _) = source(Arc::new(FailingOracle));
        let mut draw = source.draw(2).await;
        for _ in 0..6 {
            draw.uniform(52).unwrap();
        }
        let record = draw.into_record();
        assert!(record.values.len() >= 6);
        for (i, v) in record.values.iter().enumerate() {
            assert_eq!(*v, derive_value(&record.proof, &record.request_id, i as u64));
        }
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        let (source, _) = source(Arc::new(SlowOracle));
        let record = source.draw(1).await.into_record();
        assert!(!record.attestable());
    }

    #[test]
    fn test_draw_extends_deterministically() {
        let record = RandomnessRecord {
            request_id: "r".to_string(),
            origin: RandomnessOrigin::Oracle,
            proof: "ab".to_string(),
            values: vec![5],
            extended: 0,
        };
        let mut a = RandomDraw::new(record.clone());
        let mut b = RandomDraw::new(record);
        let xs: Vec<u64> = (0..5).map(|_| a.uniform(52).unwrap()).collect();
        let ys: Vec<u64> = (0..5).map(|_| b.uniform(52).unwrap()).collect();
        assert_eq!(xs, ys);
        assert!(a.into_record().extended >= 4);
    }

    #[test]
    fn test_uniform_zero_bound() {
        let mut draw = RandomDraw::new(RandomnessRecord {
            request_id: "r".to_string(),
            origin: RandomnessOrigin::Oracle,
            proof: String::new(),
            values: vec![1],
            extended: 0,
        });
        assert!(draw.uniform(0).is_err());
    }
}
