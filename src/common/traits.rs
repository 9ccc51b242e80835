//! Shared traits and interfaces
//!
//! Capabilities the scheduler consumes but does not own: the balance
//! ledger, the distributed lease lock and the VRF oracle.

use crate::common::types::Token;
use crate::errors::HouseResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Player balances per settlement token
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    async fn has_sufficient_balance(
        &self,
        player_id: &str,
        token: &Token,
        amount: u64,
    ) -> HouseResult<bool>;

    /// Remove `amount`; fails with `InsufficientBalance` and no change
    async fn debit(&self, player_id: &str, token: &Token, amount: u64) -> HouseResult<()>;

    async fn credit(&self, player_id: &str, token: &Token, amount: u64) -> HouseResult<()>;
}

/// Time-bounded lock shared by all service instances
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Take the lease on `job` for `ttl`. Returns false when another holder
    /// owns an unexpired lease.
    async fn try_acquire(&self, job: &str, holder: &str, ttl: Duration) -> HouseResult<bool>;

    /// Drop the lease if `holder` still owns it
    async fn release(&self, job: &str, holder: &str) -> HouseResult<()>;
}

/// Output of one oracle request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleResponse {
    pub values: Vec<u64>,
    /// Hex-encoded proof over the request id
    pub proof: String,
    pub request_id: String,
}

/// External verifiable-random-function oracle
#[async_trait]
pub trait VrfOracle: Send + Sync {
    async fn request_randomness(&self, count: usize) -> HouseResult<OracleResponse>;
}
