//! In-process balance ledger

use crate::common::traits::BalanceLedger;
use crate::common::types::Token;
use crate::errors::{HouseError, HouseResult};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// Balances keyed by (player, token symbol)
#[derive(Default)]
pub struct InMemoryLedger {
    balances: DashMap<(String, String), u64>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or add funds outside of game settlement
    pub fn deposit(&self, player_id: &str, token: &Token, amount: u64) {
        *self
            .balances
            .entry((player_id.to_string(), token.symbol.clone()))
            .or_insert(0) += amount;
    }

    pub fn balance(&self, player_id: &str, token: &Token) -> u64 {
        self.balances
            .get(&(player_id.to_string(), token.symbol.clone()))
            .map(|b| *b)
            .unwrap_or(0)
    }
}

#[async_trait]
impl BalanceLedger for InMemoryLedger {
    async fn has_sufficient_balance(
        &self,
        player_id: &str,
        token: &Token,
        amount: u64,
    ) -> HouseResult<bool> {
        Ok(self.balance(player_id, token) >= amount)
    }

    async fn debit(&self, player_id: &str, token: &Token, amount: u64) -> HouseResult<()> {
        let key = (player_id.to_string(), token.symbol.clone());
        let insufficient = || HouseError::InsufficientBalance {
            player_id: player_id.to_string(),
            required: amount,
        };

        let mut balance = self.balances.get_mut(&key).ok_or_else(insufficient)?;
        if *balance < amount {
            return Err(insufficient());
        }
        *balance -= amount;
        debug!(player_id, token = %token, amount, remaining = *balance, "debited");
        Ok(())
    }

    async fn credit(&self, player_id: &str, token: &Token, amount: u64) -> HouseResult<()> {
        self.deposit(player_id, token, amount);
        debug!(player_id, token = %token, amount, "credited");
        Ok(())
    }
}

/// Ledger whose debits or credits can be switched to fail
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FaultyLedger {
    inner: InMemoryLedger,
    pub refuse_debits: std::sync::atomic::AtomicBool,
    pub refuse_credits: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FaultyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit(&self, player_id: &str, token: &Token, amount: u64) {
        self.inner.deposit(player_id, token, amount);
    }

    pub fn balance(&self, player_id: &str, token: &Token) -> u64 {
        self.inner.balance(player_id, token)
    }
}

#[cfg(test)]
#[async_trait]
impl BalanceLedger for FaultyLedger {
    async fn has_sufficient_balance(
        &self,
        player_id: &str,
        token: &Token,
        amount: u64,
    ) -> HouseResult<bool> {
        self.inner.has_sufficient_balance(player_id, token, amount).await
    }

    async fn debit(&self, player_id: &str, token: &Token, amount: u64) -> HouseResult<()> {
        if self.refuse_debits.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(HouseError::InsufficientBalance {
                player_id: player_id.to_string(),
                required: amount,
            });
        }
        self.inner.debit(player_id, token, amount).await
    }

    async fn credit(&self, player_id: &str, token: &Token, amount: u64) -> HouseResult<()> {
        if self.refuse_credits.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(HouseError::Infrastructure("ledger unavailable".to_string()));
        }
        self.inner.credit(player_id, token, amount).await
    }
}
