//! Shared type definitions
//!
//! Canonical identifiers and the settlement token used throughout the
//! scheduler.

use crate::games::types::GameType;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type PlayerId = String;
pub type SessionId = String;
pub type SlotId = String;

/// Suffix of the derived id a pre-staged slot is held under
pub const STAGED_SUFFIX: &str = "_next";

/// Derived session id for the slot staged behind `session_id`
pub fn staged_session_id(session_id: &str) -> SessionId {
    format!("{}{}", session_id, STAGED_SUFFIX)
}

/// Settlement token with optional on-chain mint address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Token {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mint_address: Option<String>,
}

impl Token {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            mint_address: None,
        }
    }

    /// Native SOL token
    pub fn sol() -> Self {
        Self::new("SOL")
    }

    /// USDC SPL token
    pub fn usdc() -> Self {
        Self {
            symbol: "USDC".to_string(),
            mint_address: Some("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string()),
        }
    }

    /// Off-chain platform points
    pub fn points() -> Self {
        Self::new("POINTS")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

/// A (game type, settlement token) partition of slots and queue entries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub game_type: GameType,
    pub token: String,
}

impl PartitionKey {
    pub fn new(game_type: GameType, token: &Token) -> Self {
        Self {
            game_type,
            token: token.symbol.clone(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.game_type, self.token)
    }
}

/// Fresh random document id with a readable prefix
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_session_id() {
        assert_eq!(staged_session_id("sess_1"), "sess_1_next");
    }

    #[test]
    fn test_partition_ignores_mint() {
        let a = PartitionKey::new(GameType::CoinFlip, &Token::usdc());
        let b = PartitionKey::new(GameType::CoinFlip, &Token::new("USDC"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "coinflip/USDC");
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(new_id("sess"), new_id("sess"));
        assert!(new_id("slot").starts_with("slot_"));
    }
}
