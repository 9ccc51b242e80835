//! Session records

use crate::common::types::Token;
use crate::games::codec::SignedStateEnvelope;
use crate::games::randomness::RandomnessRecord;
use crate::games::types::{GameAction, GameResult, GameState, GameType};
use crate::store::Document;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    WaitingForHouse,
    InProgress,
    Completed,
    Cancelled,
    Expired,
    Timeout,
}

impl SessionStatus {
    /// Terminal statuses are sinks
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::WaitingForHouse | SessionStatus::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::WaitingForHouse => "waiting_for_house",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Expired => "expired",
            SessionStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// One applied move, kept forever for dispute resolution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub action: String,
    pub state_before: Option<GameState>,
    pub state_after: Option<GameState>,
    pub timestamp: u64,
    pub randomness_used: Option<RandomnessRecord>,
}

impl AuditEntry {
    pub fn for_move(
        action: GameAction,
        before: &GameState,
        after: &GameState,
        timestamp: u64,
        randomness: RandomnessRecord,
    ) -> Self {
        Self {
            action: action.to_string(),
            state_before: Some(before.clone()),
            state_after: Some(after.clone()),
            timestamp,
            randomness_used: Some(randomness),
        }
    }

    /// Lifecycle event with no game transition
    pub fn lifecycle(action: impl Into<String>, state: Option<&GameState>, timestamp: u64) -> Self {
        Self {
            action: action.into(),
            state_before: state.cloned(),
            state_after: state.cloned(),
            timestamp,
            randomness_used: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameSession {
    pub id: String,
    pub player_id: String,
    pub liquidity_slot_id: Option<String>,
    pub game_type: GameType,
    pub token: Token,
    pub bet_amount: u64,
    pub status: SessionStatus,
    pub game_state: Option<GameState>,
    /// Append-only
    pub audit_trail: Vec<AuditEntry>,
    pub result: Option<GameResult>,
    pub vrf_request_id: Option<String>,
    pub randomness: Option<RandomnessRecord>,
    pub is_third_party: bool,
    pub third_party_id: Option<String>,
    pub created_at: u64,
    pub expires_at: u64,
    pub activated_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub envelope: Option<SignedStateEnvelope>,
    pub envelope_nonce: u64,
    pub rounds_played: u32,
    /// Bet has been debited from the player and must be settled or refunded
    pub bet_escrowed: bool,
}

impl Document for GameSession {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

impl GameSession {
    /// Signed envelope body: the state bound to its session and player
    pub fn envelope_payload(&self, state: &GameState) -> serde_json::Value {
        serde_json::json!({
            "session_id": self.id,
            "player_id": self.player_id,
            "state": state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!SessionStatus::WaitingForHouse.is_terminal());
        assert!(!SessionStatus::InProgress.is_terminal());
        for s in [
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Expired,
            SessionStatus::Timeout,
        ] {
            assert!(s.is_terminal());
        }
        assert_eq!(SessionStatus::WaitingForHouse.to_string(), "waiting_for_house");
        assert_eq!(
            serde_json::to_value(SessionStatus::InProgress).unwrap(),
            serde_json::json!("in_progress")
        );
    }
}
