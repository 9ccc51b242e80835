//! Error types for the house scheduler
//!
//! Every failure path degrades a single session or slot. Nothing here is
//! fatal to the scheduler itself.

use crate::games::codec::SignedStateEnvelope;
use std::fmt;

/// Root error type for all scheduler operations
#[derive(Debug, thiserror::Error)]
pub enum HouseError {
    /// Bad input or an action that is illegal for the current phase
    #[error("Validation error: {0}")]
    Validation(String),

    /// Player cannot cover the bet
    #[error("Insufficient balance: player {player_id} needs {required}")]
    InsufficientBalance { player_id: String, required: u64 },

    /// No funded slot is free for this game type and token
    #[error("Insufficient liquidity for {game_type}/{token}")]
    InsufficientLiquidity { game_type: String, token: String },

    /// Tampered envelope, stale envelope, or a forged result
    #[error("Integrity violation: {0}")]
    Integrity(Box<IntegrityViolation>),

    /// Slot failure, oracle failure, or a missing replacement resource
    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    /// State machine transition that the current status does not allow
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Player already holds a non-terminal session
    #[error("Player {player_id} already has active session {session_id}")]
    AlreadyActive { player_id: String, session_id: String },

    /// Player already waits in the queue for this partition
    #[error("Player {player_id} is already queued for {partition}")]
    AlreadyQueued { player_id: String, partition: String },

    #[error("Recovery window expired for session {0}")]
    RecoveryWindowExpired(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Taxonomy class of a [`HouseError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Capacity,
    Integrity,
    Infrastructure,
    Conflict,
    NotFound,
}

impl HouseError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            HouseError::Validation(_) | HouseError::Config(_) => ErrorCategory::Validation,
            HouseError::InsufficientBalance { .. } | HouseError::InsufficientLiquidity { .. } => {
                ErrorCategory::Capacity
            }
            HouseError::Integrity(_) => ErrorCategory::Integrity,
            HouseError::Infrastructure(_) | HouseError::Store(_) => ErrorCategory::Infrastructure,
            HouseError::InvalidTransition { .. }
            | HouseError::AlreadyActive { .. }
            | HouseError::AlreadyQueued { .. }
            | HouseError::RecoveryWindowExpired(_) => ErrorCategory::Conflict,
            HouseError::NotFound { .. } => ErrorCategory::NotFound,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        HouseError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        id: impl Into<String>,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        HouseError::InvalidTransition {
            entity,
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<IntegrityViolation> for HouseError {
    fn from(v: IntegrityViolation) -> Self {
        HouseError::Integrity(Box::new(v))
    }
}

/// What kind of tampering was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityKind {
    SignatureMismatch,
    StaleEnvelope,
    ReplayedEnvelope,
    ResultMismatch,
    WrongPlayer,
}

impl fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityKind::SignatureMismatch => write!(f, "signature mismatch"),
            IntegrityKind::StaleEnvelope => write!(f, "stale envelope"),
            IntegrityKind::ReplayedEnvelope => write!(f, "replayed envelope"),
            IntegrityKind::ResultMismatch => write!(f, "result mismatch"),
            IntegrityKind::WrongPlayer => write!(f, "wrong player"),
        }
    }
}

/// A refused action, carrying the unchanged authoritative state
#[derive(Debug, Clone)]
pub struct IntegrityViolation {
    pub kind: IntegrityKind,
    pub session_id: String,
    pub player_id: String,
    /// Server state as it stood before the refused action
    pub current: Option<SignedStateEnvelope>,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on session {} (player {})",
            self.kind, self.session_id, self.player_id
        )
    }
}

/// Document store failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    /// Conditional update predicate did not hold
    #[error("condition failed for document {0}")]
    ConditionFailed(String),

    #[error("duplicate document id: {0}")]
    Duplicate(String),
}

pub type HouseResult<T> = Result<T, HouseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HouseError::InsufficientBalance {
            player_id: "p1".to_string(),
            required: 50,
        };
        assert!(err.to_string().contains("p1"));
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            HouseError::Validation("x".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            HouseError::from(StoreError::ConditionFailed("s".into())).category(),
            ErrorCategory::Infrastructure
        );
        let violation = IntegrityViolation {
            kind: IntegrityKind::SignatureMismatch,
            session_id: "s".into(),
            player_id: "p".into(),
            current: None,
        };
        assert_eq!(HouseError::from(violation).category(), ErrorCategory::Integrity);
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = HouseError::invalid_transition("session", "s1", "completed", "cancelled");
        assert_eq!(
            err.to_string(),
            "Invalid transition for session s1: completed -> cancelled"
        );
    }
}
