//! Session lifecycle and connection recovery

pub mod lifecycle;
pub mod recovery;
pub mod types;

pub use lifecycle::{CreateSessionRequest, CreateSessionResponse, MoveCommit, SessionLifecycleManager, SweepReport};
pub use recovery::{
    ConnectionEvent, ConnectionRecord, ConnectionRecoveryMonitor, EvaluationReport, HeartbeatAck, RecoveryOutcome,
};
pub use types::{AuditEntry, GameSession, SessionStatus};
