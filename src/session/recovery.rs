//! Heartbeats, disconnects and bounded recovery
//!
//! Connection records are a cache beside the session store, never the
//! source of truth: a record whose session is gone or terminal is purged on
//! the next evaluation. Lifecycle signals go out on one unbounded channel
//! per session, consumed by whoever owns the transport.

use crate::common::clock::{millis_after, Clock};
use crate::errors::{HouseError, HouseResult, IntegrityKind, IntegrityViolation};
use crate::games::codec::SignedStateEnvelope;
use crate::metrics::MetricsRegistry;
use crate::session::lifecycle::SessionLifecycleManager;
use crate::session::types::{GameSession, SessionStatus};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub session_id: String,
    pub player_id: String,
    pub transport_id: Option<String>,
    pub last_heartbeat: u64,
    pub is_active: bool,
    /// Last heartbeat instant of the connection that dropped
    pub disconnected_at: Option<u64>,
    pub recovery_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { transport_id: Option<String> },
    Heartbeat { at: u64 },
    Disconnected { at: u64 },
    Recovered { transport_id: String, at: u64 },
    TimedOut { at: u64 },
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub session_id: String,
    pub server_time: u64,
    /// Deadline for the next heartbeat before the session counts as dropped
    pub next_deadline: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub session: GameSession,
    pub envelope: SignedStateEnvelope,
    pub rounds_remaining: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationReport {
    pub tracked: usize,
    pub disconnected: usize,
    pub timed_out: usize,
    pub purged: usize,
}

pub struct ConnectionRecoveryMonitor {
    records: DashMap<String, ConnectionRecord>,
    channels: DashMap<String, mpsc::UnboundedSender<ConnectionEvent>>,
    lifecycle: Arc<SessionLifecycleManager>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    heartbeat_interval: Duration,
    missed_heartbeats: u32,
    recovery_window: Duration,
}

impl ConnectionRecoveryMonitor {
    pub fn new(
        lifecycle: Arc<SessionLifecycleManager>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
        heartbeat_interval: Duration,
        missed_heartbeats: u32,
        recovery_window: Duration,
    ) -> Self {
        Self {
            records: DashMap::new(),
            channels: DashMap::new(),
            lifecycle,
            clock,
            metrics,
            heartbeat_interval,
            missed_heartbeats,
            recovery_window,
        }
    }

    fn silence_limit(&self) -> u64 {
        self.heartbeat_interval.as_millis() as u64 * self.missed_heartbeats as u64
    }

    fn window_millis(&self) -> u64 {
        self.recovery_window.as_millis() as u64
    }

    fn emit(&self, session_id: &str, event: ConnectionEvent) {
        let closed = match self.channels.get(session_id) {
            Some(tx) => tx.send(event).is_err(),
            None => false,
        };
        if closed {
            self.channels.remove(session_id);
        }
    }

    fn close(&self, session_id: &str, event: ConnectionEvent) {
        self.emit(session_id, event);
        self.emit(session_id, ConnectionEvent::Closed);
        self.channels.remove(session_id);
    }

    /// Lifecycle events for one session; a new subscription replaces the old
    pub fn subscribe(&self, session_id: &str) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(session_id.to_string(), tx);
        rx
    }

    pub fn record(&self, session_id: &str) -> Option<ConnectionRecord> {
        self.records.get(session_id).map(|r| r.value().clone())
    }

    fn live_session(&self, session_id: &str, player_id: &str) -> HouseResult<GameSession> {
        let session = self.lifecycle.get(session_id)?;
        if session.player_id != player_id {
            return Err(IntegrityViolation {
                kind: IntegrityKind::WrongPlayer,
                session_id: session_id.to_string(),
                player_id: player_id.to_string(),
                current: None,
            }
            .into());
        }
        Ok(session)
    }

    /// Start monitoring an in-progress session on `transport_id`
    pub fn track(&self, session_id: &str, player_id: &str, transport_id: Option<String>) -> HouseResult<ConnectionRecord> {
        let session = self.live_session(session_id, player_id)?;
        if session.status != SessionStatus::InProgress {
            return Err(HouseError::invalid_transition("session", session_id, session.status, "track"));
        }

        let record = ConnectionRecord {
            session_id: session_id.to_string(),
            player_id: player_id.to_string(),
            transport_id: transport_id.clone(),
            last_heartbeat: self.clock.now_millis(),
            is_active: true,
            disconnected_at: None,
            recovery_attempts: 0,
        };
        self.records.insert(session_id.to_string(), record.clone());
        self.emit(session_id, ConnectionEvent::Connected { transport_id });
        debug!(session_id, player_id, "connection tracked");
        Ok(record)
    }

    /// Refresh liveness. A dropped connection must go through `recover`.
    pub fn heartbeat(&self, session_id: &str, player_id: &str) -> HouseResult<HeartbeatAck> {
        let now = self.clock.now_millis();

        if !self.records.contains_key(session_id) {
            self.track(session_id, player_id, None)?;
        }

        {
            let mut record = self
                .records
                .get_mut(session_id)
                .ok_or_else(|| HouseError::not_found("connection", session_id))?;
            if record.player_id != player_id {
                return Err(IntegrityViolation {
                    kind: IntegrityKind::WrongPlayer,
                    session_id: session_id.to_string(),
                    player_id: player_id.to_string(),
                    current: None,
                }
                .into());
            }
            if !record.is_active {
                return Err(HouseError::invalid_transition(
                    "connection",
                    session_id,
                    "disconnected",
                    "heartbeat",
                ));
            }
            record.last_heartbeat = now;
        }

        self.emit(session_id, ConnectionEvent::Heartbeat { at: now });
        Ok(HeartbeatAck {
            session_id: session_id.to_string(),
            server_time: now,
            next_deadline: millis_after(now, self.heartbeat_interval * self.missed_heartbeats),
        })
    }

    /// One monitoring pass: purge, detect silence, time out unrecovered
    /// sessions, and pick up in-progress sessions nobody tracked yet
    pub async fn evaluate(&self, now: u64) -> HouseResult<EvaluationReport> {
        let mut report = EvaluationReport::default();

        for session in self.lifecycle.in_progress() {
            if self.records.contains_key(&session.id) {
                continue;
            }
            let last = session.activated_at.unwrap_or(now);
            self.records.entry(session.id.clone()).or_insert_with(|| {
                report.tracked += 1;
                ConnectionRecord {
                    session_id: session.id.clone(),
                    player_id: session.player_id.clone(),
                    transport_id: None,
                    last_heartbeat: last,
                    is_active: true,
                    disconnected_at: None,
                    recovery_attempts: 0,
                }
            });
        }

        let snapshot: Vec<ConnectionRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        for record in snapshot {
            let live = self
                .lifecycle
                .get(&record.session_id)
                .map(|s| s.status == SessionStatus::InProgress)
                .unwrap_or(false);
            if !live {
                self.records.remove(&record.session_id);
                self.close(&record.session_id, ConnectionEvent::Closed);
                report.purged += 1;
                continue;
            }

            let mut disconnected_at = record.disconnected_at;
            if record.is_active && now.saturating_sub(record.last_heartbeat) >= self.silence_limit() {
                let marked = match self.records.get_mut(&record.session_id) {
                    Some(mut r) if r.is_active && r.last_heartbeat == record.last_heartbeat => {
                        r.is_active = false;
                        r.disconnected_at = Some(r.last_heartbeat);
                        true
                    }
                    _ => false,
                };
                if marked {
                    disconnected_at = Some(record.last_heartbeat);
                    report.disconnected += 1;
                    self.metrics.record_disconnect();
                    warn!(
                        session_id = %record.session_id,
                        player_id = %record.player_id,
                        last_heartbeat = record.last_heartbeat,
                        "session disconnected"
                    );
                    self.emit(&record.session_id, ConnectionEvent::Disconnected { at: record.last_heartbeat });
                }
            }

            let Some(since) = disconnected_at else { continue };
            if now.saturating_sub(since) < self.window_millis() {
                continue;
            }
            let removed = self
                .records
                .remove_if(&record.session_id, |_, r| !r.is_active && r.disconnected_at == Some(since));
            if removed.is_some() && self.expire_unrecovered(&record.session_id, now).await? {
                report.timed_out += 1;
            }
        }

        Ok(report)
    }

    async fn expire_unrecovered(&self, session_id: &str, now: u64) -> HouseResult<bool> {
        let timed_out = match self.lifecycle.timeout(session_id).await {
            Ok(_) => true,
            Err(HouseError::InvalidTransition { .. }) | Err(HouseError::NotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        if timed_out {
            warn!(session_id, "recovery window elapsed, session timed out");
        }
        self.close(session_id, ConnectionEvent::TimedOut { at: now });
        Ok(timed_out)
    }

    /// Resume a dropped session on a new transport.
    ///
    /// Only the owning player, and only within the recovery window of the
    /// last heartbeat. Game state and round counters are untouched; the
    /// state is re-signed so the client holds a fresh envelope.
    pub async fn recover(&self, session_id: &str, player_id: &str, transport_id: &str) -> HouseResult<RecoveryOutcome> {
        let now = self.clock.now_millis();
        let session = self.live_session(session_id, player_id)?;
        match session.status {
            SessionStatus::InProgress => {}
            SessionStatus::Timeout | SessionStatus::Expired => {
                return Err(HouseError::RecoveryWindowExpired(session_id.to_string()))
            }
            other => return Err(HouseError::invalid_transition("session", session_id, other, "recover")),
        }

        let record = self.record(session_id);
        let since = match &record {
            Some(r) => r.disconnected_at.unwrap_or(r.last_heartbeat),
            None => session.activated_at.unwrap_or(now),
        };
        if now.saturating_sub(since) >= self.window_millis() {
            self.records.remove(session_id);
            self.expire_unrecovered(session_id, now).await?;
            return Err(HouseError::RecoveryWindowExpired(session_id.to_string()));
        }
        // A connection still inside its heartbeat allowance has not dropped
        if let Some(r) = &record {
            if r.is_active && now.saturating_sub(r.last_heartbeat) < self.silence_limit() {
                return Err(HouseError::invalid_transition(
                    "connection",
                    session_id,
                    "connected",
                    "recover",
                ));
            }
        }

        {
            let mut record = self
                .records
                .entry(session_id.to_string())
                .or_insert_with(|| ConnectionRecord {
                    session_id: session_id.to_string(),
                    player_id: player_id.to_string(),
                    transport_id: None,
                    last_heartbeat: since,
                    is_active: false,
                    disconnected_at: Some(since),
                    recovery_attempts: 0,
                });
            record.is_active = true;
            record.disconnected_at = None;
            record.last_heartbeat = now;
            record.transport_id = Some(transport_id.to_string());
            record.recovery_attempts += 1;
        }

        let envelope = self.lifecycle.refresh_envelope(session_id)?;
        let rounds_remaining = self
            .lifecycle
            .scheduler()
            .progress(session_id)
            .map(|p| p.remaining())
            .unwrap_or(0);

        self.metrics.record_recovery();
        info!(session_id, player_id, transport_id, rounds_remaining, "session recovered");
        self.emit(
            session_id,
            ConnectionEvent::Recovered {
                transport_id: transport_id.to_string(),
                at: now,
            },
        );

        Ok(RecoveryOutcome {
            session: self.lifecycle.get(session_id)?,
            envelope,
            rounds_remaining,
        })
    }

    /// Drop every record and close every channel
    pub fn shutdown(&self) {
        let sessions: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        for session_id in sessions {
            self.emit(&session_id, ConnectionEvent::Closed);
        }
        self.channels.clear();
        self.records.clear();
        debug!("connection monitor shut down");
    }
}
