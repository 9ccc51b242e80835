//! Session state machine
//!
//! `waiting_for_house -> in_progress -> {completed, cancelled, expired, timeout}`.
//! Every status change is a conditional update on the session document, so
//! of two racing paths (a sweep and a cancel, say) exactly one tears the
//! session down. The player index enforces one live session per player.

use crate::common::clock::{millis_after, Clock};
use crate::common::traits::BalanceLedger;
use crate::common::types::{new_id, Token};
use crate::config::HouseConfig;
use crate::errors::{HouseError, HouseResult, IntegrityKind, IntegrityViolation, StoreError};
use crate::games::codec::{SignedStateCodec, SignedStateEnvelope};
use crate::games::randomness::RandomnessRecord;
use crate::games::settlement::forfeit_result;
use crate::games::types::{GameResult, GameState, GameType};
use crate::metrics::MetricsRegistry;
use crate::scheduler::{DequeueOutcome, LiquidityScheduler, LiquiditySlot, PlayerQueue, PlayerQueueEntry};
use crate::session::types::{AuditEntry, GameSession, SessionStatus};
use crate::store::DocumentStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub player_id: String,
    pub game_type: GameType,
    pub token: Token,
    pub bet_amount: u64,
    #[serde(default)]
    pub third_party_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
}

/// A validated move ready to be written
#[derive(Debug, Clone)]
pub struct MoveCommit {
    /// Nonce of the envelope the move was checked against
    pub expected_nonce: u64,
    pub state: GameState,
    pub audit: Vec<AuditEntry>,
    pub randomness: RandomnessRecord,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub timed_out: usize,
    pub queue_expired: usize,
}

pub struct SessionLifecycleManager {
    sessions: DocumentStore<GameSession>,
    active_by_player: DashMap<String, String>,
    scheduler: Arc<LiquidityScheduler>,
    queue: Arc<PlayerQueue>,
    ledger: Arc<dyn BalanceLedger>,
    codec: Arc<SignedStateCodec>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    config: Arc<HouseConfig>,
}

impl SessionLifecycleManager {
    pub fn new(
        scheduler: Arc<LiquidityScheduler>,
        queue: Arc<PlayerQueue>,
        ledger: Arc<dyn BalanceLedger>,
        codec: Arc<SignedStateCodec>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
        config: Arc<HouseConfig>,
    ) -> Self {
        Self {
            sessions: DocumentStore::new("game_sessions"),
            active_by_player: DashMap::new(),
            scheduler,
            queue,
            ledger,
            codec,
            clock,
            metrics,
            config,
        }
    }

    pub fn scheduler(&self) -> &Arc<LiquidityScheduler> {
        &self.scheduler
    }

    pub fn queue(&self) -> &Arc<PlayerQueue> {
        &self.queue
    }

    pub fn codec(&self) -> &Arc<SignedStateCodec> {
        &self.codec
    }

    pub fn get(&self, session_id: &str) -> HouseResult<GameSession> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| HouseError::not_found("session", session_id))
    }

    /// The player's live session, if any
    pub fn active_session(&self, player_id: &str) -> Option<GameSession> {
        let session_id = self.active_by_player.get(player_id)?.value().clone();
        self.sessions.get(&session_id).filter(|s| !s.status.is_terminal())
    }

    pub fn in_progress(&self) -> Vec<GameSession> {
        self.sessions.find(|s| s.status == SessionStatus::InProgress)
    }

    fn claim_player(&self, player_id: &str, session_id: &str) -> HouseResult<()> {
        match self.active_by_player.entry(player_id.to_string()) {
            Entry::Occupied(mut e) => {
                // A missing document is a create still in flight
                let live = self
                    .sessions
                    .get(e.get())
                    .map(|s| !s.status.is_terminal())
                    .unwrap_or(true);
                if live {
                    return Err(HouseError::AlreadyActive {
                        player_id: player_id.to_string(),
                        session_id: e.get().clone(),
                    });
                }
                e.insert(session_id.to_string());
                Ok(())
            }
            Entry::Vacant(e) => {
                e.insert(session_id.to_string());
                Ok(())
            }
        }
    }

    fn release_player(&self, player_id: &str, session_id: &str) {
        self.active_by_player.remove_if(player_id, |_, v| v == session_id);
    }

    /// Place a bet: admit straight onto a slot or queue for one
    pub async fn create(&self, req: CreateSessionRequest) -> HouseResult<CreateSessionResponse> {
        if req.player_id.trim().is_empty() {
            return Err(HouseError::Validation("player_id is required".to_string()));
        }
        if req.bet_amount == 0 {
            return Err(HouseError::Validation("bet amount must be > 0".to_string()));
        }
        if !self
            .ledger
            .has_sufficient_balance(&req.player_id, &req.token, req.bet_amount)
            .await?
        {
            return Err(HouseError::InsufficientBalance {
                player_id: req.player_id,
                required: req.bet_amount,
            });
        }

        let session_id = new_id("session");
        self.claim_player(&req.player_id, &session_id)?;

        let now = self.clock.now_millis();
        let session = GameSession {
            id: session_id.clone(),
            player_id: req.player_id.clone(),
            liquidity_slot_id: None,
            game_type: req.game_type,
            token: req.token.clone(),
            bet_amount: req.bet_amount,
            status: SessionStatus::WaitingForHouse,
            game_state: None,
            audit_trail: vec![AuditEntry::lifecycle("created", None, now)],
            result: None,
            vrf_request_id: None,
            randomness: None,
            is_third_party: req.third_party_id.is_some(),
            third_party_id: req.third_party_id.clone(),
            created_at: now,
            expires_at: millis_after(now, self.config.session_ttl()),
            activated_at: None,
            completed_at: None,
            envelope: None,
            envelope_nonce: 0,
            rounds_played: 0,
            bet_escrowed: false,
        };
        if let Err(e) = self.sessions.insert_new(session) {
            self.release_player(&req.player_id, &session_id);
            return Err(e.into());
        }

        let admitted = match self
            .scheduler
            .reserve(&session_id, req.game_type, &req.token, req.bet_amount)
        {
            Ok(slot) => slot,
            Err(e) => {
                self.abandon(&req.player_id, &session_id);
                return Err(e);
            }
        };

        if let Some(slot) = admitted {
            if let Err(e) = self.activate(&session_id, &slot).await {
                self.abandon(&req.player_id, &session_id);
                return Err(e);
            }
            self.metrics.record_session_created(false);
            info!(
                session_id = %session_id,
                player_id = %req.player_id,
                slot_id = %slot.id,
                bet_amount = req.bet_amount,
                "session admitted"
            );
            return Ok(CreateSessionResponse {
                session_id,
                status: SessionStatus::InProgress,
                queue_position: None,
            });
        }

        let entry = match self
            .queue
            .enqueue(&req.player_id, req.game_type, &req.token, req.bet_amount)
        {
            Ok(entry) => entry,
            Err(e) => {
                self.abandon(&req.player_id, &session_id);
                return Err(e);
            }
        };

        self.metrics.record_session_created(true);
        info!(
            session_id = %session_id,
            player_id = %req.player_id,
            queue_position = entry.queue_position,
            "no liquidity, session waiting for house"
        );
        Ok(CreateSessionResponse {
            session_id,
            status: SessionStatus::WaitingForHouse,
            queue_position: Some(entry.queue_position),
        })
    }

    fn abandon(&self, player_id: &str, session_id: &str) {
        self.sessions.remove(session_id);
        self.release_player(player_id, session_id);
    }

    /// Escrow the bet and move a waiting session onto `slot`
    async fn activate(&self, session_id: &str, slot: &LiquiditySlot) -> HouseResult<GameSession> {
        let session = self.get(session_id)?;
        let debited = self
            .ledger
            .debit(&session.player_id, &session.token, session.bet_amount)
            .await;
        if let Err(e) = debited {
            self.scheduler.release(session_id, None, None)?;
            return Err(e);
        }

        let now = self.clock.now_millis();
        let codec = &self.codec;
        let activated = self.sessions.update_if(
            session_id,
            |s| s.status == SessionStatus::WaitingForHouse,
            |s| {
                let state = GameState::initial(s.game_type);
                let payload = s.envelope_payload(&state);
                s.status = SessionStatus::InProgress;
                s.liquidity_slot_id = Some(slot.id.clone());
                s.activated_at = Some(now);
                s.bet_escrowed = true;
                s.envelope_nonce = 0;
                s.envelope = Some(codec.sign(payload, 0, now));
                s.audit_trail.push(AuditEntry::lifecycle("activated", Some(&state), now));
                s.game_state = Some(state);
            },
        );

        match activated {
            Ok(session) => Ok(session),
            Err(e) => {
                // Torn down while we were debiting
                self.ledger
                    .credit(&session.player_id, &session.token, session.bet_amount)
                    .await?;
                self.scheduler.release(session_id, None, None)?;
                Err(self.status_error(e, session_id, SessionStatus::InProgress))
            }
        }
    }

    /// Settle a finished game and hand the freed capacity to the queue
    pub async fn complete(&self, session_id: &str, result: GameResult) -> HouseResult<GameSession> {
        let now = self.clock.now_millis();
        let session = self
            .sessions
            .update_if(
                session_id,
                |s| s.status == SessionStatus::InProgress,
                |s| {
                    s.status = SessionStatus::Completed;
                    s.result = Some(result);
                    s.completed_at = Some(now);
                    s.audit_trail
                        .push(AuditEntry::lifecycle("completed", s.game_state.as_ref(), now));
                },
            )
            .map_err(|e| self.status_error(e, session_id, SessionStatus::Completed))?;

        let payout = if session.bet_escrowed && result.player_payout > 0 {
            self.ledger
                .credit(&session.player_id, &session.token, result.player_payout)
                .await
        } else {
            Ok(())
        };
        self.scheduler.release(
            session_id,
            session.liquidity_slot_id.as_deref(),
            Some((session.bet_amount, result)),
        )?;
        self.release_player(&session.player_id, session_id);
        self.metrics.record_session_completed();
        info!(
            session_id,
            player_id = %session.player_id,
            winner = %result.winner,
            player_payout = result.player_payout,
            "session completed"
        );

        self.scheduler.rotate(session.game_type, &session.token);
        self.drain_queue(session.game_type, &session.token, 1).await?;

        if let Err(e) = payout {
            error!(
                session_id,
                player_id = %session.player_id,
                player_payout = result.player_payout,
                error = %e,
                "payout credit failed, left for reconciliation"
            );
            let now = self.clock.now_millis();
            let _ = self.sessions.update_if(
                session_id,
                |s| s.status == SessionStatus::Completed,
                |s| s.audit_trail.push(AuditEntry::lifecycle("payout_failed", None, now)),
            );
            return Err(e);
        }
        Ok(session)
    }

    pub async fn cancel(&self, session_id: &str) -> HouseResult<GameSession> {
        self.terminate(session_id, SessionStatus::Cancelled).await
    }

    pub async fn expire(&self, session_id: &str) -> HouseResult<GameSession> {
        self.terminate(session_id, SessionStatus::Expired).await
    }

    pub async fn timeout(&self, session_id: &str) -> HouseResult<GameSession> {
        self.terminate(session_id, SessionStatus::Timeout).await
    }

    /// Tear the session down, then hand a freed slot to the queue
    async fn terminate(&self, session_id: &str, target: SessionStatus) -> HouseResult<GameSession> {
        let (session, previous) = self.teardown(session_id, target).await?;
        if previous == Some(SessionStatus::InProgress) {
            self.scheduler.rotate(session.game_type, &session.token);
            self.drain_queue(session.game_type, &session.token, 1).await?;
        }
        Ok(session)
    }

    /// Force a live session into a terminal status other than completed.
    ///
    /// A waiting session loses its queue entry. An in-progress session
    /// gets its stake back if no round was played, otherwise the house
    /// keeps it. Its slot is released but not refilled here.
    async fn teardown(
        &self,
        session_id: &str,
        target: SessionStatus,
    ) -> HouseResult<(GameSession, Option<SessionStatus>)> {
        if !matches!(
            target,
            SessionStatus::Cancelled | SessionStatus::Expired | SessionStatus::Timeout
        ) {
            return Err(HouseError::Validation(format!("{} is not a teardown status", target)));
        }

        let now = self.clock.now_millis();
        let mut previous = None;
        let session = self
            .sessions
            .update_if(
                session_id,
                |s| !s.status.is_terminal(),
                |s| {
                    previous = Some(s.status);
                    if s.status == SessionStatus::InProgress && s.bet_escrowed {
                        s.result = Some(forfeit_result(s.bet_amount, s.rounds_played));
                    }
                    s.status = target;
                    s.completed_at = Some(now);
                    s.audit_trail
                        .push(AuditEntry::lifecycle(target.to_string(), s.game_state.as_ref(), now));
                },
            )
            .map_err(|e| self.status_error(e, session_id, target))?;

        match previous {
            Some(SessionStatus::WaitingForHouse) => {
                self.queue.cancel(&session.player_id, session.game_type, &session.token)?;
            }
            Some(SessionStatus::InProgress) => {
                if let Some(result) = session.result {
                    if result.player_payout > 0 {
                        self.ledger
                            .credit(&session.player_id, &session.token, result.player_payout)
                            .await?;
                    }
                }
                let settlement = session
                    .result
                    .filter(|_| session.rounds_played > 0)
                    .map(|r| (session.bet_amount, r));
                self.scheduler
                    .release(session_id, session.liquidity_slot_id.as_deref(), settlement)?;
            }
            _ => {}
        }

        self.release_player(&session.player_id, session_id);
        match target {
            SessionStatus::Cancelled => self.metrics.record_session_cancelled(),
            SessionStatus::Expired => self.metrics.record_session_expired(),
            _ => self.metrics.record_session_timeout(),
        }
        info!(
            session_id,
            player_id = %session.player_id,
            from = ?previous,
            to = %target,
            "session terminated"
        );
        Ok((session, previous))
    }

    /// Expire or time out every live session past its TTL, and expire
    /// queue entries past theirs
    pub async fn sweep_expired(&self, now: u64) -> HouseResult<SweepReport> {
        let mut report = SweepReport::default();

        for session in self.sessions.find(|s| !s.status.is_terminal() && now >= s.expires_at) {
            let outcome = match session.status {
                SessionStatus::WaitingForHouse => self.expire(&session.id).await,
                _ => self.timeout(&session.id).await,
            };
            match outcome {
                Ok(s) if s.status == SessionStatus::Expired => report.expired += 1,
                Ok(_) => report.timed_out += 1,
                // Another path finished it first
                Err(HouseError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        for entry in self.queue.expire_stale(now) {
            report.queue_expired += 1;
            self.expire_waiting_for(&entry).await?;
        }

        if report != SweepReport::default() {
            debug!(?report, "expiry sweep");
        }
        Ok(report)
    }

    async fn expire_waiting_for(&self, entry: &PlayerQueueEntry) -> HouseResult<()> {
        let Some(session) = self.waiting_session_for(entry) else {
            return Ok(());
        };
        match self.teardown(&session.id, SessionStatus::Expired).await {
            Ok(_) | Err(HouseError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn waiting_session_for(&self, entry: &PlayerQueueEntry) -> Option<GameSession> {
        self.sessions.find_one(|s| {
            s.player_id == entry.player_id
                && s.status == SessionStatus::WaitingForHouse
                && s.game_type == entry.game_type
                && s.token.symbol == entry.token.symbol
        })
    }

    /// Admit up to `limit` queued players onto free slots. Returns how
    /// many were admitted.
    pub async fn drain_queue(&self, game_type: GameType, token: &Token, limit: usize) -> HouseResult<usize> {
        let mut admitted = 0;

        while admitted < limit {
            let dequeued = self.queue.dequeue_next(game_type, token).await?;
            for entry in &dequeued.expired {
                self.expire_waiting_for(entry).await?;
            }

            let entry = match dequeued.outcome {
                DequeueOutcome::Matched(entry) => entry,
                DequeueOutcome::Empty | DequeueOutcome::SkipLimitReached => break,
            };

            let Some(session) = self.waiting_session_for(&entry) else {
                debug!(entry_id = %entry.id, player_id = %entry.player_id, "queue entry has no waiting session");
                self.close_entry(&entry)?;
                continue;
            };

            let Some(slot) = self
                .scheduler
                .reserve(&session.id, game_type, token, session.bet_amount)?
            else {
                self.queue.requeue(&entry.id)?;
                break;
            };

            match self.activate(&session.id, &slot).await {
                Ok(_) => {
                    self.queue.confirm_match(&entry.id, &session.id)?;
                    admitted += 1;
                    info!(
                        session_id = %session.id,
                        player_id = %session.player_id,
                        slot_id = %slot.id,
                        queue_position = entry.queue_position,
                        "queued session admitted"
                    );
                }
                Err(HouseError::InsufficientBalance { .. }) => {
                    warn!(session_id = %session.id, "queued player can no longer cover the bet");
                    self.close_entry(&entry)?;
                    match self.teardown(&session.id, SessionStatus::Expired).await {
                        Ok(_) | Err(HouseError::InvalidTransition { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(HouseError::InvalidTransition { .. }) => {
                    self.close_entry(&entry)?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(admitted)
    }

    /// Expire a matched entry that will never be admitted
    fn close_entry(&self, entry: &PlayerQueueEntry) -> HouseResult<()> {
        match self.queue.expire_matched(&entry.id) {
            Ok(_) | Err(HouseError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Write a validated move: new state, audit entries and a fresh
    /// envelope, only if nobody else moved since `expected_nonce`
    pub fn commit_move(&self, session_id: &str, commit: MoveCommit) -> HouseResult<GameSession> {
        let now = self.clock.now_millis();
        let codec = &self.codec;
        let MoveCommit {
            expected_nonce,
            state,
            audit,
            randomness,
        } = commit;

        let committed = self.sessions.update_if(
            session_id,
            |s| s.status == SessionStatus::InProgress && s.envelope_nonce == expected_nonce,
            |s| {
                let nonce = s.envelope_nonce + 1;
                let payload = s.envelope_payload(&state);
                s.envelope = Some(codec.sign(payload, nonce, now));
                s.envelope_nonce = nonce;
                s.game_state = Some(state);
                s.audit_trail.extend(audit);
                s.vrf_request_id = Some(randomness.request_id.clone());
                s.randomness = Some(randomness);
                s.rounds_played += 1;
            },
        );

        match committed {
            Ok(session) => Ok(session),
            Err(StoreError::ConditionFailed(_)) => {
                let current = self.get(session_id)?;
                if current.status != SessionStatus::InProgress {
                    return Err(HouseError::invalid_transition(
                        "session",
                        session_id,
                        current.status,
                        "move",
                    ));
                }
                Err(IntegrityViolation {
                    kind: IntegrityKind::ReplayedEnvelope,
                    session_id: session_id.to_string(),
                    player_id: current.player_id,
                    current: current.envelope,
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-sign the current state under the next nonce
    pub fn refresh_envelope(&self, session_id: &str) -> HouseResult<SignedStateEnvelope> {
        let now = self.clock.now_millis();
        let codec = &self.codec;
        let session = self
            .sessions
            .update_if(
                session_id,
                |s| s.status == SessionStatus::InProgress && s.game_state.is_some(),
                |s| {
                    if let Some(state) = &s.game_state {
                        let nonce = s.envelope_nonce + 1;
                        s.envelope = Some(codec.sign(s.envelope_payload(state), nonce, now));
                        s.envelope_nonce = nonce;
                    }
                },
            )
            .map_err(|e| self.status_error(e, session_id, SessionStatus::InProgress))?;

        session
            .envelope
            .ok_or_else(|| HouseError::Infrastructure(format!("session {} has no envelope", session_id)))
    }

    /// Point a live session at the slot now backing it
    pub fn rebind_slot(&self, session_id: &str, slot_id: &str) -> HouseResult<GameSession> {
        self.sessions
            .update_if(
                session_id,
                |s| s.status == SessionStatus::InProgress,
                |s| s.liquidity_slot_id = Some(slot_id.to_string()),
            )
            .map_err(|e| self.status_error(e, session_id, SessionStatus::InProgress))
    }

    fn status_error(&self, err: StoreError, session_id: &str, to: SessionStatus) -> HouseError {
        match err {
            StoreError::ConditionFailed(_) => match self.sessions.get(session_id) {
                Some(s) => HouseError::invalid_transition("session", session_id, s.status, to),
                None => HouseError::not_found("session", session_id),
            },
            StoreError::NotFound(_) => HouseError::not_found("session", session_id),
            other => other.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::games::types::Winner;
    use crate::ledger::FaultyLedger;
    use crate::scheduler::{FundSlotRequest, QueueEntryStatus, SlotRegistry};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        lifecycle: SessionLifecycleManager,
        ledger: Arc<FaultyLedger>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(HouseConfig::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let metrics = Arc::new(MetricsRegistry::new());
        let ledger = Arc::new(FaultyLedger::new());
        let slots = Arc::new(SlotRegistry::new(clock.clone()));
        let scheduler = Arc::new(LiquidityScheduler::new(slots, config.clone(), clock.clone(), metrics.clone()));
        let queue = Arc::new(PlayerQueue::new(
            ledger.clone(),
            clock.clone(),
            config.queue_entry_ttl(),
            config.queue.max_stale_skips,
            metrics.clone(),
        ));
        let codec = Arc::new(SignedStateCodec::new(&config.engine.hmac_secret, config.envelope_max_age()));
        let lifecycle = SessionLifecycleManager::new(
            scheduler,
            queue,
            ledger.clone(),
            codec,
            clock.clone(),
            metrics,
            config,
        );
        Fixture { lifecycle, ledger, clock }
    }

    fn fund(f: &Fixture, owner: &str) -> LiquiditySlot {
        f.lifecycle
            .scheduler()
            .slots()
            .fund_slot(FundSlotRequest {
                owner_id: owner.to_string(),
                game_type: GameType::CoinFlip,
                token: Token::sol(),
                amount: 50_000,
                rounds_per_session: 5,
                safety_multiplier: 2,
                max_single_payout: 500,
            })
            .unwrap()
    }

    fn request(player: &str, bet: u64) -> CreateSessionRequest {
        CreateSessionRequest {
            player_id: player.to_string(),
            game_type: GameType::CoinFlip,
            token: Token::sol(),
            bet_amount: bet,
            third_party_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_admits_and_escrows() {
        let f = fixture();
        fund(&f, "o1");
        f.ledger.deposit("p1", &Token::sol(), 1_000);

        let created = f.lifecycle.create(request("p1", 100)).await.unwrap();
        assert_eq!(created.status, SessionStatus::InProgress);
        assert_eq!(created.queue_position, None);
        assert_eq!(f.ledger.balance("p1", &Token::sol()), 900);

        let session = f.lifecycle.get(&created.session_id).unwrap();
        assert!(session.bet_escrowed);
        assert_eq!(session.envelope.as_ref().unwrap().nonce, 0);
        assert!(session.game_state.is_some());
        assert!(f.lifecycle.scheduler().slots().holding(&created.session_id).is_some());
    }

    #[tokio::test]
    async fn test_create_without_liquidity_queues() {
        let f = fixture();
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        f.ledger.deposit("p2", &Token::sol(), 1_000);

        let a = f.lifecycle.create(request("p1", 100)).await.unwrap();
        let b = f.lifecycle.create(request("p2", 100)).await.unwrap();
        assert_eq!(a.status, SessionStatus::WaitingForHouse);
        assert_eq!(a.queue_position, Some(1));
        assert_eq!(b.queue_position, Some(2));
        assert_eq!(f.ledger.balance("p1", &Token::sol()), 1_000);
    }

    #[tokio::test]
    async fn test_one_live_session_per_player() {
        let f = fixture();
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        f.lifecycle.create(request("p1", 100)).await.unwrap();
        let err = f.lifecycle.create(request("p1", 100)).await.unwrap_err();
        assert!(matches!(err, HouseError::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let f = fixture();
        fund(&f, "o1");
        f.ledger.deposit("p1", &Token::sol(), 50);
        let err = f.lifecycle.create(request("p1", 100)).await.unwrap_err();
        assert!(matches!(err, HouseError::InsufficientBalance { .. }));
        assert!(f.lifecycle.active_session("p1").is_none());
    }

    #[tokio::test]
    async fn test_complete_settles_and_drains_queue() {
        let f = fixture();
        let slot = fund(&f, "o1");
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        f.ledger.deposit("p2", &Token::sol(), 1_000);

        let first = f.lifecycle.create(request("p1", 100)).await.unwrap();
        let second = f.lifecycle.create(request("p2", 100)).await.unwrap();
        assert_eq!(second.status, SessionStatus::WaitingForHouse);

        let win = GameResult { winner: Winner::Player, player_payout: 200, house_payout: 0 };
        let done = f.lifecycle.complete(&first.session_id, win).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(f.ledger.balance("p1", &Token::sol()), 1_100);

        let slot = f.lifecycle.scheduler().slots().get(&slot.id).unwrap();
        assert_eq!(slot.total_funds, 49_900);
        assert_eq!(slot.games_played, 1);
        assert_eq!(slot.current_session_id.as_deref(), Some(second.session_id.as_str()));

        let admitted = f.lifecycle.get(&second.session_id).unwrap();
        assert_eq!(admitted.status, SessionStatus::InProgress);
        assert_eq!(f.ledger.balance("p2", &Token::sol()), 900);

        let again = f.lifecycle.complete(&first.session_id, win).await.unwrap_err();
        assert!(matches!(again, HouseError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_waiting_removes_queue_entry() {
        let f = fixture();
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        let created = f.lifecycle.create(request("p1", 100)).await.unwrap();

        let cancelled = f.lifecycle.cancel(&created.session_id).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(f.lifecycle.queue().waiting_count(GameType::CoinFlip, &Token::sol()), 0);
        assert!(f.lifecycle.create(request("p1", 100)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_before_any_round_refunds() {
        let f = fixture();
        let slot = fund(&f, "o1");
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        let created = f.lifecycle.create(request("p1", 100)).await.unwrap();

        f.lifecycle.cancel(&created.session_id).await.unwrap();
        assert_eq!(f.ledger.balance("p1", &Token::sol()), 1_000);
        let slot = f.lifecycle.scheduler().slots().get(&slot.id).unwrap();
        assert!(slot.is_idle());
        assert_eq!(slot.games_played, 0);

        let err = f.lifecycle.cancel(&created.session_id).await.unwrap_err();
        assert!(matches!(err, HouseError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_sweep_expires_and_times_out() {
        let f = fixture();
        fund(&f, "o1");
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        f.ledger.deposit("p2", &Token::sol(), 1_000);
        let playing = f.lifecycle.create(request("p1", 100)).await.unwrap();
        let waiting = f.lifecycle.create(request("p2", 100)).await.unwrap();

        f.clock.advance(Duration::from_secs(1_801));
        let report = f.lifecycle.sweep_expired(f.clock.now_millis()).await.unwrap();
        assert_eq!(report.timed_out, 1);

        assert_eq!(f.lifecycle.get(&playing.session_id).unwrap().status, SessionStatus::Timeout);
        assert_eq!(f.lifecycle.get(&waiting.session_id).unwrap().status, SessionStatus::Expired);
        assert!(f.lifecycle.scheduler().slots().holding(&playing.session_id).is_none());
    }

    #[tokio::test]
    async fn test_unaffordable_queued_player_is_expired_with_entry() {
        let f = fixture();
        let slot = fund(&f, "o1");
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        f.ledger.deposit("p2", &Token::sol(), 1_000);
        let first = f.lifecycle.create(request("p1", 100)).await.unwrap();
        let second = f.lifecycle.create(request("p2", 100)).await.unwrap();

        // The balance check passes but the escrow debit does not
        f.ledger.refuse_debits.store(true, Ordering::SeqCst);
        f.lifecycle.cancel(&first.session_id).await.unwrap();

        assert_eq!(f.lifecycle.get(&second.session_id).unwrap().status, SessionStatus::Expired);
        let entries = f.lifecycle.queue().entries_for("p2");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, QueueEntryStatus::Expired);
        assert!(entries[0].matched_session_id.is_none());
        assert!(f.lifecycle.scheduler().slots().get(&slot.id).unwrap().is_idle());
        assert!(f.lifecycle.active_session("p2").is_none());
    }

    #[tokio::test]
    async fn test_teardown_expires_stale_queue_head_while_draining() {
        let f = fixture();
        let slot = fund(&f, "o1");
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        f.ledger.deposit("p2", &Token::sol(), 1_000);
        f.ledger.deposit("p3", &Token::sol(), 1_000);
        let playing = f.lifecycle.create(request("p1", 100)).await.unwrap();
        let stale = f.lifecycle.create(request("p2", 100)).await.unwrap();

        // Past the queue entry TTL, well inside the session TTL
        f.clock.advance(Duration::from_secs(301));
        let fresh = f.lifecycle.create(request("p3", 100)).await.unwrap();

        f.lifecycle.timeout(&playing.session_id).await.unwrap();
        assert_eq!(f.lifecycle.get(&stale.session_id).unwrap().status, SessionStatus::Expired);
        assert_eq!(f.lifecycle.get(&fresh.session_id).unwrap().status, SessionStatus::InProgress);
        assert_eq!(
            f.lifecycle.scheduler().slots().get(&slot.id).unwrap().current_session_id.as_deref(),
            Some(fresh.session_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_failed_payout_still_frees_slot_and_player() {
        let f = fixture();
        let slot = fund(&f, "o1");
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        let created = f.lifecycle.create(request("p1", 100)).await.unwrap();

        f.ledger.refuse_credits.store(true, Ordering::SeqCst);
        let win = GameResult { winner: Winner::Player, player_payout: 200, house_payout: 0 };
        let err = f.lifecycle.complete(&created.session_id, win).await.unwrap_err();
        assert!(matches!(err, HouseError::Infrastructure(_)));

        let session = f.lifecycle.get(&created.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.audit_trail.iter().any(|a| a.action == "payout_failed"));
        assert!(f.lifecycle.scheduler().slots().get(&slot.id).unwrap().is_idle());
        assert!(f.lifecycle.active_session("p1").is_none());
    }

    #[tokio::test]
    async fn test_commit_move_rejects_stale_nonce() {
        let f = fixture();
        fund(&f, "o1");
        f.ledger.deposit("p1", &Token::sol(), 1_000);
        let created = f.lifecycle.create(request("p1", 100)).await.unwrap();
        let session = f.lifecycle.get(&created.session_id).unwrap();
        let state = session.game_state.clone().unwrap();

        let commit = MoveCommit {
            expected_nonce: 0,
            state: state.clone(),
            audit: vec![],
            randomness: RandomnessRecord {
                request_id: "r1".to_string(),
                origin: crate::games::randomness::RandomnessOrigin::Oracle,
                proof: String::new(),
                values: vec![1],
                extended: 0,
            },
        };
        let updated = f.lifecycle.commit_move(&created.session_id, commit.clone()).unwrap();
        assert_eq!(updated.envelope_nonce, 1);
        assert_eq!(updated.rounds_played, 1);

        let err = f.lifecycle.commit_move(&created.session_id, commit).unwrap_err();
        assert!(matches!(err, HouseError::Integrity(ref v) if v.kind == IntegrityKind::ReplayedEnvelope));
    }
}
