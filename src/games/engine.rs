//! Authoritative move processing
//!
//! A move is checked in a fixed order: ownership, session status, envelope
//! tag and age, envelope freshness, then legality for the current phase.
//! Only then is randomness drawn and the transition applied. A refused move
//! never touches the stored state, and any outcome the client asserts is
//! recomputed and compared rather than used.

use crate::common::clock::Clock;
use crate::config::HouseConfig;
use crate::errors::{HouseError, HouseResult, IntegrityKind, IntegrityViolation};
use crate::games::codec::{EnvelopeError, SignedStateEnvelope};
use crate::games::randomness::{RandomDraw, RandomnessSource};
use crate::games::settlement::{claim_mismatch, compute_result};
use crate::games::types::{
    BlackjackPhase, ClaimedResult, CoinFlipPhase, GameAction, GameResult, GameState, RpsPhase,
};
use crate::games::{blackjack, coin_flip, rps};
use crate::metrics::MetricsRegistry;
use crate::security::RiskMonitor;
use crate::session::{AuditEntry, GameSession, MoveCommit, SessionLifecycleManager, SessionStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequest {
    pub player_id: String,
    pub action: GameAction,
    /// Last envelope the client received
    pub envelope: SignedStateEnvelope,
    #[serde(default)]
    pub claimed_result: Option<ClaimedResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveOutcome {
    pub session_id: String,
    pub envelope: SignedStateEnvelope,
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GameResult>,
    /// The client asserted an outcome that did not match
    pub claim_voided: bool,
}

/// Whether `action` is legal for the phase `state` is in
pub fn check_legal(state: &GameState, action: GameAction) -> HouseResult<()> {
    let legal = match (state, action) {
        (GameState::CoinFlip(s), GameAction::Flip { .. }) => s.phase == CoinFlipPhase::AwaitingChoice,
        (GameState::RockPaperScissors(s), GameAction::Throw { .. }) => s.phase == RpsPhase::AwaitingThrow,
        (GameState::Blackjack(s), GameAction::Deal) => s.phase == BlackjackPhase::AwaitingDeal,
        (GameState::Blackjack(s), GameAction::Hit | GameAction::Stand) => s.phase == BlackjackPhase::PlayerTurn,
        _ => false,
    };
    if legal {
        Ok(())
    } else {
        Err(HouseError::Validation(format!(
            "action {} is not legal for {} in phase {}",
            action,
            state.game_type(),
            state.phase_name()
        )))
    }
}

/// Apply `action` to whichever game `state` holds
pub fn apply_action(state: &mut GameState, action: GameAction, draw: &mut RandomDraw) -> HouseResult<()> {
    match state {
        GameState::CoinFlip(s) => coin_flip::apply(s, action, draw),
        GameState::RockPaperScissors(s) => rps::apply(s, action, draw),
        GameState::Blackjack(s) => blackjack::apply(s, action, draw),
    }
}

/// Oracle values to request up front; later needs are derived from the proof
fn values_needed(action: GameAction) -> usize {
    match action {
        GameAction::Flip { .. } | GameAction::Throw { .. } | GameAction::Hit => 1,
        GameAction::Deal | GameAction::Stand => 4,
    }
}

pub struct SecureGameEngine {
    lifecycle: Arc<SessionLifecycleManager>,
    randomness: Arc<RandomnessSource>,
    risk: Arc<RiskMonitor>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    config: Arc<HouseConfig>,
}

impl SecureGameEngine {
    pub fn new(
        lifecycle: Arc<SessionLifecycleManager>,
        randomness: Arc<RandomnessSource>,
        risk: Arc<RiskMonitor>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
        config: Arc<HouseConfig>,
    ) -> Self {
        Self {
            lifecycle,
            randomness,
            risk,
            clock,
            metrics,
            config,
        }
    }

    fn refuse(
        &self,
        kind: IntegrityKind,
        session: &GameSession,
        player_id: &str,
        current: Option<SignedStateEnvelope>,
    ) -> HouseError {
        let violation = IntegrityViolation {
            kind,
            session_id: session.id.clone(),
            player_id: player_id.to_string(),
            current,
        };
        self.risk.record_violation(&violation);
        violation.into()
    }

    /// Validate and apply one client move
    pub async fn submit_move(&self, session_id: &str, req: MoveRequest) -> HouseResult<MoveOutcome> {
        let session = self.lifecycle.get(session_id)?;
        if session.player_id != req.player_id {
            return Err(self.refuse(IntegrityKind::WrongPlayer, &session, &req.player_id, None));
        }
        if session.status != SessionStatus::InProgress {
            return Err(HouseError::invalid_transition("session", session_id, session.status, "move"));
        }

        let (Some(current), Some(state)) = (session.envelope.clone(), session.game_state.clone()) else {
            return Err(HouseError::Infrastructure(format!(
                "session {} is in progress without state",
                session_id
            )));
        };

        let now = self.clock.now_millis();
        if let Err(e) = self.lifecycle.codec().verify(&req.envelope, now) {
            let kind = match e {
                EnvelopeError::Stale => IntegrityKind::StaleEnvelope,
                EnvelopeError::BadSignature | EnvelopeError::FromFuture => IntegrityKind::SignatureMismatch,
            };
            return Err(self.refuse(kind, &session, &req.player_id, Some(current)));
        }
        if req.envelope.nonce != session.envelope_nonce {
            return Err(self.refuse(IntegrityKind::ReplayedEnvelope, &session, &req.player_id, Some(current)));
        }
        if req.envelope.data != current.data {
            return Err(self.refuse(IntegrityKind::SignatureMismatch, &session, &req.player_id, Some(current)));
        }

        check_legal(&state, req.action)?;

        let mut draw = self.randomness.draw(values_needed(req.action)).await;
        let mut next = state.clone();
        apply_action(&mut next, req.action, &mut draw)?;

        let terminal = next.is_terminal();
        let result = if terminal {
            compute_result(&next, session.bet_amount, &self.config.payouts)
        } else {
            None
        };

        let record = draw.into_record();
        let mut audit = vec![AuditEntry::for_move(req.action, &state, &next, now, record.clone())];

        let claim_voided = match req.claimed_result {
            Some(claim) if claim_mismatch(&claim, result.as_ref()) => {
                let _ = self.refuse(IntegrityKind::ResultMismatch, &session, &req.player_id, None);
                audit.push(AuditEntry::lifecycle(
                    format!("claim_voided:{}", claim.winner),
                    Some(&next),
                    now,
                ));
                true
            }
            _ => false,
        };

        let committed = self.lifecycle.commit_move(
            session_id,
            MoveCommit {
                expected_nonce: session.envelope_nonce,
                state: next,
                audit,
                randomness: record,
            },
        );
        let updated = match committed {
            Ok(s) => s,
            Err(HouseError::Integrity(v)) => {
                self.risk.record_violation(&v);
                return Err(HouseError::Integrity(v));
            }
            Err(e) => return Err(e),
        };
        self.metrics.record_move();
        debug!(
            session_id,
            action = %req.action,
            phase = updated.game_state.as_ref().map(|s| s.phase_name()).unwrap_or("none"),
            nonce = updated.envelope_nonce,
            "move applied"
        );

        let envelope = updated
            .envelope
            .clone()
            .ok_or_else(|| HouseError::Infrastructure(format!("session {} lost its envelope", session_id)))?;

        // The move is committed from here on; the client must get its envelope
        if !terminal {
            if let Err(e) = self.advance_rounds(session_id) {
                error!(session_id, error = %e, "round accounting failed after commit");
            }
        }

        if let Some(result) = result {
            match self.lifecycle.complete(session_id, result).await {
                Ok(_) => info!(
                    session_id,
                    winner = %result.winner,
                    player_payout = result.player_payout,
                    claim_voided,
                    "game settled"
                ),
                Err(e) => error!(
                    session_id,
                    winner = %result.winner,
                    player_payout = result.player_payout,
                    error = %e,
                    "settlement failed after commit"
                ),
            }
        }

        Ok(MoveOutcome {
            session_id: session_id.to_string(),
            envelope,
            terminal,
            result,
            claim_voided,
        })
    }

    /// Count the round, stage the next slot near the end of the budget and
    /// switch to it once the budget is spent
    fn advance_rounds(&self, session_id: &str) -> HouseResult<()> {
        let scheduler = self.lifecycle.scheduler();
        let progress = match scheduler.record_round(session_id) {
            Ok(p) => p,
            Err(HouseError::NotFound { .. }) => {
                warn!(session_id, "no slot holds the session, round not counted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        scheduler.pre_stage_next(session_id)?;
        if progress.exhausted() {
            match scheduler.transition(session_id) {
                Ok(slot) => {
                    self.lifecycle.rebind_slot(session_id, &slot.id)?;
                }
                Err(HouseError::Infrastructure(reason)) => {
                    warn!(session_id, reason = %reason, "round budget spent with nothing staged, staying on current slot");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::common::types::Token;
    use crate::games::codec::SignedStateCodec;
    use crate::games::types::{CoinChoice, GameType, Winner};
    use crate::games::vrf_engine::SchnorrkelOracle;
    use crate::ledger::FaultyLedger;
    use crate::scheduler::{FundSlotRequest, LiquidityScheduler, PlayerQueue, SlotRegistry};
    use crate::session::CreateSessionRequest;
    use std::time::Duration;

    struct Fixture {
        engine: SecureGameEngine,
        lifecycle: Arc<SessionLifecycleManager>,
        risk: Arc<RiskMonitor>,
        ledger: Arc<FaultyLedger>,
        clock: Arc<ManualClock>,
    }

    fn fixture(game_type: GameType, rounds: u32, slots_count: usize) -> Fixture {
        let config = Arc::new(HouseConfig::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let metrics = Arc::new(MetricsRegistry::new());
        let ledger = Arc::new(FaultyLedger::new());
        ledger.deposit("p1", &Token::sol(), 1_000);
        let slots = Arc::new(SlotRegistry::new(clock.clone()));
        for i in 0..slots_count {
            slots
                .fund_slot(FundSlotRequest {
                    owner_id: format!("o{}", i),
                    game_type,
                    token: Token::sol(),
                    amount: 50_000,
                    rounds_per_session: rounds,
                    safety_multiplier: 2,
                    max_single_payout: 500,
                })
                .unwrap();
        }
        let scheduler = Arc::new(LiquidityScheduler::new(slots, config.clone(), clock.clone(), metrics.clone()));
        let queue = Arc::new(PlayerQueue::new(
            ledger.clone(),
            clock.clone(),
            config.queue_entry_ttl(),
            config.queue.max_stale_skips,
            metrics.clone(),
        ));
        let codec = Arc::new(SignedStateCodec::new(&config.engine.hmac_secret, config.envelope_max_age()));
        let lifecycle = Arc::new(SessionLifecycleManager::new(
            scheduler,
            queue,
            ledger.clone(),
            codec,
            clock.clone(),
            metrics.clone(),
            config.clone(),
        ));
        let randomness = Arc::new(RandomnessSource::new(
            Arc::new(SchnorrkelOracle::new_random()),
            Duration::from_secs(2),
            metrics.clone(),
        ));
        let risk = Arc::new(RiskMonitor::new(
            config.engine.risk_score_per_violation,
            config.engine.risk_flag_threshold,
            metrics.clone(),
        ));
        let engine = SecureGameEngine::new(
            lifecycle.clone(),
            randomness,
            risk.clone(),
            clock.clone(),
            metrics,
            config,
        );
        Fixture {
            engine,
            lifecycle,
            risk,
            ledger,
            clock,
        }
    }

    async fn start(f: &Fixture, game_type: GameType) -> GameSession {
        let created = f
            .lifecycle
            .create(CreateSessionRequest {
                player_id: "p1".to_string(),
                game_type,
                token: Token::sol(),
                bet_amount: 100,
                third_party_id: None,
            })
            .await
            .unwrap();
        f.lifecycle.get(&created.session_id).unwrap()
    }

    fn request(session: &GameSession, action: GameAction) -> MoveRequest {
        MoveRequest {
            player_id: session.player_id.clone(),
            action,
            envelope: session.envelope.clone().unwrap(),
            claimed_result: None,
        }
    }

    #[tokio::test]
    async fn test_coin_flip_settles_from_server_state() {
        let f = fixture(GameType::CoinFlip, 5, 1);
        let session = start(&f, GameType::CoinFlip).await;

        let outcome = f
            .engine
            .submit_move(&session.id, request(&session, GameAction::Flip { choice: CoinChoice::Heads }))
            .await
            .unwrap();
        assert!(outcome.terminal);
        let result = outcome.result.unwrap();

        let done = f.lifecycle.get(&session.id).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.result, Some(result));
        assert_eq!(done.rounds_played, 1);
        assert!(done.audit_trail.iter().any(|a| a.action == "flip:heads" && a.randomness_used.is_some()));

        let expected = match result.winner {
            Winner::Player => 1_100,
            _ => 900,
        };
        assert_eq!(f.ledger.balance("p1", &Token::sol()), expected);
        assert!(f.lifecycle.scheduler().slots().holding(&session.id).is_none());
    }

    #[tokio::test]
    async fn test_tampered_envelope_refused_without_state_change() {
        let f = fixture(GameType::Blackjack, 5, 1);
        let session = start(&f, GameType::Blackjack).await;
        let dealt = f
            .engine
            .submit_move(&session.id, request(&session, GameAction::Deal))
            .await
            .unwrap();
        if dealt.terminal {
            // Natural on the deal; nothing left to tamper with
            return;
        }
        let before = f.lifecycle.get(&session.id).unwrap();

        let mut forged = dealt.envelope.clone();
        forged.data["state"]["player_hand"] = serde_json::json!([
            {"rank": 1, "suit": "spades"},
            {"rank": 13, "suit": "hearts"}
        ]);
        let err = f
            .engine
            .submit_move(
                &session.id,
                MoveRequest {
                    player_id: "p1".to_string(),
                    action: GameAction::Stand,
                    envelope: forged,
                    claimed_result: None,
                },
            )
            .await
            .unwrap_err();

        match err {
            HouseError::Integrity(v) => {
                assert_eq!(v.kind, IntegrityKind::SignatureMismatch);
                assert_eq!(v.current.as_ref(), before.envelope.as_ref());
            }
            other => panic!("unexpected error {:?}", other),
        }
        let after = f.lifecycle.get(&session.id).unwrap();
        assert_eq!(after.game_state, before.game_state);
        assert_eq!(after.envelope_nonce, before.envelope_nonce);
        assert_eq!(f.risk.profile("p1").violations, 1);
    }

    #[tokio::test]
    async fn test_replayed_envelope_refused() {
        let f = fixture(GameType::Blackjack, 5, 1);
        let session = start(&f, GameType::Blackjack).await;
        let dealt = f
            .engine
            .submit_move(&session.id, request(&session, GameAction::Deal))
            .await
            .unwrap();
        if dealt.terminal {
            return;
        }

        let err = f
            .engine
            .submit_move(&session.id, request(&session, GameAction::Stand))
            .await
            .unwrap_err();
        assert!(matches!(err, HouseError::Integrity(ref v) if v.kind == IntegrityKind::ReplayedEnvelope));
    }

    #[tokio::test]
    async fn test_stale_envelope_refused() {
        let f = fixture(GameType::CoinFlip, 5, 1);
        let session = start(&f, GameType::CoinFlip).await;
        f.clock.advance(Duration::from_secs(301));

        let err = f
            .engine
            .submit_move(&session.id, request(&session, GameAction::Flip { choice: CoinChoice::Tails }))
            .await
            .unwrap_err();
        assert!(matches!(err, HouseError::Integrity(ref v) if v.kind == IntegrityKind::StaleEnvelope));
        assert_eq!(f.lifecycle.get(&session.id).unwrap().status, SessionStatus::InProgress);
    }

    #[tokio::test]
    async fn test_illegal_action_is_validation_error() {
        let f = fixture(GameType::Blackjack, 5, 1);
        let session = start(&f, GameType::Blackjack).await;

        let err = f
            .engine
            .submit_move(&session.id, request(&session, GameAction::Hit))
            .await
            .unwrap_err();
        assert!(matches!(err, HouseError::Validation(_)));
        let after = f.lifecycle.get(&session.id).unwrap();
        assert_eq!(after.envelope_nonce, 0);
        assert_eq!(after.rounds_played, 0);
        assert_eq!(f.risk.profile("p1").violations, 0);
    }

    #[tokio::test]
    async fn test_forged_claim_is_voided() {
        let f = fixture(GameType::CoinFlip, 5, 1);
        let session = start(&f, GameType::CoinFlip).await;

        let mut req = request(&session, GameAction::Flip { choice: CoinChoice::Heads });
        req.claimed_result = Some(ClaimedResult {
            winner: Winner::Player,
            player_payout: Some(1_000_000),
        });
        let outcome = f.engine.submit_move(&session.id, req).await.unwrap();
        assert!(outcome.claim_voided);
        assert!(outcome.result.unwrap().player_payout <= 200);
        assert_eq!(f.risk.profile("p1").violations, 1);
    }

    #[tokio::test]
    async fn test_committed_move_returned_when_payout_fails() {
        let f = fixture(GameType::CoinFlip, 5, 1);
        let session = start(&f, GameType::CoinFlip).await;
        f.ledger.refuse_credits.store(true, std::sync::atomic::Ordering::SeqCst);

        let outcome = f
            .engine
            .submit_move(&session.id, request(&session, GameAction::Flip { choice: CoinChoice::Heads }))
            .await
            .unwrap();
        assert!(outcome.terminal);
        assert_eq!(outcome.envelope.nonce, 1);

        let done = f.lifecycle.get(&session.id).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.envelope.as_ref(), Some(&outcome.envelope));
        assert!(f.lifecycle.scheduler().slots().holding(&session.id).is_none());
        if outcome.result.unwrap().winner == Winner::Player {
            assert!(done.audit_trail.iter().any(|a| a.action == "payout_failed"));
            assert_eq!(f.ledger.balance("p1", &Token::sol()), 900);
        }
        assert_eq!(f.risk.profile("p1").violations, 0);
    }

    #[tokio::test]
    async fn test_wrong_player_refused() {
        let f = fixture(GameType::CoinFlip, 5, 1);
        let session = start(&f, GameType::CoinFlip).await;
        let mut req = request(&session, GameAction::Flip { choice: CoinChoice::Heads });
        req.player_id = "intruder".to_string();

        let err = f.engine.submit_move(&session.id, req).await.unwrap_err();
        assert!(matches!(err, HouseError::Integrity(ref v) if v.kind == IntegrityKind::WrongPlayer && v.current.is_none()));
    }

    #[tokio::test]
    async fn test_blackjack_rounds_rotate_slots() {
        let f = fixture(GameType::Blackjack, 1, 2);
        let session = start(&f, GameType::Blackjack).await;
        let first_slot = session.liquidity_slot_id.clone().unwrap();

        let dealt = f
            .engine
            .submit_move(&session.id, request(&session, GameAction::Deal))
            .await
            .unwrap();
        if dealt.terminal {
            return;
        }

        let moved = f.lifecycle.get(&session.id).unwrap();
        let now_on = moved.liquidity_slot_id.clone().unwrap();
        assert_ne!(now_on, first_slot);
        assert!(f.lifecycle.scheduler().slots().get(&first_slot).unwrap().is_idle());
        assert_eq!(
            f.lifecycle.scheduler().progress(&session.id).unwrap().rounds_used,
            0
        );
    }

    #[test]
    fn test_check_legal() {
        let bj = GameState::initial(GameType::Blackjack);
        assert!(check_legal(&bj, GameAction::Deal).is_ok());
        assert!(check_legal(&bj, GameAction::Stand).is_err());
        assert!(check_legal(&bj, GameAction::Flip { choice: CoinChoice::Heads }).is_err());
    }
}
