//! Service container
//!
//! Wires the scheduler components around injected collaborators and exposes
//! the operations the transport layer binds to.

use crate::common::clock::Clock;
use crate::common::traits::{BalanceLedger, LeaseLock, VrfOracle};
use crate::common::types::{PartitionKey, Token, STAGED_SUFFIX};
use crate::config::HouseConfig;
use crate::errors::{HouseError, HouseResult, IntegrityKind, IntegrityViolation};
use crate::games::codec::{SignedStateCodec, SignedStateEnvelope};
use crate::games::engine::{MoveOutcome, MoveRequest, SecureGameEngine};
use crate::games::randomness::RandomnessSource;
use crate::metrics::MetricsRegistry;
use crate::scheduler::{FundSlotRequest, LiquidityScheduler, LiquiditySlot, PlayerQueue, SlotRegistry};
use crate::security::{RiskMonitor, RiskProfile};
use crate::session::{
    ConnectionRecoveryMonitor, CreateSessionRequest, CreateSessionResponse, EvaluationReport, GameSession,
    HeartbeatAck, RecoveryOutcome, SessionLifecycleManager, SessionStatus, SweepReport,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// External capabilities the service consumes
#[derive(Clone)]
pub struct HouseDeps {
    pub ledger: Arc<dyn BalanceLedger>,
    pub lease: Arc<dyn LeaseLock>,
    pub oracle: Arc<dyn VrfOracle>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotFailureOutcome {
    pub slot_id: String,
    pub session_id: Option<String>,
    pub migrated_to: Option<String>,
    pub timed_out: bool,
}

pub struct HouseService {
    config: Arc<HouseConfig>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    lease: Arc<dyn LeaseLock>,
    slots: Arc<SlotRegistry>,
    scheduler: Arc<LiquidityScheduler>,
    queue: Arc<PlayerQueue>,
    lifecycle: Arc<SessionLifecycleManager>,
    monitor: Arc<ConnectionRecoveryMonitor>,
    engine: Arc<SecureGameEngine>,
    risk: Arc<RiskMonitor>,
}

impl HouseService {
    pub fn new(config: HouseConfig, deps: HouseDeps) -> HouseResult<Self> {
        config.validate().map_err(|e| HouseError::Config(e.to_string()))?;
        let config = Arc::new(config);
        let metrics = Arc::new(MetricsRegistry::new());
        let clock = deps.clock;

        let slots = Arc::new(SlotRegistry::new(clock.clone()));
        let scheduler = Arc::new(LiquidityScheduler::new(
            slots.clone(),
            config.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let queue = Arc::new(PlayerQueue::new(
            deps.ledger.clone(),
            clock.clone(),
            config.queue_entry_ttl(),
            config.queue.max_stale_skips,
            metrics.clone(),
        ));
        let codec = Arc::new(SignedStateCodec::new(
            &config.engine.hmac_secret,
            config.envelope_max_age(),
        ));
        let lifecycle = Arc::new(SessionLifecycleManager::new(
            scheduler.clone(),
            queue.clone(),
            deps.ledger,
            codec,
            clock.clone(),
            metrics.clone(),
            config.clone(),
        ));
        let monitor = Arc::new(ConnectionRecoveryMonitor::new(
            lifecycle.clone(),
            clock.clone(),
            metrics.clone(),
            config.heartbeat_interval(),
            config.connection.missed_heartbeats,
            config.recovery_window(),
        ));
        let risk = Arc::new(RiskMonitor::new(
            config.engine.risk_score_per_violation,
            config.engine.risk_flag_threshold,
            metrics.clone(),
        ));
        let randomness = Arc::new(RandomnessSource::new(
            deps.oracle,
            config.oracle_timeout(),
            metrics.clone(),
        ));
        let engine = Arc::new(SecureGameEngine::new(
            lifecycle.clone(),
            randomness,
            risk.clone(),
            clock.clone(),
            metrics.clone(),
            config.clone(),
        ));

        info!(instance_id = %config.maintenance.instance_id, "house service initialized");

        Ok(Self {
            config,
            clock,
            metrics,
            lease: deps.lease,
            slots,
            scheduler,
            queue,
            lifecycle,
            monitor,
            engine,
            risk,
        })
    }

    pub fn config(&self) -> &Arc<HouseConfig> {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn lease(&self) -> Arc<dyn LeaseLock> {
        Arc::clone(&self.lease)
    }

    pub fn slots(&self) -> Arc<SlotRegistry> {
        Arc::clone(&self.slots)
    }

    pub fn scheduler(&self) -> Arc<LiquidityScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn queue(&self) -> Arc<PlayerQueue> {
        Arc::clone(&self.queue)
    }

    pub fn lifecycle(&self) -> Arc<SessionLifecycleManager> {
        Arc::clone(&self.lifecycle)
    }

    pub fn monitor(&self) -> Arc<ConnectionRecoveryMonitor> {
        Arc::clone(&self.monitor)
    }

    // Player operations

    pub async fn create_session(&self, req: CreateSessionRequest) -> HouseResult<CreateSessionResponse> {
        self.lifecycle.create(req).await
    }

    pub async fn submit_move(&self, session_id: &str, req: MoveRequest) -> HouseResult<MoveOutcome> {
        self.engine.submit_move(session_id, req).await
    }

    pub fn heartbeat(&self, session_id: &str, player_id: &str) -> HouseResult<HeartbeatAck> {
        self.monitor.heartbeat(session_id, player_id)
    }

    pub async fn recover_session(
        &self,
        session_id: &str,
        player_id: &str,
        transport_id: &str,
    ) -> HouseResult<RecoveryOutcome> {
        self.monitor.recover(session_id, player_id, transport_id).await
    }

    /// Cancel on behalf of the owning player
    pub async fn cancel_session(&self, session_id: &str, player_id: &str) -> HouseResult<CancelResponse> {
        let session = self.owned_session(session_id, player_id)?;
        let cancelled = self.lifecycle.cancel(&session.id).await?;
        Ok(CancelResponse {
            session_id: cancelled.id,
            status: cancelled.status,
        })
    }

    pub fn get_session(&self, session_id: &str) -> HouseResult<GameSession> {
        self.lifecycle.get(session_id)
    }

    /// Latest signed state, for clients that lost theirs
    pub fn current_envelope(&self, session_id: &str, player_id: &str) -> HouseResult<SignedStateEnvelope> {
        self.owned_session(session_id, player_id)?
            .envelope
            .ok_or_else(|| HouseError::not_found("envelope", session_id))
    }

    fn owned_session(&self, session_id: &str, player_id: &str) -> HouseResult<GameSession> {
        let session = self.lifecycle.get(session_id)?;
        if session.player_id != player_id {
            let violation = IntegrityViolation {
                kind: IntegrityKind::WrongPlayer,
                session_id: session_id.to_string(),
                player_id: player_id.to_string(),
                current: None,
            };
            self.risk.record_violation(&violation);
            return Err(violation.into());
        }
        Ok(session)
    }

    pub fn risk_profile(&self, player_id: &str) -> RiskProfile {
        self.risk.profile(player_id)
    }

    // Owner operations

    pub fn fund_slot(&self, req: FundSlotRequest) -> HouseResult<LiquiditySlot> {
        self.slots.fund_slot(req)
    }

    pub async fn top_up(&self, slot_id: &str, owner_id: &str, amount: u64) -> HouseResult<LiquiditySlot> {
        let slot = self.slots.top_up(slot_id, owner_id, amount)?;
        // New capacity may admit queued players
        self.lifecycle.drain_queue(slot.game_type, &slot.token, 1).await?;
        self.slots.get(slot_id)
    }

    pub fn withdraw(&self, slot_id: &str, owner_id: &str) -> HouseResult<u64> {
        self.slots.withdraw(slot_id, owner_id)
    }

    pub fn get_slot(&self, slot_id: &str) -> HouseResult<LiquiditySlot> {
        self.slots.get(slot_id)
    }

    pub fn list_slots(&self, partition: &PartitionKey) -> Vec<LiquiditySlot> {
        self.slots.list(partition)
    }

    /// Take a slot out of rotation after an infrastructure failure.
    ///
    /// A live session on the slot is migrated with its round count; when no
    /// replacement exists the session is timed out.
    pub async fn report_slot_failure(&self, slot_id: &str) -> HouseResult<SlotFailureOutcome> {
        let slot = self.slots.get(slot_id)?;
        let live_session = slot
            .current_session_id
            .clone()
            .filter(|sid| !sid.ends_with(STAGED_SUFFIX));

        let Some(session_id) = live_session else {
            self.scheduler.retire(slot_id)?;
            return Ok(SlotFailureOutcome {
                slot_id: slot_id.to_string(),
                session_id: None,
                migrated_to: None,
                timed_out: false,
            });
        };

        match self.scheduler.migrate(&session_id, slot.session_rounds_used) {
            Ok(replacement) => {
                self.lifecycle.rebind_slot(&session_id, &replacement.id)?;
                Ok(SlotFailureOutcome {
                    slot_id: slot_id.to_string(),
                    session_id: Some(session_id),
                    migrated_to: Some(replacement.id),
                    timed_out: false,
                })
            }
            Err(HouseError::Infrastructure(reason)) => {
                error!(session_id = %session_id, slot_id, reason = %reason, "migration failed, timing out session");
                self.lifecycle.timeout(&session_id).await?;
                Ok(SlotFailureOutcome {
                    slot_id: slot_id.to_string(),
                    session_id: Some(session_id),
                    migrated_to: None,
                    timed_out: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    // Maintenance job bodies, run under leases by the workers

    pub async fn sweep_expired(&self) -> HouseResult<SweepReport> {
        self.lifecycle.sweep_expired(self.clock.now_millis()).await
    }

    /// Admit queued players in every partition that has waiting entries
    pub async fn drain_queues(&self) -> HouseResult<usize> {
        let mut admitted = 0;
        for partition in self.queue.waiting_partitions() {
            let token = Token::new(partition.token.clone());
            admitted += self
                .lifecycle
                .drain_queue(partition.game_type, &token, self.config.scheduler.drain_batch_limit)
                .await?;
        }
        Ok(admitted)
    }

    /// Stage follow-up slots for sessions nearing their round budget
    pub fn pre_stage_all(&self) -> usize {
        let mut staged = 0;
        for session in self.lifecycle.in_progress() {
            match self.scheduler.pre_stage_next(&session.id) {
                Ok(Some(_)) => staged += 1,
                Ok(None) => {}
                Err(e) => warn!(session_id = %session.id, error = %e, "pre-stage failed"),
            }
        }
        staged
    }

    pub async fn evaluate_connections(&self) -> HouseResult<EvaluationReport> {
        self.monitor.evaluate(self.clock.now_millis()).await
    }

    /// Prometheus exposition of counters plus current gauges
    pub fn metrics_text(&self) -> String {
        let in_progress = self.lifecycle.in_progress().len() as u64;
        let waiting: u64 = self
            .queue
            .waiting_partitions()
            .iter()
            .map(|p| self.queue.waiting_count(p.game_type, &Token::new(p.token.clone())) as u64)
            .sum();
        let active_partitions = self.slots.partitions().len() as u64;
        let flagged = self.risk.flagged_players().len() as u64;

        self.metrics.to_prometheus_format(&[
            ("sessions_in_progress", "Sessions currently holding liquidity", in_progress),
            ("queue_waiting", "Players waiting for liquidity", waiting),
            ("active_partitions", "Game/token partitions with active slots", active_partitions),
            ("flagged_players", "Players flagged by risk scoring", flagged),
        ])
    }

    pub fn shutdown(&self) {
        self.monitor.shutdown();
        info!("house service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::games::types::GameType;
    use crate::games::vrf_engine::SchnorrkelOracle;
    use crate::lease::InMemoryLeaseLock;
    use crate::ledger::InMemoryLedger;

    fn service() -> (HouseService, Arc<InMemoryLedger>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let ledger = Arc::new(InMemoryLedger::new());
        let deps = HouseDeps {
            ledger: ledger.clone(),
            lease: Arc::new(InMemoryLeaseLock::new(clock.clone())),
            oracle: Arc::new(SchnorrkelOracle::new_random()),
            clock,
        };
        (HouseService::new(HouseConfig::default(), deps).unwrap(), ledger)
    }

    fn slot_request(owner: &str) -> FundSlotRequest {
        FundSlotRequest {
            owner_id: owner.to_string(),
            game_type: GameType::CoinFlip,
            token: Token::sol(),
            amount: 50_000,
            rounds_per_session: 5,
            safety_multiplier: 2,
            max_single_payout: 500,
        }
    }

    fn bet(player: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            player_id: player.to_string(),
            game_type: GameType::CoinFlip,
            token: Token::sol(),
            bet_amount: 100,
            third_party_id: Some("partner-7".to_string()),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = HouseConfig::default();
        config.engine.hmac_secret = "short".to_string();
        let deps = HouseDeps {
            ledger: Arc::new(InMemoryLedger::new()),
            lease: Arc::new(InMemoryLeaseLock::new(clock.clone())),
            oracle: Arc::new(SchnorrkelOracle::new_random()),
            clock,
        };
        assert!(matches!(HouseService::new(config, deps), Err(HouseError::Config(_))));
    }

    #[tokio::test]
    async fn test_third_party_flag_persisted() {
        let (service, ledger) = service();
        service.fund_slot(slot_request("o1")).unwrap();
        ledger.deposit("p1", &Token::sol(), 1_000);

        let created = service.create_session(bet("p1")).await.unwrap();
        let session = service.get_session(&created.session_id).unwrap();
        assert!(session.is_third_party);
        assert_eq!(session.third_party_id.as_deref(), Some("partner-7"));
    }

    #[tokio::test]
    async fn test_cancel_requires_owner() {
        let (service, ledger) = service();
        ledger.deposit("p1", &Token::sol(), 1_000);
        let created = service.create_session(bet("p1")).await.unwrap();

        assert!(service.cancel_session(&created.session_id, "p2").await.is_err());
        assert_eq!(service.risk_profile("p2").violations, 1);
        let cancelled = service.cancel_session(&created.session_id, "p1").await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_slot_failure_migrates_or_times_out() {
        let (service, ledger) = service();
        let first = service.fund_slot(slot_request("o1")).unwrap();
        ledger.deposit("p1", &Token::sol(), 1_000);
        ledger.deposit("p2", &Token::sol(), 1_000);
        let a = service.create_session(bet("p1")).await.unwrap();

        let second = service.fund_slot(slot_request("o2")).unwrap();
        let outcome = service.report_slot_failure(&first.id).await.unwrap();
        assert_eq!(outcome.migrated_to.as_deref(), Some(second.id.as_str()));
        assert_eq!(
            service.get_session(&a.session_id).unwrap().liquidity_slot_id.as_deref(),
            Some(second.id.as_str())
        );

        let outcome = service.report_slot_failure(&second.id).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(service.get_session(&a.session_id).unwrap().status, SessionStatus::Timeout);
        assert_eq!(ledger.balance("p1", &Token::sol()), 1_000);
    }

    #[tokio::test]
    async fn test_top_up_admits_queued_player() {
        let (service, ledger) = service();
        ledger.deposit("p1", &Token::sol(), 1_000);
        let mut small = slot_request("o1");
        small.amount = 100;
        let slot = service.fund_slot(small).unwrap();

        let created = service.create_session(bet("p1")).await.unwrap();
        assert_eq!(created.status, SessionStatus::WaitingForHouse);

        service.top_up(&slot.id, "o1", 10_000).await.unwrap();
        assert_eq!(
            service.get_session(&created.session_id).unwrap().status,
            SessionStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_metrics_text_has_gauges() {
        let (service, ledger) = service();
        ledger.deposit("p1", &Token::sol(), 1_000);
        service.create_session(bet("p1")).await.unwrap();

        let text = service.metrics_text();
        assert!(text.contains("house_queue_waiting 1"));
        assert!(text.contains("house_sessions_created_total 1"));
    }
}
