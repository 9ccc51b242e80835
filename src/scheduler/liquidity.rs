//! Admission control and slot rotation
//!
//! Every reservation change is one conditional update on the slot
//! document. A candidate list is only a hint: the claim re-checks that the
//! slot is still active, idle and funded, so two tasks racing for the same
//! slot cannot both win.

use crate::common::clock::{millis_after, Clock};
use crate::common::types::{staged_session_id, Token, STAGED_SUFFIX};
use crate::config::HouseConfig;
use crate::errors::{HouseError, HouseResult, StoreError};
use crate::games::types::{GameResult, GameType};
use crate::metrics::MetricsRegistry;
use crate::scheduler::slots::{LiquiditySlot, SlotRegistry, SlotStatus};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Round usage of the slot backing a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundProgress {
    pub rounds_used: u32,
    pub rounds_per_session: u32,
}

impl RoundProgress {
    pub fn exhausted(&self) -> bool {
        self.rounds_used >= self.rounds_per_session
    }

    pub fn remaining(&self) -> u32 {
        self.rounds_per_session.saturating_sub(self.rounds_used)
    }
}

pub struct LiquidityScheduler {
    slots: Arc<SlotRegistry>,
    config: Arc<HouseConfig>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
}

impl LiquidityScheduler {
    pub fn new(
        slots: Arc<SlotRegistry>,
        config: Arc<HouseConfig>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            slots,
            config,
            clock,
            metrics,
        }
    }

    pub fn slots(&self) -> &Arc<SlotRegistry> {
        &self.slots
    }

    /// Hold the first qualifying slot for `session_id`.
    ///
    /// Candidates are tried by queue position, then least recently used.
    /// Returns `None` when no slot qualifies; the caller enqueues.
    pub fn reserve(
        &self,
        session_id: &str,
        game_type: GameType,
        token: &Token,
        bet_amount: u64,
    ) -> HouseResult<Option<LiquiditySlot>> {
        self.reserve_seeded(session_id, game_type, token, bet_amount, 0)
    }

    fn reserve_seeded(
        &self,
        session_id: &str,
        game_type: GameType,
        token: &Token,
        bet_amount: u64,
        rounds_used: u32,
    ) -> HouseResult<Option<LiquiditySlot>> {
        if let Some(existing) = self.slots.holding(session_id) {
            return Err(HouseError::Validation(format!(
                "session {} is already held by slot {}",
                session_id, existing.id
            )));
        }

        let worst_case = self.config.payouts.worst_case_payout(game_type, bet_amount);
        let mut candidates = self.slots.store().find(|s| {
            s.game_type == game_type && s.token.symbol == token.symbol && s.can_back(bet_amount, worst_case)
        });
        candidates.sort_by_key(|s| (s.queue_position, s.last_used_at));

        let now = self.clock.now_millis();
        let expires_at = millis_after(now, self.config.session_window());

        for candidate in candidates {
            let claimed = self.slots.store().update_if(
                &candidate.id,
                |s| s.can_back(bet_amount, worst_case),
                |s| {
                    s.current_session_id = Some(session_id.to_string());
                    s.locked_funds = s.locked_funds.saturating_add(worst_case);
                    s.reserved_bet = bet_amount;
                    s.session_rounds_used = rounds_used;
                    s.session_expires_at = Some(expires_at);
                    s.next_slot_queued = false;
                    s.last_used_at = now;
                },
            );

            match claimed {
                Ok(slot) => {
                    self.metrics.record_reserve();
                    debug!(
                        slot_id = %slot.id,
                        session_id,
                        bet_amount,
                        locked = slot.locked_funds,
                        "slot reserved"
                    );
                    return Ok(Some(slot));
                }
                Err(StoreError::ConditionFailed(_)) | Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        debug!(session_id, %game_type, token = %token, bet_amount, "no slot qualifies");
        Ok(None)
    }

    /// Count one round against the slot holding `session_id`
    pub fn record_round(&self, session_id: &str) -> HouseResult<RoundProgress> {
        let slot = self
            .slots
            .holding(session_id)
            .ok_or_else(|| HouseError::not_found("slot for session", session_id))?;

        let slot = self
            .slots
            .store()
            .update_if(
                &slot.id,
                |s| s.current_session_id.as_deref() == Some(session_id),
                |s| s.session_rounds_used = s.session_rounds_used.saturating_add(1),
            )?;

        Ok(RoundProgress {
            rounds_used: slot.session_rounds_used,
            rounds_per_session: slot.rounds_per_session,
        })
    }

    pub fn progress(&self, session_id: &str) -> Option<RoundProgress> {
        self.slots.holding(session_id).map(|s| RoundProgress {
            rounds_used: s.session_rounds_used,
            rounds_per_session: s.rounds_per_session,
        })
    }

    /// Stage the next slot once the current one passes the usage threshold.
    ///
    /// The current slot's `next_slot_queued` flag is claimed first so only
    /// one caller stages; it is handed back if no candidate exists.
    pub fn pre_stage_next(&self, session_id: &str) -> HouseResult<Option<LiquiditySlot>> {
        let Some(current) = self.slots.holding(session_id) else {
            return Ok(None);
        };

        let threshold = self.config.scheduler.pre_stage_threshold_pct as u64;
        let used = current.session_rounds_used as u64 * 100;
        if current.next_slot_queued || used < threshold * current.rounds_per_session as u64 {
            return Ok(None);
        }

        let flagged = self.slots.store().update_if(
            &current.id,
            |s| s.current_session_id.as_deref() == Some(session_id) && !s.next_slot_queued,
            |s| s.next_slot_queued = true,
        );
        match flagged {
            Ok(_) => {}
            Err(StoreError::ConditionFailed(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let staged_id = staged_session_id(session_id);
        let staged = self.reserve(&staged_id, current.game_type, &current.token, current.reserved_bet)?;

        match staged {
            Some(slot) => {
                self.metrics.record_pre_stage();
                info!(session_id, current_slot = %current.id, staged_slot = %slot.id, "next slot staged");
                Ok(Some(slot))
            }
            None => {
                let _ = self.slots.store().update_if(
                    &current.id,
                    |s| s.current_session_id.as_deref() == Some(session_id),
                    |s| s.next_slot_queued = false,
                );
                debug!(session_id, "no slot available to stage");
                Ok(None)
            }
        }
    }

    /// Move a session onto its staged slot, releasing the exhausted one.
    /// The game is counted once, on whichever slot settles it.
    pub fn transition(&self, session_id: &str) -> HouseResult<LiquiditySlot> {
        let staged_id = staged_session_id(session_id);
        let staged = self.slots.holding(&staged_id).ok_or_else(|| {
            HouseError::Infrastructure(format!("no staged slot for session {}", session_id))
        })?;

        if let Some(current) = self.slots.holding(session_id) {
            self.slots.store().update_if(
                &current.id,
                |s| s.current_session_id.as_deref() == Some(session_id),
                |s| s.clear_hold(),
            )?;
        }

        let expires_at = millis_after(self.clock.now_millis(), self.config.session_window());
        let promoted = self.slots.store().update_if(
            &staged.id,
            |s| s.current_session_id.as_deref() == Some(staged_id.as_str()),
            |s| {
                s.current_session_id = Some(session_id.to_string());
                s.session_rounds_used = 0;
                s.next_slot_queued = false;
                s.session_expires_at = Some(expires_at);
            },
        )?;

        self.metrics.record_transition();
        info!(session_id, slot_id = %promoted.id, "session transitioned to staged slot");
        Ok(promoted)
    }

    /// Fail the slot holding `session_id` and re-home the session.
    ///
    /// The replacement starts at `carry_over_rounds` so the round budget
    /// survives the failover. Errors when no replacement exists; the
    /// caller must then time the session out.
    pub fn migrate(&self, session_id: &str, carry_over_rounds: u32) -> HouseResult<LiquiditySlot> {
        let failing = self
            .slots
            .holding(session_id)
            .ok_or_else(|| HouseError::not_found("slot for session", session_id))?;

        self.slots.store().update_if(
            &failing.id,
            |s| s.current_session_id.as_deref() == Some(session_id),
            |s| {
                s.status = SlotStatus::Failed;
                s.clear_hold();
            },
        )?;
        warn!(session_id, slot_id = %failing.id, "slot failed, migrating session");

        let replacement = match self.reserve_seeded(
            session_id,
            failing.game_type,
            &failing.token,
            failing.reserved_bet,
            carry_over_rounds,
        )? {
            Some(slot) => Some(slot),
            None => self.promote_staged(session_id, carry_over_rounds)?,
        };

        let Some(slot) = replacement else {
            self.metrics.record_migration(false);
            error!(session_id, failed_slot = %failing.id, "no replacement slot for migration");
            return Err(HouseError::Infrastructure(format!(
                "no replacement liquidity for session {}",
                session_id
            )));
        };

        // A slot already staged for this session keeps its role
        let slot = if self.slots.holding(&staged_session_id(session_id)).is_some() {
            self.slots
                .store()
                .update_if(&slot.id, |_| true, |s| s.next_slot_queued = true)?
        } else {
            slot
        };

        self.metrics.record_migration(true);
        info!(
            session_id,
            failed_slot = %failing.id,
            slot_id = %slot.id,
            rounds_used = slot.session_rounds_used,
            "session migrated"
        );
        Ok(slot)
    }

    fn promote_staged(&self, session_id: &str, rounds_used: u32) -> HouseResult<Option<LiquiditySlot>> {
        let staged_id = staged_session_id(session_id);
        let Some(staged) = self.slots.holding(&staged_id) else {
            return Ok(None);
        };
        let promoted = self.slots.store().update_if(
            &staged.id,
            |s| s.current_session_id.as_deref() == Some(staged_id.as_str()),
            |s| {
                s.current_session_id = Some(session_id.to_string());
                s.session_rounds_used = rounds_used;
                s.next_slot_queued = false;
            },
        )?;
        Ok(Some(promoted))
    }

    /// Mark a slot failed when it backs no live session: idle, or only
    /// holding a pre-staged reservation. A staged reservation is dropped and
    /// the slot it was staged behind may stage again.
    pub fn retire(&self, slot_id: &str) -> HouseResult<LiquiditySlot> {
        let slot = self.slots.get(slot_id)?;
        let staged_for = slot
            .current_session_id
            .as_deref()
            .and_then(|sid| sid.strip_suffix(STAGED_SUFFIX))
            .map(str::to_string);

        if !slot.is_idle() && staged_for.is_none() {
            return Err(HouseError::Validation(format!(
                "slot {} backs a live session, migrate it instead",
                slot_id
            )));
        }

        let held = slot.current_session_id.clone();
        let retired = self.slots.store().update_if(
            slot_id,
            |s| s.current_session_id == held,
            |s| {
                s.status = SlotStatus::Failed;
                s.clear_hold();
            },
        )?;

        if let Some(owner_session) = staged_for {
            if let Some(current) = self.slots.holding(&owner_session) {
                let _ = self.slots.store().update_if(
                    &current.id,
                    |s| s.current_session_id.as_deref() == Some(owner_session.as_str()),
                    |s| s.next_slot_queued = false,
                );
            }
        }

        warn!(slot_id, "slot retired as failed");
        Ok(retired)
    }

    /// Settle a finished session against its slot and free the slot and
    /// any slot staged behind it.
    ///
    /// When no slot holds the session any more (it failed mid-game), the
    /// settlement is booked against `fallback_slot_id` without touching
    /// its status.
    pub fn release(
        &self,
        session_id: &str,
        fallback_slot_id: Option<&str>,
        settlement: Option<(u64, GameResult)>,
    ) -> HouseResult<Option<LiquiditySlot>> {
        let staged_id = staged_session_id(session_id);
        if let Some(staged) = self.slots.holding(&staged_id) {
            let _ = self.slots.store().update_if(
                &staged.id,
                |s| s.current_session_id.as_deref() == Some(staged_id.as_str()),
                |s| s.clear_hold(),
            );
            debug!(session_id, slot_id = %staged.id, "staged slot released");
        }

        let book = |s: &mut LiquiditySlot| {
            if let Some((bet, result)) = settlement.as_ref() {
                let bet = *bet;
                s.games_played += 1;
                if result.player_payout >= bet {
                    let loss = result.player_payout - bet;
                    s.total_funds = s.total_funds.saturating_sub(loss);
                    s.total_losses = s.total_losses.saturating_add(loss);
                } else {
                    let win = bet - result.player_payout;
                    s.total_funds = s.total_funds.saturating_add(win);
                    s.total_winnings = s.total_winnings.saturating_add(win);
                }
            }
        };

        if let Some(slot) = self.slots.holding(session_id) {
            let released = self.slots.store().update_if(
                &slot.id,
                |s| s.current_session_id.as_deref() == Some(session_id),
                |s| {
                    book(s);
                    s.clear_hold();
                },
            )?;
            debug!(session_id, slot_id = %released.id, funds = released.total_funds, "slot released");
            return Ok(Some(released));
        }

        match fallback_slot_id {
            Some(slot_id) if settlement.is_some() => {
                let booked = self.slots.store().update_if(slot_id, |_| true, book)?;
                Ok(Some(booked))
            }
            _ => Ok(None),
        }
    }

    /// Post-settlement rotation for a partition.
    ///
    /// Idle slots that fell below their minimum funding leave rotation.
    /// Returns how many idle, active slots remain for queued players.
    pub fn rotate(&self, game_type: GameType, token: &Token) -> usize {
        let idle = self.slots.store().find(|s| {
            s.game_type == game_type
                && s.token.symbol == token.symbol
                && s.status == SlotStatus::Active
                && s.is_idle()
        });

        let mut available = 0;
        for slot in idle {
            if slot.is_funded() {
                available += 1;
                continue;
            }
            let deactivated = self.slots.store().update_if(
                &slot.id,
                |s| s.is_idle() && s.status == SlotStatus::Active && !s.is_funded(),
                |s| s.status = SlotStatus::Inactive,
            );
            if deactivated.is_ok() {
                warn!(
                    slot_id = %slot.id,
                    funds = slot.total_funds,
                    minimum = slot.minimum_funds(),
                    "slot below minimum funding, leaving rotation"
                );
            }
        }
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::games::types::Winner;
    use crate::scheduler::slots::FundSlotRequest;

    struct Fixture {
        scheduler: Arc<LiquidityScheduler>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let slots = Arc::new(SlotRegistry::new(clock.clone()));
        let scheduler = Arc::new(LiquidityScheduler::new(
            slots,
            Arc::new(HouseConfig::default()),
            clock.clone(),
            Arc::new(MetricsRegistry::new()),
        ));
        Fixture { scheduler, clock }
    }

    fn fund(f: &Fixture, owner: &str, amount: u64, rounds: u32) -> LiquiditySlot {
        f.scheduler
            .slots()
            .fund_slot(FundSlotRequest {
                owner_id: owner.to_string(),
                game_type: GameType::CoinFlip,
                token: Token::sol(),
                amount,
                rounds_per_session: rounds,
                safety_multiplier: 10,
                max_single_payout: 1_000,
            })
            .unwrap()
    }

    #[test]
    fn test_reserve_locks_worst_case() {
        let f = fixture();
        let slot = fund(&f, "o1", 1_000, 10);

        let held = f
            .scheduler
            .reserve("s1", GameType::CoinFlip, &Token::sol(), 80)
            .unwrap()
            .unwrap();
        assert_eq!(held.id, slot.id);
        assert_eq!(held.current_session_id.as_deref(), Some("s1"));
        assert_eq!(held.locked_funds, 160);

        assert!(f
            .scheduler
            .reserve("s2", GameType::CoinFlip, &Token::sol(), 80)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reserve_requires_safety_margin() {
        let f = fixture();
        fund(&f, "o1", 1_000, 10);
        assert!(f
            .scheduler
            .reserve("s1", GameType::CoinFlip, &Token::sol(), 101)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reserve_order_position_then_lru() {
        let f = fixture();
        let first = fund(&f, "o1", 10_000, 10);
        let second = fund(&f, "o2", 10_000, 10);

        let a = f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).unwrap().unwrap();
        assert_eq!(a.id, first.id);
        let b = f.scheduler.reserve("s2", GameType::CoinFlip, &Token::sol(), 10).unwrap().unwrap();
        assert_eq!(b.id, second.id);
    }

    #[test]
    fn test_same_session_cannot_hold_two_slots() {
        let f = fixture();
        fund(&f, "o1", 10_000, 10);
        fund(&f, "o2", 10_000, 10);
        f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).unwrap();
        assert!(f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).is_err());
    }

    #[test]
    fn test_pre_stage_at_threshold_is_idempotent() {
        let f = fixture();
        let current = fund(&f, "o1", 10_000, 5);
        let spare = fund(&f, "o2", 10_000, 5);
        f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).unwrap();

        for _ in 0..3 {
            f.scheduler.record_round("s1").unwrap();
        }
        assert!(f.scheduler.pre_stage_next("s1").unwrap().is_none());

        f.scheduler.record_round("s1").unwrap();
        let staged = f.scheduler.pre_stage_next("s1").unwrap().unwrap();
        assert_eq!(staged.id, spare.id);
        assert_eq!(staged.current_session_id.as_deref(), Some("s1_next"));
        assert!(f.scheduler.slots().get(&current.id).unwrap().next_slot_queued);

        assert!(f.scheduler.pre_stage_next("s1").unwrap().is_none());
    }

    #[test]
    fn test_pre_stage_without_candidate_reverts_flag() {
        let f = fixture();
        let current = fund(&f, "o1", 10_000, 1);
        f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).unwrap();
        f.scheduler.record_round("s1").unwrap();

        assert!(f.scheduler.pre_stage_next("s1").unwrap().is_none());
        assert!(!f.scheduler.slots().get(&current.id).unwrap().next_slot_queued);
    }

    #[test]
    fn test_transition_promotes_staged_slot() {
        let f = fixture();
        let current = fund(&f, "o1", 10_000, 2);
        let spare = fund(&f, "o2", 10_000, 2);
        f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).unwrap();
        f.scheduler.record_round("s1").unwrap();
        f.scheduler.record_round("s1").unwrap();
        f.scheduler.pre_stage_next("s1").unwrap().unwrap();

        let promoted = f.scheduler.transition("s1").unwrap();
        assert_eq!(promoted.id, spare.id);
        assert_eq!(promoted.current_session_id.as_deref(), Some("s1"));
        assert_eq!(promoted.session_rounds_used, 0);

        let old = f.scheduler.slots().get(&current.id).unwrap();
        assert!(old.is_idle());
        assert_eq!(old.locked_funds, 0);
        assert_eq!(old.games_played, 0);

        let win = GameResult { winner: Winner::Player, player_payout: 20, house_payout: 0 };
        let settled = f.scheduler.release("s1", Some(&spare.id), Some((10, win))).unwrap().unwrap();
        assert_eq!(settled.id, spare.id);
        assert_eq!(settled.games_played, 1);
        assert_eq!(f.scheduler.slots().get(&current.id).unwrap().games_played, 0);
    }

    #[test]
    fn test_transition_without_staged_slot_fails() {
        let f = fixture();
        fund(&f, "o1", 10_000, 2);
        f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).unwrap();
        assert!(matches!(f.scheduler.transition("s1"), Err(HouseError::Infrastructure(_))));
    }

    #[test]
    fn test_migrate_carries_rounds() {
        let f = fixture();
        let failing = fund(&f, "o1", 10_000, 10);
        let replacement = fund(&f, "o2", 10_000, 10);
        f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).unwrap();
        for _ in 0..3 {
            f.scheduler.record_round("s1").unwrap();
        }

        let slot = f.scheduler.migrate("s1", 3).unwrap();
        assert_eq!(slot.id, replacement.id);
        assert_eq!(slot.session_rounds_used, 3);
        assert_eq!(f.scheduler.slots().get(&failing.id).unwrap().status, SlotStatus::Failed);

        let progress = f.scheduler.record_round("s1").unwrap();
        assert_eq!(progress.rounds_used, 4);
    }

    #[test]
    fn test_migrate_without_replacement_errors() {
        let f = fixture();
        fund(&f, "o1", 10_000, 10);
        f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).unwrap();
        assert!(matches!(f.scheduler.migrate("s1", 0), Err(HouseError::Infrastructure(_))));
        assert!(f.scheduler.slots().holding("s1").is_none());
    }

    #[test]
    fn test_retire_staged_slot_frees_flag() {
        let f = fixture();
        let current = fund(&f, "o1", 10_000, 1);
        let spare = fund(&f, "o2", 10_000, 1);
        f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 10).unwrap();
        f.scheduler.record_round("s1").unwrap();
        f.scheduler.pre_stage_next("s1").unwrap().unwrap();

        assert!(f.scheduler.retire(&current.id).is_err());
        let retired = f.scheduler.retire(&spare.id).unwrap();
        assert_eq!(retired.status, SlotStatus::Failed);
        assert!(retired.is_idle());
        assert!(!f.scheduler.slots().get(&current.id).unwrap().next_slot_queued);
    }

    #[test]
    fn test_release_books_settlement() {
        let f = fixture();
        let slot = fund(&f, "o1", 10_000, 10);
        f.scheduler.reserve("s1", GameType::CoinFlip, &Token::sol(), 100).unwrap();

        let win = GameResult { winner: Winner::Player, player_payout: 200, house_payout: 0 };
        let released = f.scheduler.release("s1", Some(&slot.id), Some((100, win))).unwrap().unwrap();
        assert_eq!(released.total_funds, 9_900);
        assert_eq!(released.total_losses, 100);
        assert_eq!(released.games_played, 1);
        assert!(released.is_idle());

        f.clock.advance(std::time::Duration::from_secs(1));
        f.scheduler.reserve("s2", GameType::CoinFlip, &Token::sol(), 100).unwrap();
        let loss = GameResult { winner: Winner::House, player_payout: 0, house_payout: 100 };
        let released = f.scheduler.release("s2", None, Some((100, loss))).unwrap().unwrap();
        assert_eq!(released.total_funds, 10_000);
        assert_eq!(released.total_winnings, 100);
    }

    #[test]
    fn test_rotate_retires_underfunded_slots() {
        let f = fixture();
        let rich = fund(&f, "o1", 200_000, 10);
        let poor = fund(&f, "o2", 1_000, 10);

        assert_eq!(f.scheduler.rotate(GameType::CoinFlip, &Token::sol()), 1);
        assert_eq!(f.scheduler.slots().get(&rich.id).unwrap().status, SlotStatus::Active);
        assert_eq!(f.scheduler.slots().get(&poor.id).unwrap().status, SlotStatus::Inactive);
    }
}
