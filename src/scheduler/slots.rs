//! Liquidity slot registry
//!
//! A slot is a funded house counterparty for one (game type, token)
//! partition. Owners fund, top up and withdraw slots here; reservation
//! state is only ever changed by the scheduler through conditional updates.

use crate::common::clock::Clock;
use crate::common::types::{new_id, PartitionKey, Token};
use crate::errors::{HouseError, HouseResult, StoreError};
use crate::games::types::GameType;
use crate::store::{Document, DocumentStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Active,
    Inactive,
    Failed,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotStatus::Active => write!(f, "active"),
            SlotStatus::Inactive => write!(f, "inactive"),
            SlotStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiquiditySlot {
    pub id: String,
    pub owner_id: String,
    pub game_type: GameType,
    pub token: Token,
    pub total_funds: u64,
    /// Worst-case payout backing the held session
    pub locked_funds: u64,
    pub rounds_per_session: u32,
    pub safety_multiplier: u32,
    pub max_single_payout: u64,
    pub queue_position: u64,
    pub last_used_at: u64,
    pub current_session_id: Option<String>,
    /// Bet of the held session, kept for migration
    pub reserved_bet: u64,
    pub session_rounds_used: u32,
    pub session_expires_at: Option<u64>,
    pub next_slot_queued: bool,
    pub status: SlotStatus,
    pub games_played: u64,
    pub total_winnings: u64,
    pub total_losses: u64,
    pub created_at: u64,
}

impl Document for LiquiditySlot {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

impl LiquiditySlot {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.game_type, &self.token)
    }

    pub fn free_funds(&self) -> u64 {
        self.total_funds.saturating_sub(self.locked_funds)
    }

    pub fn is_idle(&self) -> bool {
        self.current_session_id.is_none()
    }

    /// Funds an owner must keep in the slot for it to stay in rotation
    pub fn minimum_funds(&self) -> u64 {
        (self.safety_multiplier as u64)
            .saturating_mul(self.rounds_per_session as u64)
            .saturating_mul(self.max_single_payout)
    }

    pub fn is_funded(&self) -> bool {
        self.total_funds >= self.minimum_funds()
    }

    /// Whether this slot can back a bet with the given worst-case payout
    pub fn can_back(&self, bet_amount: u64, worst_case: u64) -> bool {
        self.status == SlotStatus::Active
            && self.is_idle()
            && worst_case <= self.max_single_payout
            && self.free_funds() >= bet_amount.saturating_mul(self.safety_multiplier as u64).max(worst_case)
    }

    /// Clear the reservation fields after a session lets go of the slot
    pub(crate) fn clear_hold(&mut self) {
        self.current_session_id = None;
        self.locked_funds = 0;
        self.reserved_bet = 0;
        self.session_rounds_used = 0;
        self.session_expires_at = None;
        self.next_slot_queued = false;
    }
}

/// Owner request to open a slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundSlotRequest {
    pub owner_id: String,
    pub game_type: GameType,
    pub token: Token,
    pub amount: u64,
    pub rounds_per_session: u32,
    pub safety_multiplier: u32,
    pub max_single_payout: u64,
}

pub struct SlotRegistry {
    slots: DocumentStore<LiquiditySlot>,
    position_locks: DashMap<PartitionKey, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
}

impl SlotRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DocumentStore::new("liquidity_slots"),
            position_locks: DashMap::new(),
            clock,
        }
    }

    pub(crate) fn store(&self) -> &DocumentStore<LiquiditySlot> {
        &self.slots
    }

    pub fn get(&self, slot_id: &str) -> HouseResult<LiquiditySlot> {
        self.slots
            .get(slot_id)
            .ok_or_else(|| HouseError::not_found("slot", slot_id))
    }

    pub fn list(&self, partition: &PartitionKey) -> Vec<LiquiditySlot> {
        let mut slots = self.slots.find(|s| &s.partition() == partition);
        slots.sort_by_key(|s| s.queue_position);
        slots
    }

    /// Slot currently holding `session_id`, if any
    pub fn holding(&self, session_id: &str) -> Option<LiquiditySlot> {
        self.slots
            .find_one(|s| s.current_session_id.as_deref() == Some(session_id))
    }

    /// Partitions that have at least one active slot
    pub fn partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self
            .slots
            .find(|s| s.status == SlotStatus::Active)
            .iter()
            .map(|s| s.partition())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Open a new slot at the back of its partition's rotation
    pub fn fund_slot(&self, req: FundSlotRequest) -> HouseResult<LiquiditySlot> {
        if req.amount == 0 {
            return Err(HouseError::Validation("slot funding must be > 0".to_string()));
        }
        if req.rounds_per_session == 0 {
            return Err(HouseError::Validation("rounds_per_session must be > 0".to_string()));
        }
        if req.safety_multiplier == 0 {
            return Err(HouseError::Validation("safety_multiplier must be > 0".to_string()));
        }
        if req.max_single_payout == 0 {
            return Err(HouseError::Validation("max_single_payout must be > 0".to_string()));
        }

        let partition = PartitionKey::new(req.game_type, &req.token);
        let lock = self
            .position_locks
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock
            .lock()
            .map_err(|_| HouseError::Infrastructure("slot position lock poisoned".to_string()))?;

        let queue_position = self
            .slots
            .find(|s| s.partition() == partition)
            .iter()
            .map(|s| s.queue_position)
            .max()
            .unwrap_or(0)
            + 1;

        let now = self.clock.now_millis();
        let slot = LiquiditySlot {
            id: new_id("slot"),
            owner_id: req.owner_id,
            game_type: req.game_type,
            token: req.token,
            total_funds: req.amount,
            locked_funds: 0,
            rounds_per_session: req.rounds_per_session,
            safety_multiplier: req.safety_multiplier,
            max_single_payout: req.max_single_payout,
            queue_position,
            last_used_at: 0,
            current_session_id: None,
            reserved_bet: 0,
            session_rounds_used: 0,
            session_expires_at: None,
            next_slot_queued: false,
            status: SlotStatus::Active,
            games_played: 0,
            total_winnings: 0,
            total_losses: 0,
            created_at: now,
        };
        self.slots.insert_new(slot.clone())?;

        info!(
            slot_id = %slot.id,
            owner_id = %slot.owner_id,
            partition = %partition,
            funds = slot.total_funds,
            queue_position,
            "slot funded"
        );
        Ok(slot)
    }

    /// Add funds; an inactive slot that becomes funded again rejoins rotation
    pub fn top_up(&self, slot_id: &str, owner_id: &str, amount: u64) -> HouseResult<LiquiditySlot> {
        if amount == 0 {
            return Err(HouseError::Validation("top-up must be > 0".to_string()));
        }
        let slot = self
            .slots
            .update_if(
                slot_id,
                |s| s.owner_id == owner_id && s.status != SlotStatus::Failed,
                |s| {
                    s.total_funds = s.total_funds.saturating_add(amount);
                    if s.status == SlotStatus::Inactive && s.is_funded() {
                        s.status = SlotStatus::Active;
                    }
                },
            )
            .map_err(|e| self.owner_error(e, slot_id, "top up"))?;

        info!(slot_id, amount, total = slot.total_funds, "slot topped up");
        Ok(slot)
    }

    /// Deactivate an idle slot and hand its funds back to the owner
    pub fn withdraw(&self, slot_id: &str, owner_id: &str) -> HouseResult<u64> {
        let mut returned = 0;
        self.slots
            .update_if(
                slot_id,
                |s| s.owner_id == owner_id && s.is_idle() && s.locked_funds == 0,
                |s| {
                    returned = s.total_funds;
                    s.total_funds = 0;
                    s.status = SlotStatus::Inactive;
                },
            )
            .map_err(|e| self.owner_error(e, slot_id, "withdraw"))?;

        info!(slot_id, owner_id, amount = returned, "slot withdrawn");
        Ok(returned)
    }

    fn owner_error(&self, err: StoreError, slot_id: &str, op: &str) -> HouseError {
        match err {
            StoreError::ConditionFailed(_) => match self.slots.get(slot_id) {
                Some(s) if !s.is_idle() => HouseError::Validation(format!(
                    "cannot {} slot {} while it holds session {}",
                    op,
                    slot_id,
                    s.current_session_id.unwrap_or_default()
                )),
                Some(s) if s.status == SlotStatus::Failed => {
                    HouseError::invalid_transition("slot", slot_id, s.status, op)
                }
                _ => HouseError::Validation(format!("slot {} is not owned by the caller", slot_id)),
            },
            StoreError::NotFound(_) => HouseError::not_found("slot", slot_id),
            other => other.into(),
        }
    }
}
