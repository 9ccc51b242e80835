#![allow(dead_code)]

use house_scheduler::common::clock::ManualClock;
use house_scheduler::common::types::Token;
use house_scheduler::games::types::GameType;
use house_scheduler::games::SchnorrkelOracle;
use house_scheduler::lease::InMemoryLeaseLock;
use house_scheduler::ledger::InMemoryLedger;
use house_scheduler::scheduler::FundSlotRequest;
use house_scheduler::session::CreateSessionRequest;
use house_scheduler::{HouseConfig, HouseDeps, HouseService};
use std::sync::Arc;

pub struct Harness {
    pub service: Arc<HouseService>,
    pub ledger: Arc<InMemoryLedger>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    harness_with(HouseConfig::default())
}

pub fn harness_with(config: HouseConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let ledger = Arc::new(InMemoryLedger::new());
    let deps = HouseDeps {
        ledger: ledger.clone(),
        lease: Arc::new(InMemoryLeaseLock::new(clock.clone())),
        oracle: Arc::new(SchnorrkelOracle::new_random()),
        clock: clock.clone(),
    };
    let service = Arc::new(HouseService::new(config, deps).expect("valid config"));
    Harness { service, ledger, clock }
}

pub fn generous_slot(owner: &str, game_type: GameType) -> FundSlotRequest {
    FundSlotRequest {
        owner_id: owner.to_string(),
        game_type,
        token: Token::sol(),
        amount: 50_000,
        rounds_per_session: 5,
        safety_multiplier: 2,
        max_single_payout: 500,
    }
}

pub fn bet(player: &str, game_type: GameType, amount: u64) -> CreateSessionRequest {
    CreateSessionRequest {
        player_id: player.to_string(),
        game_type,
        token: Token::sol(),
        bet_amount: amount,
        third_party_id: None,
    }
}
