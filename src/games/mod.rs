pub mod blackjack;
pub mod codec;
pub mod coin_flip;
pub mod engine;
pub mod randomness;
pub mod rps;
pub mod settlement;
pub mod types;
pub mod vrf_engine;

pub use codec::{SignedStateCodec, SignedStateEnvelope};
pub use engine::{MoveOutcome, MoveRequest, SecureGameEngine};
pub use randomness::{RandomnessOrigin, RandomnessRecord, RandomnessSource};
pub use types::*;
pub use vrf_engine::SchnorrkelOracle;
