//! Liquidity admission: slots, the scheduler that rotates them, and the
//! queue players wait in when no slot is free.

pub mod liquidity;
pub mod queue;
pub mod slots;

pub use liquidity::{LiquidityScheduler, RoundProgress};
pub use queue::{DequeueOutcome, DequeueResult, PlayerQueue, PlayerQueueEntry, QueueEntryStatus};
pub use slots::{FundSlotRequest, LiquiditySlot, SlotRegistry, SlotStatus};
