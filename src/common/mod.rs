//! Common utilities and shared functionality
//!
//! Identifiers, the injected clock, and the collaborator traits every
//! component is written against.

pub mod clock;
pub mod config;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use types::{PartitionKey, PlayerId, SessionId, SlotId, Token};
