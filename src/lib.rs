//! House Scheduler - liquidity scheduling for house-backed casino games
//!
//! Matches players to owner-funded liquidity slots, queues them when no
//! slot can cover the worst case, and keeps every game state
//! server-authoritative behind signed envelopes.

pub mod api;
pub mod common;
pub mod config;
pub mod errors;
pub mod games;
pub mod lease;
pub mod ledger;
pub mod maintenance;
pub mod metrics;
pub mod scheduler;
pub mod security;
pub mod service;
pub mod session;
pub mod store;

pub use config::HouseConfig;
pub use errors::{HouseError, HouseResult};
pub use service::{HouseDeps, HouseService};
