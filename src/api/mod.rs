//! HTTP API Service
//!
//! Player session, liquidity owner and monitoring endpoints.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::ApiServer;
