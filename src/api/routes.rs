//! Route Definitions
//!
//! Maps URLs to handlers with type-safe routing.

use super::handlers::*;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Player session endpoints
        .route("/sessions", post(create_session_handler))
        .route("/sessions/:id", get(get_session_handler))
        .route("/sessions/:id/envelope", get(envelope_handler))
        .route("/sessions/:id/moves", post(move_handler))
        .route("/sessions/:id/heartbeat", post(heartbeat_handler))
        .route("/sessions/:id/recover", post(recover_handler))
        .route("/sessions/:id/cancel", post(cancel_handler))
        // Liquidity owner endpoints
        .route("/slots", post(fund_slot_handler).get(list_slots_handler))
        .route("/slots/:id", get(get_slot_handler))
        .route("/slots/:id/top-up", post(top_up_handler))
        .route("/slots/:id/withdraw", post(withdraw_handler))
        .route("/slots/:id/failure", post(slot_failure_handler))
        .route("/players/:id/risk", get(risk_handler))
        .with_state(state)
}
