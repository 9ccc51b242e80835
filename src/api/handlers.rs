//! Request Handlers
//!
//! Thin adapters from HTTP onto [`HouseService`]. Every handler takes the
//! request id from the middleware so errors can be traced end to end.

use super::{errors::ApiError, middleware::RequestId};
use crate::common::types::{PartitionKey, Token};
use crate::games::types::GameType;
use crate::games::{MoveOutcome, MoveRequest, SignedStateEnvelope};
use crate::scheduler::{FundSlotRequest, LiquiditySlot};
use crate::security::RiskProfile;
use crate::service::{CancelResponse, HouseService, SlotFailureOutcome};
use crate::session::{CreateSessionRequest, CreateSessionResponse, GameSession, HeartbeatAck, RecoveryOutcome};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub service: Arc<HouseService>,
    pub version: String,
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn house_err(request_id: &RequestId) -> impl FnOnce(crate::errors::HouseError) -> ApiError + '_ {
    move |e| ApiError::from_house(request_id.0.clone(), e)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerBody {
    pub player_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverBody {
    pub player_id: String,
    pub transport_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerQuery {
    pub player_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerBody {
    pub owner_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopUpBody {
    pub owner_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawResponse {
    pub slot_id: String,
    pub withdrawn: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlotsQuery {
    pub game_type: GameType,
    pub token: String,
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
    })
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.service.metrics_text(),
    )
        .into_response()
}

/// POST /sessions
pub async fn create_session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let created = state.service.create_session(req).await.map_err(house_err(&request_id))?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /sessions/:id
pub async fn get_session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<GameSession> {
    state
        .service
        .get_session(&session_id)
        .map(Json)
        .map_err(house_err(&request_id))
}

/// GET /sessions/:id/envelope?player_id=
pub async fn envelope_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<PlayerQuery>,
) -> ApiResult<SignedStateEnvelope> {
    state
        .service
        .current_envelope(&session_id, &query.player_id)
        .map(Json)
        .map_err(house_err(&request_id))
}

/// POST /sessions/:id/moves
pub async fn move_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<MoveRequest>,
) -> ApiResult<MoveOutcome> {
    state
        .service
        .submit_move(&session_id, req)
        .await
        .map(Json)
        .map_err(house_err(&request_id))
}

/// POST /sessions/:id/heartbeat
pub async fn heartbeat_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(body): Json<PlayerBody>,
) -> ApiResult<HeartbeatAck> {
    state
        .service
        .heartbeat(&session_id, &body.player_id)
        .map(Json)
        .map_err(house_err(&request_id))
}

/// POST /sessions/:id/recover
pub async fn recover_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(body): Json<RecoverBody>,
) -> ApiResult<RecoveryOutcome> {
    if body.transport_id.is_empty() {
        return Err(ApiError::bad_request(request_id.0, "transport_id is required".to_string()));
    }
    state
        .service
        .recover_session(&session_id, &body.player_id, &body.transport_id)
        .await
        .map(Json)
        .map_err(house_err(&request_id))
}

/// POST /sessions/:id/cancel
pub async fn cancel_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(body): Json<PlayerBody>,
) -> ApiResult<CancelResponse> {
    state
        .service
        .cancel_session(&session_id, &body.player_id)
        .await
        .map(Json)
        .map_err(house_err(&request_id))
}

/// POST /slots
pub async fn fund_slot_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<FundSlotRequest>,
) -> Result<(StatusCode, Json<LiquiditySlot>), ApiError> {
    let slot = state.service.fund_slot(req).map_err(house_err(&request_id))?;
    Ok((StatusCode::CREATED, Json(slot)))
}

/// GET /slots?game_type=&token=
pub async fn list_slots_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SlotsQuery>,
) -> Json<Vec<LiquiditySlot>> {
    let partition = PartitionKey::new(query.game_type, &Token::new(query.token));
    Json(state.service.list_slots(&partition))
}

/// GET /slots/:id
pub async fn get_slot_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
) -> ApiResult<LiquiditySlot> {
    state
        .service
        .get_slot(&slot_id)
        .map(Json)
        .map_err(house_err(&request_id))
}

/// POST /slots/:id/top-up
pub async fn top_up_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
    Json(body): Json<TopUpBody>,
) -> ApiResult<LiquiditySlot> {
    state
        .service
        .top_up(&slot_id, &body.owner_id, body.amount)
        .await
        .map(Json)
        .map_err(house_err(&request_id))
}

/// POST /slots/:id/withdraw
pub async fn withdraw_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
    Json(body): Json<OwnerBody>,
) -> ApiResult<WithdrawResponse> {
    let withdrawn = state
        .service
        .withdraw(&slot_id, &body.owner_id)
        .map_err(house_err(&request_id))?;
    Ok(Json(WithdrawResponse { slot_id, withdrawn }))
}

/// POST /slots/:id/failure
pub async fn slot_failure_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
) -> ApiResult<SlotFailureOutcome> {
    state
        .service
        .report_slot_failure(&slot_id)
        .await
        .map(Json)
        .map_err(house_err(&request_id))
}

/// GET /players/:id/risk
pub async fn risk_handler(
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
) -> Json<RiskProfile> {
    Json(state.service.risk_profile(&player_id))
}
